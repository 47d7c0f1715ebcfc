//! Change-log serialization.
//!
//! A [`ChangeLog`] captures every mutation of a transaction since its last
//! commit: one record per new, changed or deleted object, plus the relation
//! tuple changes. Applying it to a fresh transaction over the same data
//! reproduces the same field mutations.

use serde::{Deserialize, Serialize};
use sqlobject_core::{Result, Tuple, Value};

use crate::Transaction;
use crate::relation::RelationOp;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordMode {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRecord {
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectRecord {
    pub class: String,
    pub mode: RecordMode,
    pub key: Vec<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationRecord {
    pub relation: String,
    pub op: RelationOp,
    pub left: Value,
    pub right: Value,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChangeLog {
    #[serde(default)]
    pub objects: Vec<ObjectRecord>,
    #[serde(default)]
    pub relations: Vec<RelationRecord>,
}

impl ChangeLog {
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty() && self.relations.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl Transaction {
    /// Record every change made since the last commit.
    ///
    /// Inserts and updates carry the fields changed since the last commit,
    /// or every loaded field under full serialization. Key fields travel in
    /// the key block only.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    pub fn serialize_changes(&self) -> Result<ChangeLog> {
        let full = self.config.full_serialization;
        let mut log = ChangeLog::default();
        for id in self.registry.resident_ids() {
            let Some(obj) = self.registry.try_get(id) else {
                continue;
            };
            if obj.is_marked_for_delete() {
                continue;
            }
            let mode = if obj.is_insert_mode() {
                RecordMode::Insert
            } else if !obj.changed.is_empty() {
                RecordMode::Update
            } else {
                continue;
            };
            let Some(key) = &obj.key else {
                continue;
            };
            let info = self.schema.class(&obj.class)?;
            let fields = info
                .fields
                .iter()
                .filter(|f| !f.primary_key)
                .filter(|f| {
                    if full {
                        obj.is_insert_mode() || obj.load_mask.contains(f.table_group)
                    } else {
                        obj.changed.contains(f.ordinal)
                    }
                })
                .map(|f| FieldRecord {
                    name: f.name.clone(),
                    value: obj.raw_value(f.ordinal).clone(),
                })
                .collect();
            log.objects.push(ObjectRecord {
                class: obj.class.clone(),
                mode,
                key: key.values().to_vec(),
                fields,
            });
        }
        log.objects.extend(self.deleted.iter().map(|d| ObjectRecord {
            class: d.class.clone(),
            mode: RecordMode::Delete,
            key: d.key.values().to_vec(),
            fields: Vec::new(),
        }));
        log.relations = self
            .relation_log
            .iter()
            .map(|c| RelationRecord {
                relation: c.relation.clone(),
                op: c.op,
                left: c.left.clone(),
                right: c.right.clone(),
            })
            .collect();
        tracing::debug!(
            objects = log.objects.len(),
            relations = log.relations.len(),
            "changes serialized"
        );
        Ok(log)
    }

    /// Replay `log` into this transaction with triggers suppressed.
    ///
    /// Objects are created or fetched first, then relation changes are
    /// queued, then deletes run. A delete already performed here, for
    /// example by an earlier cascade, is skipped.
    #[tracing::instrument(level = "debug", skip(self, log), fields(txn = self.id))]
    pub fn apply_changes(&mut self, log: &ChangeLog) -> Result<()> {
        self.with_triggers_suppressed(|txn| {
            for record in &log.objects {
                let key = Tuple::new(record.key.clone());
                let id = match record.mode {
                    RecordMode::Insert => txn.create_with_key(&record.class, key)?,
                    RecordMode::Update => txn.get(&record.class, key)?,
                    RecordMode::Delete => continue,
                };
                for field in &record.fields {
                    txn.set_value(id, &field.name, field.value.clone())?;
                }
            }
            for relation in &log.relations {
                txn.schema.relation(&relation.relation)?;
                txn.record_relation(
                    &relation.relation,
                    relation.op,
                    relation.left.clone(),
                    relation.right.clone(),
                );
            }
            for record in log.objects.iter().filter(|r| r.mode == RecordMode::Delete) {
                let info = txn.schema.class(&record.class)?;
                let key = Tuple::new(record.key.clone());
                let done = txn.deleted.iter().any(|d| {
                    d.key == key
                        && txn
                            .schema
                            .get_class(&d.class)
                            .is_some_and(|c| c.root == info.root)
                });
                if done {
                    continue;
                }
                let id = txn.get(&record.class, key)?;
                txn.mark_for_delete(id)?;
            }
            Ok(())
        })
    }
}
