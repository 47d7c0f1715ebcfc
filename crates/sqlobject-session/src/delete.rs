//! The delete protocol.
//!
//! Marking an object walks the references pointing at it and applies each
//! field's delete action. The marked set is then written right away as its
//! own flush: nullified referrers first, then relation tuples and the
//! table-group rows of every marked object.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use sqlobject_core::{DeleteAction, FieldInfo, InvalidationReason, Result, Tuple, Value};
use sqlobject_query::{Expr, Query};

use crate::Transaction;
use crate::commit::Selection;
use crate::datasource::WriteOp;
use crate::hooks::ObjectEvent;
use crate::object::{ObjectFlags, ObjectId};
use crate::transaction::DeletedRecord;

impl Transaction {
    /// Delete an object and apply the delete actions of references to it.
    ///
    /// Cascaded objects are deleted too; nullified referrers are written
    /// before any delete statement runs. After-delete hooks fire once the
    /// statements succeeded, then every handle of a deleted object is dead.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    pub fn mark_for_delete(&mut self, id: ObjectId) -> Result<()> {
        let journal = self.deleted.len();
        let mut doomed = Vec::new();
        let mut nullified = Vec::new();
        if let Err(err) = self.mark_recursive(id, &mut doomed, &mut nullified) {
            for &d in &doomed {
                if let Ok(obj) = self.obj_mut(d) {
                    obj.flags.remove(ObjectFlags::MARKED_FOR_DELETE);
                }
            }
            self.deleted.truncate(journal);
            return Err(err);
        }
        tracing::debug!(
            doomed = doomed.len(),
            nullified = nullified.len(),
            "delete set collected"
        );
        self.flush_deletes(&doomed, &nullified)
    }

    fn mark_recursive(
        &mut self,
        id: ObjectId,
        doomed: &mut Vec<ObjectId>,
        nullified: &mut Vec<ObjectId>,
    ) -> Result<()> {
        if self.obj(id)?.is_marked_for_delete() {
            return Ok(());
        }
        let schema = Arc::clone(&self.schema);
        self.ensure_group(id, 0)?;
        let class = self.class_of(id)?;
        let info = schema.class(&class)?;

        let obj = self.obj_mut(id)?;
        obj.flags.insert(ObjectFlags::MARKED_FOR_DELETE);
        let unwritten =
            obj.is_insert_mode() && !obj.flags.contains(ObjectFlags::WRITTEN_INTO_DATABASE);
        let key = obj.key.clone();
        if !obj.is_insert_mode() {
            if let Some(key) = &key {
                self.deleted.push(DeletedRecord {
                    class: class.clone(),
                    key: key.clone(),
                });
            }
        }
        doomed.push(id);
        self.fire(id, ObjectEvent::BeforeDelete)?;

        let Some(value) = key.as_ref().and_then(Tuple::as_scalar).cloned() else {
            return Ok(());
        };
        for inbound in &info.inbound {
            let Some(field) = schema
                .get_class(&inbound.class)
                .and_then(|c| c.field(&inbound.field))
                .cloned()
            else {
                continue;
            };
            if field.delete_action == DeleteAction::None {
                continue;
            }
            let referencing = self.find_referencing(&inbound.class, &field, &value, unwritten)?;
            for r in referencing {
                if self.obj(r)?.is_marked_for_delete() {
                    continue;
                }
                match field.delete_action {
                    DeleteAction::Cascade => self.mark_recursive(r, doomed, nullified)?,
                    DeleteAction::Nullify => {
                        self.write_field(r, &field, Value::Null, Some(None))?;
                        nullified.push(r);
                    }
                    DeleteAction::None => {}
                }
            }
        }
        Ok(())
    }

    /// Objects of `class` whose `field` holds `value`, from the database
    /// and from memory.
    ///
    /// Loaded values win over stored ones.
    fn find_referencing(
        &mut self,
        class: &str,
        field: &FieldInfo,
        value: &Value,
        memory_only: bool,
    ) -> Result<Vec<ObjectId>> {
        let schema = Arc::clone(&self.schema);
        let mut found = Vec::new();
        let mut seen = HashSet::new();
        let holds = |txn: &Transaction, id: ObjectId| {
            txn.registry.try_get(id).is_some_and(|o| {
                (o.is_insert_mode() || o.load_mask.contains(field.table_group))
                    && schema.is_subclass(&o.class, class)
                    && o.raw_value(field.ordinal) == value
            })
        };

        if !memory_only {
            let query = Query::from(class, "r").filter(
                Expr::path(&format!("r.{}", field.name))
                    .eq(Expr::typed_param(0, field.sql_type)),
            );
            for key in self.query_keys(&query, std::slice::from_ref(value))? {
                let id = self.get(class, key)?;
                let obj = self.obj(id)?;
                let stale = obj.load_mask.contains(field.table_group) && !holds(self, id);
                if !stale && seen.insert(id) {
                    found.push(id);
                }
            }
        }
        for id in self.registry.resident_ids() {
            if holds(self, id) && seen.insert(id) {
                found.push(id);
            }
        }
        tracing::trace!(class, field = %field.name, found = found.len(), "referencing objects");
        Ok(found)
    }

    /// Write the delete set: nullified referrers, relation tuples, then
    /// table-group rows in reverse group order.
    fn flush_deletes(&mut self, doomed: &[ObjectId], nullified: &[ObjectId]) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let pending: HashSet<ObjectId> = nullified
            .iter()
            .copied()
            .filter(|id| {
                self.registry
                    .try_get(*id)
                    .is_some_and(|o| !o.is_marked_for_delete())
            })
            .collect();
        if !pending.is_empty() {
            self.flush(&Selection::Objects(pending))?;
        }

        let mut written = Vec::new();
        let mut relation_tables = BTreeSet::new();
        for &id in doomed.iter().rev() {
            let obj = self.obj(id)?;
            if obj.is_insert_mode() && !obj.flags.contains(ObjectFlags::WRITTEN_INTO_DATABASE) {
                continue;
            }
            let info = schema.class(&obj.class)?;
            let (index, key_columns, key) = self.key_block(id)?;
            if let [value] = key.as_slice() {
                for (relation, column) in schema.relations_of(&info.name) {
                    let relation_index = self.source_index(schema.class(&relation.left_class)?)?;
                    self.write_op(
                        relation_index,
                        &WriteOp::UnlinkAll {
                            table: relation.table.clone(),
                            column: column.to_string(),
                            value: value.clone(),
                        },
                    )?;
                    self.relations
                        .forget(&relation.table, column == relation.left_column, value);
                    relation_tables.insert(relation.table.clone());
                }
            }
            for table in info.tables.iter().rev() {
                self.write_op(
                    index,
                    &WriteOp::Delete {
                        table: table.name.clone(),
                        key_columns: key_columns.clone(),
                        key: key.clone(),
                    },
                )?;
            }
            written.push(id);
        }
        self.finish_batches()?;
        tracing::debug!(rows = written.len(), "delete statements executed");

        let mut first_error = None;
        for &id in doomed {
            if let Err(err) = self.fire(id, ObjectEvent::AfterDelete) {
                first_error.get_or_insert(err);
            }
        }

        self.invalidate_deleted(&written, &relation_tables);
        self.forget_objects(doomed)?;
        first_error.map_or(Ok(()), Err)
    }

    fn invalidate_deleted(&mut self, written: &[ObjectId], relation_tables: &BTreeSet<String>) {
        let cache = Arc::clone(&self.cache);
        let _guard = cache.lock();
        let mut classes = BTreeSet::new();
        for &id in written {
            let Some(obj) = self.registry.try_get(id) else {
                continue;
            };
            let Some(info) = self.schema.get_class(&obj.class) else {
                continue;
            };
            if let Some(key) = &obj.key {
                cache.invalidate(&info.root, key, InvalidationReason::Deleted);
            }
            classes.insert(info.name.clone());
            classes.extend(info.ancestors.iter().cloned());
        }
        for name in classes.iter().chain(relation_tables) {
            cache.invalidate_collections(name);
        }
    }

    /// Kill the handles of deleted objects and drop them from every
    /// collection and reference cache.
    fn forget_objects(&mut self, doomed: &[ObjectId]) -> Result<()> {
        let gone: HashSet<ObjectId> = doomed.iter().copied().collect();
        for &id in doomed {
            let root = match self.registry.try_get(id) {
                Some(obj) => self
                    .schema
                    .get_class(&obj.class)
                    .map_or_else(|| obj.class.clone(), |c| c.root.clone()),
                None => continue,
            };
            self.registry.discard(id, &root)?;
        }
        self.dirty.retain(|id| !gone.contains(id));
        self.post_commit.retain(|id| !gone.contains(id));
        for obj in self.registry.resident_mut() {
            for members in obj.collections.values_mut() {
                members.retain(|m| !gone.contains(m));
            }
            for target in &mut obj.refs {
                if target.is_some_and(|t| gone.contains(&t)) {
                    *target = None;
                }
            }
        }
        Ok(())
    }
}
