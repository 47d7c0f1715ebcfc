//! Collection materialization and many-to-many membership.
//!
//! A collection is read once per object and kept on the owner. The
//! database result is corrected by what the transaction holds in memory:
//! changed foreign keys, new children and queued relation changes.

use std::collections::HashSet;
use std::sync::Arc;

use sqlobject_core::{CollectionInfo, CollectionKind, Error, Result, Schema, Tuple, TypeError, Value};
use sqlobject_query::{Expr, OrderBy, Query};

use crate::Transaction;
use crate::object::{DataObject, ObjectFlags, ObjectId};
use crate::relation::{RelationChange, RelationOp};

/// One equality a member must satisfy: (ordinal, table-group, value).
type Condition = (usize, usize, Value);

/// Whether `obj` is known to be a member (`Some(true)`), known not to be
/// (`Some(false)`), or undecidable from loaded state (`None`).
fn membership(schema: &Schema, obj: &DataObject, class: &str, conds: &[Condition]) -> Option<bool> {
    if obj.is_marked_for_delete() {
        return Some(false);
    }
    if !schema.is_subclass(&obj.class, class) {
        if !obj.class_resolved && schema.is_subclass(class, &obj.class) {
            return None;
        }
        return Some(false);
    }
    let mut known = true;
    for (ordinal, group, value) in conds {
        if obj.is_insert_mode() || obj.load_mask.contains(*group) {
            if obj.raw_value(*ordinal) != value {
                return Some(false);
            }
        } else {
            known = false;
        }
    }
    known.then_some(true)
}

fn scalar_key(obj: &DataObject) -> Result<Value> {
    let key = obj
        .key
        .as_ref()
        .ok_or_else(|| Error::Custom(format!("{} object has no key yet", obj.class)))?;
    key.as_scalar().cloned().ok_or_else(|| {
        Error::unsupported("composite collection key", "collections need single-field keys")
    })
}

impl Transaction {
    fn collection_info(&mut self, id: ObjectId, name: &str) -> Result<CollectionInfo> {
        let class = self.class_of(id)?;
        let info = self.schema.class(&class)?;
        info.collection(name)
            .cloned()
            .ok_or_else(|| Error::unresolved(name, &info.name))
    }

    /// Members of collection `name` of `id`.
    ///
    /// Read from the database on first access, then kept on the owner and
    /// updated as references and relation tuples change.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    pub fn collection(&mut self, id: ObjectId, name: &str) -> Result<Vec<ObjectId>> {
        let collection = self.collection_info(id, name)?;
        let owner = self.obj(id)?;
        if let Some(members) = owner.collections.get(name) {
            return Ok(members.clone());
        }
        let Some(key) = owner.key.as_ref().and_then(Tuple::as_scalar).cloned() else {
            return Ok(Vec::new());
        };
        let unwritten =
            owner.is_insert_mode() && !owner.flags.contains(ObjectFlags::WRITTEN_INTO_DATABASE);

        let members = match &collection.kind {
            CollectionKind::OneToMany { child, foreign_key } => {
                self.load_children(&collection, child, foreign_key, key, unwritten)?
            }
            CollectionKind::ManyToMany { relation, reversed } => {
                let class = self.obj(id)?.class.clone();
                self.load_linked(&collection, &class, relation, *reversed, key, unwritten)?
            }
        };
        tracing::debug!(object = %id, collection = name, members = members.len(), "collection materialized");
        self.obj_mut(id)?
            .collections
            .insert(name.to_string(), members.clone());
        Ok(members)
    }

    fn load_children(
        &mut self,
        collection: &CollectionInfo,
        child: &str,
        foreign_key: &str,
        key: Value,
        unwritten: bool,
    ) -> Result<Vec<ObjectId>> {
        let schema = Arc::clone(&self.schema);
        let target = schema.class(child)?;
        let fk = target
            .field(foreign_key)
            .ok_or_else(|| Error::unresolved(foreign_key, &target.name))?;
        let mut conds: Vec<Condition> = vec![(fk.ordinal, fk.table_group, key.clone())];
        for (name, value) in &collection.filter {
            let field = target
                .field(name)
                .ok_or_else(|| Error::unresolved(name, &target.name))?;
            conds.push((field.ordinal, field.table_group, field.sql_type.coerce(value.clone())?));
        }

        let mut members = Vec::new();
        let mut seen = HashSet::new();
        if !unwritten {
            let mut query = Query::from(child, "c").filter(
                Expr::path(&format!("c.{}", fk.name)).eq(Expr::typed_param(0, fk.sql_type)),
            );
            for (name, value) in &collection.filter {
                query = query.filter(Expr::path(&format!("c.{name}")).eq(Expr::lit(value.clone())));
            }
            for field in target.key_fields() {
                query = query.order_by(OrderBy::asc(Expr::path(&format!("c.{}", field.name))));
            }
            for id in self.query_objects(&query, std::slice::from_ref(&key))? {
                let obj = self.registry.get(id)?;
                if membership(&schema, obj, child, &conds) != Some(false) && seen.insert(id) {
                    members.push(id);
                }
            }
        }
        for id in self.registry.resident_ids() {
            let Some(obj) = self.registry.try_get(id) else {
                continue;
            };
            if membership(&schema, obj, child, &conds) == Some(true) && seen.insert(id) {
                members.push(id);
            }
        }
        Ok(members)
    }

    fn load_linked(
        &mut self,
        collection: &CollectionInfo,
        owner_class: &str,
        relation: &str,
        reversed: bool,
        key: Value,
        unwritten: bool,
    ) -> Result<Vec<ObjectId>> {
        let mut members = Vec::new();
        if !unwritten {
            let owner_key = self
                .schema
                .class(owner_class)?
                .key_fields()
                .next()
                .map(|f| f.sql_type)
                .ok_or_else(|| Error::unresolved("key", owner_class))?;
            let query = Query::from(&collection.target, "t")
                .also_from(owner_class, "o")
                .filter(Expr::contains(&format!("o.{}", collection.name), Expr::path("t")))
                .filter(Expr::path("o").eq(Expr::typed_param(0, owner_key)));
            members = self.query_objects(&query, std::slice::from_ref(&key))?;
        }

        // Replay changes not yet written.
        let pending: Vec<RelationChange> = self.relations.pending_for(relation).cloned().collect();
        for change in pending {
            let (owner_side, member_side) = if reversed {
                (&change.right, &change.left)
            } else {
                (&change.left, &change.right)
            };
            if owner_side != &key {
                continue;
            }
            let member = self.get(&collection.target, Tuple::new(vec![member_side.clone()]))?;
            match change.op {
                RelationOp::Add => {
                    if !members.contains(&member) {
                        members.push(member);
                    }
                }
                RelationOp::Remove => members.retain(|m| *m != member),
            }
        }
        members.retain(|m| {
            self.registry
                .try_get(*m)
                .is_none_or(|o| !o.is_marked_for_delete())
        });
        Ok(members)
    }

    /// Add `member` to collection `name` of `owner`.
    ///
    /// Many-to-many links are queued for the next flush; one-to-many links
    /// point the member's foreign key at the owner.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    pub fn link(&mut self, owner: ObjectId, name: &str, member: ObjectId) -> Result<()> {
        self.change_membership(owner, name, member, RelationOp::Add)
    }

    /// Remove `member` from collection `name` of `owner`.
    ///
    /// For a one-to-many collection this nulls the member's foreign key.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    pub fn unlink(&mut self, owner: ObjectId, name: &str, member: ObjectId) -> Result<()> {
        self.change_membership(owner, name, member, RelationOp::Remove)
    }

    fn change_membership(
        &mut self,
        owner: ObjectId,
        name: &str,
        member: ObjectId,
        op: RelationOp,
    ) -> Result<()> {
        let collection = self.collection_info(owner, name)?;
        let member_class = self.class_of(member)?;
        if !self.schema.is_subclass(&member_class, &collection.target) {
            return Err(Error::Type(TypeError {
                expected: "an instance of the collection's member class",
                actual: member_class,
                field: Some(collection.name.clone()),
            }));
        }

        let (relation, reversed) = match &collection.kind {
            CollectionKind::OneToMany { foreign_key, .. } => {
                let field = self.field_info(member, foreign_key)?;
                let target = match op {
                    RelationOp::Add => Some(owner),
                    RelationOp::Remove => {
                        let current = self.value(member, foreign_key)?;
                        let owner_key = scalar_key(self.obj(owner)?)?;
                        if current != owner_key {
                            return Ok(());
                        }
                        None
                    }
                };
                return self.set_reference(member, &field.name, target);
            }
            CollectionKind::ManyToMany { relation, reversed } => (relation.clone(), *reversed),
        };

        let owner_key = scalar_key(self.obj(owner)?)?;
        let member_key = scalar_key(self.obj(member)?)?;
        let (left, right) = if reversed {
            (member_key, owner_key)
        } else {
            (owner_key, member_key)
        };
        self.record_relation(&relation, op, left, right);

        self.update_materialized(owner, &collection.name, member, op);
        let schema = Arc::clone(&self.schema);
        let member_info = schema.class(&member_class)?;
        for back in &member_info.collections {
            let opposite = matches!(
                &back.kind,
                CollectionKind::ManyToMany { relation: r, reversed: rev } if *r == relation && *rev != reversed
            );
            if opposite {
                self.update_materialized(member, &back.name, owner, op);
            }
        }
        Ok(())
    }

    fn update_materialized(&mut self, id: ObjectId, name: &str, member: ObjectId, op: RelationOp) {
        let Ok(obj) = self.registry.get_mut(id) else {
            return;
        };
        if let Some(members) = obj.collections.get_mut(name) {
            match op {
                RelationOp::Add => {
                    if !members.contains(&member) {
                        members.push(member);
                    }
                }
                RelationOp::Remove => members.retain(|m| *m != member),
            }
        }
    }

    /// Queue a relation tuple change and log it for serialization.
    pub(crate) fn record_relation(&mut self, relation: &str, op: RelationOp, left: Value, right: Value) {
        if self.relations.record(relation, op, left.clone(), right.clone()) {
            tracing::trace!(relation, ?op, %left, %right, "relation change queued");
            self.relation_log.push(RelationChange {
                relation: relation.to_string(),
                op,
                left,
                right,
            });
            self.precommitted.remove(relation);
        }
    }
}
