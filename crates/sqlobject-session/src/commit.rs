//! Commit, precommit and rollback.
//!
//! A flush runs the before-commit hooks, validates, and persists the
//! selected dirty objects and relation changes through batched saves.
//! Commit flushes everything, commits every open session, invalidates the
//! cache, runs the after-commit hooks and resets per-commit state.
//! Precommit is a flush of a subset without the session commit.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use sqlobject_core::{
    CyclicReferenceError, Error, InvalidationReason, NullConstraintError, Result, Tuple, Value,
};

use crate::Transaction;
use crate::datasource::WriteOp;
use crate::hooks::ObjectEvent;
use crate::object::{ObjectFlags, ObjectId};
use crate::relation::{RelationChange, RelationOp};
use crate::transaction::key_text;

/// Which pending changes a flush covers.
#[derive(Debug, Clone)]
pub(crate) enum Selection {
    All,
    /// Objects of these hierarchy roots
    Roots(HashSet<String>),
    /// Changes of these relation tables
    Relations(HashSet<String>),
    Objects(HashSet<ObjectId>),
}

impl Selection {
    fn object(&self, root: &str, id: ObjectId) -> bool {
        match self {
            Selection::All => true,
            Selection::Roots(roots) => roots.contains(root),
            Selection::Objects(ids) => ids.contains(&id),
            Selection::Relations(_) => false,
        }
    }

    fn relation(&self, relation: &str) -> bool {
        match self {
            Selection::All => true,
            Selection::Relations(relations) => relations.contains(relation),
            Selection::Roots(_) | Selection::Objects(_) => false,
        }
    }
}

/// Dependency of one new object on another through a reference field.
#[derive(Debug)]
struct Edge {
    /// Position of the referencing object
    from: usize,
    /// Position of the referenced object
    to: usize,
    ordinal: usize,
    nullable: bool,
    active: bool,
}

#[derive(Debug, Default)]
struct InsertPlan {
    order: Vec<ObjectId>,
    /// Reference fields inserted as NULL and written by a follow-up update
    deferred: Vec<(ObjectId, usize)>,
}

/// Whether `goal` is reachable from `start` over active edges between
/// unplaced objects.
fn reaches(edges: &[Edge], placed: &[bool], start: usize, goal: usize) -> bool {
    let mut stack = vec![start];
    let mut seen = vec![false; placed.len()];
    while let Some(node) = stack.pop() {
        if node == goal {
            return true;
        }
        if std::mem::replace(&mut seen[node], true) {
            continue;
        }
        stack.extend(
            edges
                .iter()
                .filter(|e| e.active && e.from == node && !placed[e.to])
                .map(|e| e.to),
        );
    }
    false
}

fn on_cycle(edges: &[Edge], placed: &[bool], edge: &Edge) -> bool {
    edge.active && !placed[edge.from] && !placed[edge.to] && reaches(edges, placed, edge.to, edge.from)
}

impl Transaction {
    /// Write every pending change and commit every open session.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    pub fn commit(&mut self) -> Result<()> {
        let written = self.flush(&Selection::All)?;
        tracing::debug!(written = written.len(), "changes persisted");
        self.commit_sessions()?;

        let queue = self.post_commit_queue();
        self.invalidate_cache(&queue);
        self.run_post_commit(&queue)?;
        self.reset_after_commit(&queue);
        tracing::debug!(objects = queue.len(), "transaction committed");
        Ok(())
    }

    /// Flush pending changes of `classes` so queries in this transaction
    /// see them.
    ///
    /// New objects they reference are written first. Hierarchies flushed
    /// since their last change are skipped. An object changed again after
    /// a precommit runs its before-update hook once more when next flushed.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    pub fn precommit(&mut self, classes: &[&str]) -> Result<()> {
        let mut roots = HashSet::new();
        for class in classes {
            let root = &self.schema.class(class)?.root;
            if !self.precommitted.contains(root) {
                roots.insert(root.clone());
            }
        }
        if roots.is_empty() {
            return Ok(());
        }
        let written = self.flush(&Selection::Roots(roots.clone()))?;
        tracing::debug!(written = written.len(), "precommitted");
        self.precommitted.extend(roots);
        Ok(())
    }

    /// Flush queued tuple changes of the given relation tables.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    pub fn precommit_relations(&mut self, relations: &[&str]) -> Result<()> {
        let mut pending = HashSet::new();
        for relation in relations {
            let table = &self.schema.relation(relation)?.table;
            if !self.precommitted.contains(table) {
                pending.insert(table.clone());
            }
        }
        if pending.is_empty() {
            return Ok(());
        }
        self.flush(&Selection::Relations(pending.clone()))?;
        self.precommitted.extend(pending);
        Ok(())
    }

    /// Before-commit hooks, validation and persist for `selection`.
    ///
    /// Returns the objects written.
    pub(crate) fn flush(&mut self, selection: &Selection) -> Result<Vec<ObjectId>> {
        let targets = self.run_before_commit(selection)?;
        self.validate(&targets)?;
        let changes = self.relations.take(|r| selection.relation(r));
        if targets.is_empty() && changes.is_empty() {
            return Ok(targets);
        }
        if let Err(err) = self.persist(&targets, &changes) {
            for slot in &mut self.sources {
                slot.batching = false;
            }
            self.relations.restore(changes);
            return Err(err);
        }
        // changes made after a precommit get their before-hooks again
        for &id in &targets {
            if let Ok(obj) = self.registry.get_mut(id) {
                obj.flags.remove(ObjectFlags::VISITED_ON_COMMIT);
            }
        }
        Ok(targets)
    }

    /// Run before-insert/before-update once per object, then return the
    /// objects to write.
    ///
    /// Objects dirtied by hooks join the same pass.
    fn run_before_commit(&mut self, selection: &Selection) -> Result<Vec<ObjectId>> {
        loop {
            let mut i = 0;
            while i < self.dirty.len() {
                let id = self.dirty[i];
                i += 1;
                if self.needs_before_hook(id, selection) {
                    self.visit(id)?;
                }
            }
            let targets = self.pending_writes(selection)?;
            let unvisited: Vec<ObjectId> = targets
                .iter()
                .copied()
                .filter(|id| {
                    self.registry
                        .try_get(*id)
                        .is_some_and(|o| !o.flags.contains(ObjectFlags::VISITED_ON_COMMIT))
                })
                .collect();
            if unvisited.is_empty() {
                return Ok(targets);
            }
            for id in unvisited {
                self.visit(id)?;
            }
        }
    }

    fn needs_before_hook(&self, id: ObjectId, selection: &Selection) -> bool {
        let Some(obj) = self.registry.try_get(id) else {
            return false;
        };
        obj.is_dirty()
            && !obj.is_marked_for_delete()
            && !obj.flags.contains(ObjectFlags::VISITED_ON_COMMIT)
            && self
                .schema
                .get_class(&obj.class)
                .is_some_and(|c| selection.object(&c.root, id))
    }

    fn visit(&mut self, id: ObjectId) -> Result<()> {
        let obj = self.obj_mut(id)?;
        let event = if obj.is_insert_mode() && !obj.flags.contains(ObjectFlags::WRITTEN_INTO_DATABASE) {
            ObjectEvent::BeforeInsert
        } else {
            ObjectEvent::BeforeUpdate
        };
        obj.flags.insert(ObjectFlags::VISITED_ON_COMMIT);
        self.fire(id, event)
    }

    /// Dirty objects in `selection`, followed by the unwritten new objects
    /// they reference.
    fn pending_writes(&self, selection: &Selection) -> Result<Vec<ObjectId>> {
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for &id in &self.dirty {
            let Some(obj) = self.registry.try_get(id) else {
                continue;
            };
            if !obj.is_dirty() || obj.is_marked_for_delete() {
                continue;
            }
            let root = &self.schema.class(&obj.class)?.root;
            if selection.object(root, id) && seen.insert(id) {
                out.push(id);
            }
        }
        let mut i = 0;
        while i < out.len() {
            for target in self.unwritten_targets(out[i])? {
                if seen.insert(target) {
                    out.push(target);
                }
            }
            i += 1;
        }
        Ok(out)
    }

    /// New objects without a row that `id` references.
    fn unwritten_targets(&self, id: ObjectId) -> Result<Vec<ObjectId>> {
        let obj = self.registry.get(id)?;
        let info = self.schema.class(&obj.class)?;
        let mut out = Vec::new();
        for field in info.reference_fields() {
            let value = obj.raw_value(field.ordinal);
            let Some(target) = field.references.as_deref() else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let root = &self.schema.class(target)?.root;
            let Some(target) = self.registry.lookup(root, &Tuple::new(vec![value.clone()])) else {
                continue;
            };
            if self.registry.try_get(target).is_some_and(|t| {
                t.is_insert_mode()
                    && !t.flags.contains(ObjectFlags::WRITTEN_INTO_DATABASE)
                    && !t.is_marked_for_delete()
            }) {
                out.push(target);
            }
        }
        Ok(out)
    }

    /// Non-nullable loaded fields must hold values and new objects need a
    /// complete key.
    fn validate(&self, targets: &[ObjectId]) -> Result<()> {
        for &id in targets {
            let obj = self.registry.get(id)?;
            let info = self.schema.class(&obj.class)?;
            let violation = |field: &str| {
                Error::NullConstraint(NullConstraintError {
                    class: info.name.clone(),
                    key: key_text(obj.key.as_ref()),
                    field: field.to_string(),
                })
            };
            if obj.key.is_none() {
                let missing = info
                    .key_fields()
                    .find(|f| !obj.key_assigned.contains(f.ordinal))
                    .map_or("", |f| f.name.as_str());
                return Err(violation(missing));
            }
            for field in &info.fields {
                if field.nullable || field.primary_key || !obj.load_mask.contains(field.table_group) {
                    continue;
                }
                if obj.raw_value(field.ordinal).is_null() {
                    return Err(violation(&field.name));
                }
            }
        }
        Ok(())
    }

    fn persist(&mut self, targets: &[ObjectId], changes: &[RelationChange]) -> Result<()> {
        let (inserts, updates): (Vec<ObjectId>, Vec<ObjectId>) =
            targets.iter().copied().partition(|id| {
                self.registry.try_get(*id).is_some_and(|o| {
                    o.is_insert_mode() && !o.flags.contains(ObjectFlags::WRITTEN_INTO_DATABASE)
                })
            });
        let plan = self.plan_inserts(&inserts)?;
        tracing::debug!(
            inserts = inserts.len(),
            updates = updates.len(),
            deferred = plan.deferred.len(),
            relations = changes.len(),
            "persisting"
        );

        for &id in &plan.order {
            let deferred: Vec<usize> = plan
                .deferred
                .iter()
                .filter(|(d, _)| *d == id)
                .map(|(_, ordinal)| *ordinal)
                .collect();
            let (index, ops) = self.insert_ops(id, &deferred)?;
            for op in &ops {
                self.write_op(index, op)?;
            }
        }
        for &(id, ordinal) in &plan.deferred {
            let (index, op) = self.column_update(id, ordinal)?;
            self.write_op(index, &op)?;
        }
        for change in changes {
            let (index, op) = self.relation_op(change)?;
            self.write_op(index, &op)?;
        }
        for &id in &updates {
            let (index, ops) = self.update_ops(id)?;
            for op in &ops {
                self.write_op(index, op)?;
            }
        }
        self.finish_batches()?;

        for &id in targets {
            let obj = self.obj_mut(id)?;
            obj.flags.insert(ObjectFlags::WRITTEN_INTO_DATABASE);
            obj.clear_dirty();
            self.post_commit.push(id);
        }
        self.touched_relations
            .extend(changes.iter().map(|c| c.relation.clone()));
        Ok(())
    }

    /// Order new objects so referenced rows are inserted first.
    ///
    /// A cycle is broken at a nullable reference, which is inserted as NULL
    /// and patched afterwards; a cycle of non-nullable references fails.
    fn plan_inserts(&self, inserts: &[ObjectId]) -> Result<InsertPlan> {
        let position: HashMap<ObjectId, usize> =
            inserts.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut edges = Vec::new();
        for (from, &id) in inserts.iter().enumerate() {
            let obj = self.registry.get(id)?;
            let info = self.schema.class(&obj.class)?;
            for field in info.reference_fields() {
                let value = obj.raw_value(field.ordinal);
                let Some(target) = field.references.as_deref() else {
                    continue;
                };
                if value.is_null() {
                    continue;
                }
                let root = &self.schema.class(target)?.root;
                let Some(target) = self.registry.lookup(root, &Tuple::new(vec![value.clone()])) else {
                    continue;
                };
                if let Some(&to) = position.get(&target) {
                    if to != from {
                        edges.push(Edge {
                            from,
                            to,
                            ordinal: field.ordinal,
                            nullable: field.nullable,
                            active: true,
                        });
                    }
                }
            }
        }

        let n = inserts.len();
        let mut placed = vec![false; n];
        let mut plan = InsertPlan::default();
        while plan.order.len() < n {
            let ready: Vec<usize> = (0..n)
                .filter(|&i| {
                    !placed[i] && !edges.iter().any(|e| e.active && e.from == i && !placed[e.to])
                })
                .collect();
            if !ready.is_empty() {
                for i in ready {
                    placed[i] = true;
                    plan.order.push(inserts[i]);
                }
                continue;
            }

            // Stalled: every remaining object is on or behind a cycle.
            if let Some(k) = (0..edges.len())
                .find(|&k| edges[k].nullable && on_cycle(&edges, &placed, &edges[k]))
            {
                edges[k].active = false;
                plan.deferred.push((inserts[edges[k].from], edges[k].ordinal));
                tracing::debug!(
                    object = %inserts[edges[k].from],
                    ordinal = edges[k].ordinal,
                    "reference cycle broken at nullable field"
                );
                continue;
            }
            let edge = edges
                .iter()
                .find(|e| on_cycle(&edges, &placed, e))
                .or_else(|| edges.iter().find(|e| e.active && !placed[e.from]));
            let Some(edge) = edge else {
                return Err(Error::Custom("insert ordering made no progress".into()));
            };
            let obj = self.registry.get(inserts[edge.from])?;
            let info = self.schema.class(&obj.class)?;
            return Err(Error::CyclicReference(CyclicReferenceError {
                class: info.name.clone(),
                key: key_text(obj.key.as_ref()),
                field: info.fields[edge.ordinal].name.clone(),
            }));
        }
        Ok(plan)
    }

    pub(crate) fn key_block(&self, id: ObjectId) -> Result<(usize, Vec<String>, Vec<Value>)> {
        let obj = self.registry.get(id)?;
        let info = self.schema.class(&obj.class)?;
        let index = self.source_index(info)?;
        let columns = info.key_fields().map(|f| f.column.clone()).collect();
        let key = info
            .primary_key
            .iter()
            .map(|&o| obj.raw_value(o).clone())
            .collect();
        Ok((index, columns, key))
    }

    fn insert_ops(&self, id: ObjectId, deferred: &[usize]) -> Result<(usize, Vec<WriteOp>)> {
        let (index, key_columns, key) = self.key_block(id)?;
        let obj = self.registry.get(id)?;
        let info = self.schema.class(&obj.class)?;
        let ops = info
            .tables
            .iter()
            .map(|table| {
                let mut columns = key_columns.clone();
                let mut values = key.clone();
                for &ordinal in &table.fields {
                    columns.push(info.fields[ordinal].column.clone());
                    values.push(if deferred.contains(&ordinal) {
                        Value::Null
                    } else {
                        obj.raw_value(ordinal).clone()
                    });
                }
                WriteOp::Insert {
                    table: table.name.clone(),
                    columns,
                    values,
                }
            })
            .collect();
        Ok((index, ops))
    }

    fn update_ops(&self, id: ObjectId) -> Result<(usize, Vec<WriteOp>)> {
        let (index, key_columns, key) = self.key_block(id)?;
        let obj = self.registry.get(id)?;
        let info = self.schema.class(&obj.class)?;
        let mut ops = Vec::new();
        for table in &info.tables {
            let dirty: Vec<usize> = table
                .fields
                .iter()
                .copied()
                .filter(|&o| obj.is_field_dirty(o))
                .collect();
            if dirty.is_empty() {
                continue;
            }
            ops.push(WriteOp::Update {
                table: table.name.clone(),
                key_columns: key_columns.clone(),
                key: key.clone(),
                columns: dirty.iter().map(|&o| info.fields[o].column.clone()).collect(),
                values: dirty.iter().map(|&o| obj.raw_value(o).clone()).collect(),
            });
        }
        Ok((index, ops))
    }

    fn column_update(&self, id: ObjectId, ordinal: usize) -> Result<(usize, WriteOp)> {
        let (index, key_columns, key) = self.key_block(id)?;
        let obj = self.registry.get(id)?;
        let info = self.schema.class(&obj.class)?;
        let field = &info.fields[ordinal];
        Ok((
            index,
            WriteOp::Update {
                table: info.tables[field.table_group].name.clone(),
                key_columns,
                key,
                columns: vec![field.column.clone()],
                values: vec![obj.raw_value(ordinal).clone()],
            },
        ))
    }

    fn relation_op(&self, change: &RelationChange) -> Result<(usize, WriteOp)> {
        let relation = self.schema.relation(&change.relation)?;
        let index = self.source_index(self.schema.class(&relation.left_class)?)?;
        let (table, left_column, right_column) = (
            relation.table.clone(),
            relation.left_column.clone(),
            relation.right_column.clone(),
        );
        let (left, right) = (change.left.clone(), change.right.clone());
        let op = match change.op {
            RelationOp::Add => WriteOp::Link {
                table,
                left_column,
                left,
                right_column,
                right,
            },
            RelationOp::Remove => WriteOp::Unlink {
                table,
                left_column,
                left,
                right_column,
                right,
            },
        };
        Ok((index, op))
    }

    fn commit_sessions(&mut self) -> Result<()> {
        for slot in &mut self.sources {
            if slot.open {
                slot.source.commit()?;
                slot.open = false;
                slot.source.close()?;
                tracing::debug!(source = slot.source.name(), "session committed");
            }
        }
        Ok(())
    }

    /// Objects written since the last commit plus those forced, once each.
    fn post_commit_queue(&mut self) -> Vec<ObjectId> {
        let mut seen = HashSet::new();
        let mut queue: Vec<ObjectId> = std::mem::take(&mut self.post_commit)
            .into_iter()
            .filter(|id| seen.insert(*id))
            .collect();
        for id in self.registry.resident_ids() {
            let forced = self
                .registry
                .try_get(id)
                .is_some_and(|o| o.flags.contains(ObjectFlags::FORCE_POST_COMMIT));
            if forced && seen.insert(id) {
                queue.push(id);
            }
        }
        queue
    }

    fn invalidate_cache(&mut self, committed: &[ObjectId]) {
        let cache = Arc::clone(&self.cache);
        let _guard = cache.lock();
        let mut classes = BTreeSet::new();
        for &id in committed {
            let Some(obj) = self.registry.try_get(id) else {
                continue;
            };
            let Some(info) = self.schema.get_class(&obj.class) else {
                continue;
            };
            if !obj.flags.contains(ObjectFlags::WRITTEN_INTO_DATABASE) {
                continue;
            }
            if let Some(key) = &obj.key {
                let reason = if obj.is_insert_mode() {
                    InvalidationReason::Inserted
                } else {
                    InvalidationReason::Updated
                };
                cache.invalidate(&info.root, key, reason);
            }
            classes.insert(info.name.clone());
            classes.extend(info.ancestors.iter().cloned());
        }
        for class in &classes {
            cache.invalidate_collections(class);
        }
        for relation in self.touched_relations.drain() {
            cache.invalidate_collections(&relation);
        }
        tracing::debug!(classes = classes.len(), "cache invalidated");
    }

    fn run_post_commit(&mut self, queue: &[ObjectId]) -> Result<()> {
        for &id in queue {
            let Some(obj) = self.registry.try_get(id) else {
                continue;
            };
            let event = if obj.is_insert_mode() {
                ObjectEvent::AfterInsert
            } else {
                ObjectEvent::AfterUpdate
            };
            self.obj_mut(id)?.flags.remove(ObjectFlags::INSERT_MODE);
            self.fire(id, event)?;
        }
        Ok(())
    }

    fn reset_after_commit(&mut self, queue: &[ObjectId]) {
        for obj in self.registry.resident_mut() {
            obj.flags.remove(
                ObjectFlags::VISITED_ON_COMMIT
                    | ObjectFlags::WRITTEN_INTO_DATABASE
                    | ObjectFlags::FORCE_POST_COMMIT,
            );
            obj.changed = obj.dirty.clone();
        }
        self.dirty
            .retain(|id| self.registry.try_get(*id).is_some_and(|o| o.is_dirty()));
        self.precommitted.clear();
        self.deleted.clear();
        self.relation_log.clear();
        self.enforce_retention(None);
        tracing::trace!(reset = queue.len(), "commit state reset");
    }

    /// Roll back every open session and drop in-memory changes.
    ///
    /// New objects are discarded; changed objects are unloaded and read
    /// again on next access.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    pub fn rollback(&mut self) -> Result<()> {
        let mut first_error = None;
        for slot in &mut self.sources {
            slot.batching = false;
            if slot.open {
                slot.open = false;
                if let Err(err) = slot.source.rollback().and_then(|()| slot.source.close()) {
                    tracing::warn!(source = slot.source.name(), error = %err, "session rollback failed");
                    first_error.get_or_insert(err);
                }
            }
        }

        let mut discard = Vec::new();
        for id in self.registry.resident_ids() {
            let Some(obj) = self.registry.try_get(id) else {
                continue;
            };
            if obj.is_insert_mode() {
                let root = self
                    .schema
                    .get_class(&obj.class)
                    .map_or_else(|| obj.class.clone(), |c| c.root.clone());
                discard.push((id, root));
            }
        }
        for (id, root) in discard {
            self.registry.discard(id, &root)?;
        }
        for obj in self.registry.resident_mut() {
            let touched = obj.is_dirty()
                || !obj.changed.is_empty()
                || obj.flags.contains(ObjectFlags::WRITTEN_INTO_DATABASE)
                || obj.flags.contains(ObjectFlags::MARKED_FOR_DELETE)
                || obj.flags.contains(ObjectFlags::VISITED_ON_COMMIT);
            if touched {
                obj.unload();
            } else {
                obj.collections.clear();
            }
        }

        self.dirty.clear();
        self.relations.clear();
        self.relation_log.clear();
        self.post_commit.clear();
        self.precommitted.clear();
        self.touched_relations.clear();
        self.deleted.clear();
        first_error.map_or(Ok(()), Err)
    }
}
