//! Pending many-to-many changes.
//!
//! Tuple additions and removals are queued per relation table in the order
//! they were made and flushed as relation INSERT/DELETE statements by
//! commit and precommit. Collections materialized before the flush replay
//! the queue over what the database returned.

use serde::{Deserialize, Serialize};
use sqlobject_core::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationOp {
    Add,
    Remove,
}

/// One queued tuple change; `left`/`right` follow the relation's sides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationChange {
    pub relation: String,
    pub op: RelationOp,
    pub left: Value,
    pub right: Value,
}

#[derive(Debug, Default)]
pub(crate) struct RelationBuffer {
    changes: Vec<RelationChange>,
}

impl RelationBuffer {
    /// Queue a change; repeating the latest op for the same tuple is a no-op.
    pub(crate) fn record(&mut self, relation: &str, op: RelationOp, left: Value, right: Value) -> bool {
        let latest = self
            .changes
            .iter()
            .rev()
            .find(|c| c.relation == relation && c.left == left && c.right == right);
        if latest.is_some_and(|c| c.op == op) {
            return false;
        }
        self.changes.push(RelationChange {
            relation: relation.to_string(),
            op,
            left,
            right,
        });
        true
    }

    pub(crate) fn changes(&self) -> &[RelationChange] {
        &self.changes
    }

    pub(crate) fn pending_for<'a>(
        &'a self,
        relation: &'a str,
    ) -> impl Iterator<Item = &'a RelationChange> + 'a {
        self.changes.iter().filter(move |c| c.relation == relation)
    }

    /// Remove and return the changes of relations accepted by `select`.
    pub(crate) fn take(&mut self, select: impl Fn(&str) -> bool) -> Vec<RelationChange> {
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.changes)
            .into_iter()
            .partition(|c| select(&c.relation));
        self.changes = kept;
        taken
    }

    /// Put changes back at the front after a failed flush.
    pub(crate) fn restore(&mut self, mut changes: Vec<RelationChange>) {
        changes.append(&mut self.changes);
        self.changes = changes;
    }

    /// Drop queued changes whose left (or right) value is `value`.
    pub(crate) fn forget(&mut self, relation: &str, left_side: bool, value: &Value) {
        self.changes.retain(|c| {
            c.relation != relation || (if left_side { &c.left } else { &c.right }) != value
        });
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.changes.clear();
    }
}
