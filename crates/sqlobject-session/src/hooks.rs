//! Object and field triggers.
//!
//! Triggers are registered per class and apply to the class and every
//! subclass that does not register its own. Each callback receives the
//! transaction so it may read or mutate other objects; an error aborts the
//! operation that fired it and surfaces as [`Error::Hook`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use sqlobject_core::{ClassInfo, Error, HookError, Result, Value};

use crate::Transaction;
use crate::object::ObjectId;

/// A field write as seen by field triggers.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub object: ObjectId,
    pub field: String,
    pub old: Value,
    pub new: Value,
}

/// Object lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectEvent {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeDelete,
    AfterDelete,
}

/// Callbacks attached to a class.
///
/// Every method defaults to doing nothing.
///
/// ```rust,ignore
/// struct Audit;
///
/// impl ObjectTriggers for Audit {
///     fn before_update(&self, txn: &mut Transaction, id: ObjectId) -> Result<()> {
///         txn.set_value(id, "revision", Value::BigInt(next_revision()))
///     }
/// }
/// ```
#[allow(unused_variables)]
pub trait ObjectTriggers: Send + Sync {
    fn before_field_change(&self, txn: &mut Transaction, change: &FieldChange) -> Result<()> {
        Ok(())
    }

    fn after_field_change(&self, txn: &mut Transaction, change: &FieldChange) -> Result<()> {
        Ok(())
    }

    /// Called once per commit before a new object is written.
    fn before_insert(&self, txn: &mut Transaction, id: ObjectId) -> Result<()> {
        Ok(())
    }

    fn after_insert(&self, txn: &mut Transaction, id: ObjectId) -> Result<()> {
        Ok(())
    }

    /// Called once per commit before a changed object is written.
    fn before_update(&self, txn: &mut Transaction, id: ObjectId) -> Result<()> {
        Ok(())
    }

    fn after_update(&self, txn: &mut Transaction, id: ObjectId) -> Result<()> {
        Ok(())
    }

    /// Called when the object is marked for deletion, before inbound
    /// references are processed.
    fn before_delete(&self, txn: &mut Transaction, id: ObjectId) -> Result<()> {
        Ok(())
    }

    /// Called after the delete statements succeeded.
    fn after_delete(&self, txn: &mut Transaction, id: ObjectId) -> Result<()> {
        Ok(())
    }
}

pub(crate) fn dispatch(
    triggers: &dyn ObjectTriggers,
    txn: &mut Transaction,
    event: ObjectEvent,
    id: ObjectId,
) -> Result<()> {
    match event {
        ObjectEvent::BeforeInsert => triggers.before_insert(txn, id),
        ObjectEvent::AfterInsert => triggers.after_insert(txn, id),
        ObjectEvent::BeforeUpdate => triggers.before_update(txn, id),
        ObjectEvent::AfterUpdate => triggers.after_update(txn, id),
        ObjectEvent::BeforeDelete => triggers.before_delete(txn, id),
        ObjectEvent::AfterDelete => triggers.after_delete(txn, id),
    }
}

/// Wrap a trigger failure with the object and field it was raised for.
pub(crate) fn hook_error(class: &str, key: String, field: Option<&str>, source: Error) -> Error {
    Error::Hook(HookError {
        class: class.to_string(),
        key,
        field: field.map(str::to_string),
        source: Box::new(source),
    })
}

/// Triggers by class name.
#[derive(Default, Clone)]
pub(crate) struct TriggerRegistry {
    by_class: HashMap<String, Arc<dyn ObjectTriggers>>,
}

impl fmt::Debug for TriggerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut classes: Vec<&String> = self.by_class.keys().collect();
        classes.sort();
        f.debug_struct("TriggerRegistry")
            .field("classes", &classes)
            .finish()
    }
}

impl TriggerRegistry {
    pub(crate) fn register(&mut self, class: &str, triggers: Arc<dyn ObjectTriggers>) {
        self.by_class.insert(class.to_string(), triggers);
    }

    /// Triggers of `class` or its nearest ancestor that has some.
    ///
    /// `None` when the class has triggers disabled.
    pub(crate) fn resolve(&self, class: &ClassInfo) -> Option<Arc<dyn ObjectTriggers>> {
        if !class.triggers_enabled {
            return None;
        }
        std::iter::once(&class.name)
            .chain(class.ancestors.iter())
            .find_map(|name| self.by_class.get(name))
            .cloned()
    }
}
