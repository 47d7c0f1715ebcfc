//! Per-object runtime state.
//!
//! A [`DataObject`] owns the field values of one business object, its load
//! and dirty masks, its reference cache and any materialized collections.
//! Objects live in the transaction's registry and are addressed by
//! [`ObjectId`] handles.

use std::collections::HashMap;
use std::fmt;
use std::ops::BitOr;
use std::sync::Arc;

use sqlobject_core::{FieldMask, FieldValues, TableMask, Tuple, Value};

/// Stable handle to an object of one transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId {
    pub(crate) txn: u64,
    pub(crate) index: usize,
}

impl ObjectId {
    /// Transaction this handle belongs to.
    pub fn transaction(&self) -> u64 {
        self.txn
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}:{}", self.txn, self.index)
    }
}

/// Independent boolean facets of an object's state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectFlags(u16);

impl ObjectFlags {
    /// No backing row yet
    pub const INSERT_MODE: Self = Self(1);
    pub const DIRTY: Self = Self(1 << 1);
    /// Values adopted from a shared cache snapshot
    pub const FROM_CACHE: Self = Self(1 << 2);
    /// Row written during this transaction (precommit or flush)
    pub const WRITTEN_INTO_DATABASE: Self = Self(1 << 3);
    pub const MARKED_FOR_DELETE: Self = Self(1 << 4);
    /// Before-commit hook already ran in the current commit
    pub const VISITED_ON_COMMIT: Self = Self(1 << 5);
    pub const FIELD_TRIGGERS_DISABLED: Self = Self(1 << 6);
    pub const OBJECT_TRIGGERS_DISABLED: Self = Self(1 << 7);
    /// Run after-commit hooks even when the object is clean
    pub const FORCE_POST_COMMIT: Self = Self(1 << 8);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }

    pub const fn bits(self) -> u16 {
        self.0
    }
}

impl BitOr for ObjectFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Runtime state of one business object.
#[derive(Debug, Clone)]
pub struct DataObject {
    pub(crate) class: String,
    pub(crate) key: Option<Tuple>,
    pub(crate) flags: ObjectFlags,
    pub(crate) load_mask: TableMask,
    pub(crate) values: Arc<FieldValues>,
    pub(crate) dirty: FieldMask,
    /// Fields changed since the last commit, including precommitted ones
    pub(crate) changed: FieldMask,
    /// Key fields assigned so far
    pub(crate) key_assigned: FieldMask,
    /// Resolved reference targets by field ordinal
    pub(crate) refs: Vec<Option<ObjectId>>,
    pub(crate) collections: HashMap<String, Vec<ObjectId>>,
    /// Concrete class known (discriminator read or object created here)
    pub(crate) class_resolved: bool,
    pub(crate) last_access: u64,
}

impl DataObject {
    /// A new object with no backing row.
    pub(crate) fn for_insert(class: &str, field_count: usize, groups: usize) -> Self {
        Self {
            class: class.to_string(),
            key: None,
            flags: ObjectFlags::INSERT_MODE,
            load_mask: TableMask::all(groups),
            values: Arc::new(FieldValues::new(field_count)),
            dirty: FieldMask::new(),
            changed: FieldMask::new(),
            key_assigned: FieldMask::new(),
            refs: vec![None; field_count],
            collections: HashMap::new(),
            class_resolved: true,
            last_access: 0,
        }
    }

    /// An existing row known by key, loaded lazily.
    pub(crate) fn for_update(class: &str, key: Tuple, field_count: usize, resolved: bool) -> Self {
        Self {
            class: class.to_string(),
            key: Some(key),
            flags: ObjectFlags::empty(),
            load_mask: TableMask::EMPTY,
            values: Arc::new(FieldValues::new(field_count)),
            dirty: FieldMask::new(),
            changed: FieldMask::new(),
            key_assigned: FieldMask::new(),
            refs: vec![None; field_count],
            collections: HashMap::new(),
            class_resolved: resolved,
            last_access: 0,
        }
    }

    pub fn class(&self) -> &str {
        &self.class
    }

    pub fn key(&self) -> Option<&Tuple> {
        self.key.as_ref()
    }

    pub fn flags(&self) -> ObjectFlags {
        self.flags
    }

    pub fn is_insert_mode(&self) -> bool {
        self.flags.contains(ObjectFlags::INSERT_MODE)
    }

    pub fn is_dirty(&self) -> bool {
        self.flags.contains(ObjectFlags::DIRTY)
    }

    pub fn is_marked_for_delete(&self) -> bool {
        self.flags.contains(ObjectFlags::MARKED_FOR_DELETE)
    }

    pub fn load_mask(&self) -> TableMask {
        self.load_mask
    }

    pub fn is_field_dirty(&self, ordinal: usize) -> bool {
        self.dirty.contains(ordinal)
    }

    pub fn dirty_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.dirty.iter()
    }

    /// Fields changed since the last commit.
    pub fn changed_fields(&self) -> impl Iterator<Item = usize> + '_ {
        self.changed.iter()
    }

    /// Stored value, without loading.
    pub fn raw_value(&self, ordinal: usize) -> &Value {
        self.values.get(ordinal)
    }

    /// Whether the values are still the snapshot `other`.
    pub fn shares_snapshot(&self, other: &Arc<FieldValues>) -> bool {
        Arc::ptr_eq(&self.values, other)
    }

    pub(crate) fn snapshot(&self) -> Arc<FieldValues> {
        Arc::clone(&self.values)
    }

    /// Write one value, cloning a shared snapshot first.
    pub(crate) fn write(&mut self, ordinal: usize, value: Value) {
        Arc::make_mut(&mut self.values).set(ordinal, value);
        if ordinal < self.refs.len() {
            self.refs[ordinal] = None;
        }
    }

    /// Adopt a shared snapshot wholesale.
    pub(crate) fn adopt(&mut self, mask: TableMask, values: Arc<FieldValues>) {
        self.values = values;
        self.load_mask = mask;
        self.flags.insert(ObjectFlags::FROM_CACHE);
    }

    /// Fill loaded groups from freshly read values; dirty fields win.
    pub(crate) fn merge_loaded(&mut self, mask: TableMask, ordinals: &[usize], loaded: &FieldValues) {
        if !ordinals.is_empty() {
            let values = Arc::make_mut(&mut self.values);
            for &ordinal in ordinals {
                if !self.dirty.contains(ordinal) {
                    values.set(ordinal, loaded.get(ordinal).clone());
                }
            }
        }
        self.load_mask = self.load_mask.union(mask);
    }

    /// Grow storage after the concrete class turned out to have more fields.
    pub(crate) fn widen(&mut self, class: &str, field_count: usize) {
        self.class = class.to_string();
        if self.refs.len() < field_count {
            self.refs.resize(field_count, None);
        }
        if self.values.len() < field_count {
            Arc::make_mut(&mut self.values).set(field_count - 1, Value::Null);
        }
        self.class_resolved = true;
    }

    /// Returns whether the object was clean before.
    pub(crate) fn mark_dirty(&mut self, ordinal: usize) -> bool {
        self.dirty.insert(ordinal);
        self.changed.insert(ordinal);
        let first = !self.is_dirty();
        self.flags.insert(ObjectFlags::DIRTY);
        first
    }

    pub(crate) fn clear_dirty(&mut self) {
        self.dirty.clear();
        self.flags.remove(ObjectFlags::DIRTY);
    }

    /// Forget loaded state so values are read again on next access.
    pub(crate) fn unload(&mut self) {
        let len = self.values.len();
        self.values = Arc::new(FieldValues::new(len));
        self.load_mask = TableMask::EMPTY;
        self.refs.iter_mut().for_each(|r| *r = None);
        self.collections.clear();
        self.clear_dirty();
        self.changed.clear();
        self.flags = ObjectFlags::empty();
    }
}
