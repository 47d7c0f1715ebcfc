//! Per-object field storage and bitmasks.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Dense array of field values addressed by field ordinal.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FieldValues {
    values: Vec<Value>,
}

impl FieldValues {
    /// `len` null values.
    pub fn new(len: usize) -> Self {
        Self {
            values: vec![Value::Null; len],
        }
    }

    pub fn from_vec(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Out-of-range ordinals read as null.
    pub fn get(&self, ordinal: usize) -> &Value {
        const NULL: Value = Value::Null;
        self.values.get(ordinal).unwrap_or(&NULL)
    }

    pub fn set(&mut self, ordinal: usize, value: Value) {
        if ordinal >= self.values.len() {
            self.values.resize(ordinal + 1, Value::Null);
        }
        self.values[ordinal] = value;
    }

    pub fn is_null(&self, ordinal: usize) -> bool {
        self.get(ordinal).is_null()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }
}

/// One bit per table-group; bit N set means group N has been loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TableMask(u64);

impl TableMask {
    pub const EMPTY: TableMask = TableMask(0);
    /// Most table-groups one class hierarchy may span.
    pub const CAPACITY: usize = 64;

    /// Mask with the first `groups` bits set.
    pub fn all(groups: usize) -> Self {
        if groups >= 64 {
            TableMask(u64::MAX)
        } else {
            TableMask((1u64 << groups) - 1)
        }
    }

    pub fn single(group: usize) -> Self {
        TableMask(1u64 << group)
    }

    pub fn contains(self, group: usize) -> bool {
        self.0 & (1u64 << group) != 0
    }

    pub fn insert(&mut self, group: usize) {
        self.0 |= 1u64 << group;
    }

    pub fn union(self, other: TableMask) -> Self {
        TableMask(self.0 | other.0)
    }

    pub fn covers(self, other: TableMask) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn groups(self) -> impl Iterator<Item = usize> {
        (0..64).filter(move |g| self.contains(*g))
    }
}

impl fmt::Display for TableMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#b}", self.0)
    }
}

/// Growable per-field bitset.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FieldMask {
    words: Vec<u64>,
}

impl FieldMask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, ordinal: usize) {
        let word = ordinal / 64;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1u64 << (ordinal % 64);
    }

    pub fn remove(&mut self, ordinal: usize) {
        if let Some(w) = self.words.get_mut(ordinal / 64) {
            *w &= !(1u64 << (ordinal % 64));
        }
    }

    pub fn contains(&self, ordinal: usize) -> bool {
        self.words
            .get(ordinal / 64)
            .is_some_and(|w| w & (1u64 << (ordinal % 64)) != 0)
    }

    pub fn clear(&mut self) {
        self.words.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, w)| {
            (0..64).filter(move |b| w & (1u64 << b) != 0).map(move |b| i * 64 + b)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_mask_bits() {
        let mut m = TableMask::single(0);
        m.insert(2);
        assert!(m.contains(2) && !m.contains(1));
        assert!(TableMask::all(3).covers(m));
        assert_eq!(m.groups().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn field_mask_grows() {
        let mut m = FieldMask::new();
        m.insert(70);
        m.insert(1);
        assert!(m.contains(70));
        assert_eq!(m.iter().collect::<Vec<_>>(), vec![1, 70]);
        m.remove(70);
        assert!(!m.contains(70));
        m.clear();
        assert!(m.is_empty());
    }

    #[test]
    fn field_values_read_null_out_of_range() {
        let mut v = FieldValues::new(2);
        assert!(v.is_null(9));
        v.set(3, Value::Int(1));
        assert_eq!(v.len(), 4);
    }
}
