//! Key generation for new objects.

use std::collections::HashMap;
use std::sync::Mutex;

use sqlobject_core::{ClassInfo, Result, SqlType, Tuple, Value};

/// Supplies primary keys for objects created without one.
pub trait KeyGenerator: Send + Sync {
    /// Next key for a new object of `class`, or `None` when this generator
    /// cannot produce keys for it (the caller must then set the key fields).
    fn next_key(&self, class: &ClassInfo) -> Result<Option<Tuple>>;

    /// Make sure later keys of `class` stay above `key`.
    fn observe(&self, _class: &ClassInfo, _key: &Tuple) {}
}

/// In-memory counter per hierarchy root for single integer keys.
#[derive(Debug, Default)]
pub struct SequentialKeyGenerator {
    next: Mutex<HashMap<String, i64>>,
}

impl SequentialKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `root`'s counter at `first`.
    #[must_use]
    pub fn starting_at(self, root: &str, first: i64) -> Self {
        self.lock().insert(root.to_string(), first);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, i64>> {
        self.next
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn integer_key(class: &ClassInfo) -> Option<SqlType> {
    match class.primary_key.as_slice() {
        [ordinal] if class.fields[*ordinal].sql_type.is_integer() => {
            Some(class.fields[*ordinal].sql_type)
        }
        _ => None,
    }
}

impl KeyGenerator for SequentialKeyGenerator {
    fn next_key(&self, class: &ClassInfo) -> Result<Option<Tuple>> {
        let Some(ty) = integer_key(class) else {
            return Ok(None);
        };
        let mut next = self.lock();
        let counter = next.entry(class.root.clone()).or_insert(1);
        let value = *counter;
        *counter += 1;
        Ok(Some(Tuple::new(vec![ty.coerce(Value::BigInt(value))?])))
    }

    fn observe(&self, class: &ClassInfo, key: &Tuple) {
        if integer_key(class).is_none() {
            return;
        }
        if let Some(value) = key.as_scalar().and_then(Value::as_i64) {
            let mut next = self.lock();
            let counter = next.entry(class.root.clone()).or_insert(1);
            if *counter <= value {
                *counter = value + 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlobject_core::{ClassDef, FieldInfo, SchemaBuilder};

    #[test]
    fn counts_per_root_and_skips_observed_keys() {
        let schema = SchemaBuilder::new()
            .class(ClassDef::new("Person").field(FieldInfo::new("id", SqlType::Integer).primary_key()))
            .class(ClassDef::new("Employee").extends("Person"))
            .class(ClassDef::new("Tag").field(FieldInfo::new("code", SqlType::Text).primary_key()))
            .build()
            .unwrap();
        let keys = SequentialKeyGenerator::new();
        let person = schema.class("Person").unwrap();
        let employee = schema.class("Employee").unwrap();

        assert_eq!(keys.next_key(person).unwrap(), Some(Tuple::new(vec![Value::Int(1)])));
        assert_eq!(keys.next_key(employee).unwrap(), Some(Tuple::new(vec![Value::Int(2)])));
        keys.observe(person, &Tuple::new(vec![Value::Int(10)]));
        assert_eq!(keys.next_key(person).unwrap(), Some(Tuple::new(vec![Value::Int(11)])));
        assert_eq!(keys.next_key(schema.class("Tag").unwrap()).unwrap(), None);
    }
}
