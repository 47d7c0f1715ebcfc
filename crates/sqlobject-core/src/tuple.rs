//! Primary key tuples.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Ordered key values; a scalar key is the one-element case.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Tuple(Vec<Value>);

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn scalar(value: impl Into<Value>) -> Self {
        Self(vec![value.into()])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn get(&self, i: usize) -> Option<&Value> {
        self.0.get(i)
    }

    /// The single value of a scalar key.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self.0.as_slice() {
            [v] => Some(v),
            _ => None,
        }
    }

    /// A key with a null component identifies nothing.
    pub fn has_null(&self) -> bool {
        self.0.iter().any(Value::is_null)
    }

    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

impl From<Value> for Tuple {
    fn from(v: Value) -> Self {
        Self(vec![v])
    }
}

impl From<Vec<Value>> for Tuple {
    fn from(v: Vec<Value>) -> Self {
        Self(v)
    }
}

impl From<i64> for Tuple {
    fn from(v: i64) -> Self {
        Self::scalar(v)
    }
}

impl From<&str> for Tuple {
    fn from(v: &str) -> Self {
        Self::scalar(v)
    }
}

impl fmt::Display for Tuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_and_scalar() {
        let t = Tuple::new(vec![Value::Int(1), Value::from("a")]);
        assert_eq!(t.to_string(), "(1, 'a')");
        assert!(t.as_scalar().is_none());
        assert_eq!(Tuple::from(5i64).as_scalar(), Some(&Value::BigInt(5)));
    }

    #[test]
    fn int_widths_hash_alike() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(Tuple::scalar(3i32), "x");
        assert_eq!(map.get(&Tuple::scalar(3i64)), Some(&"x"));
    }
}
