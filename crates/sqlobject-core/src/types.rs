//! Field data types and value coercion.

use serde::{Deserialize, Serialize};

use crate::error::{Error, TypeError};
use crate::value::Value;

/// Declared data type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Decimal { precision: u8, scale: u8 },
    VarChar(u32),
    Text,
    Blob,
    Date,
    Timestamp,
    Uuid,
}

impl SqlType {
    /// Get the generic SQL type name for this type.
    pub fn sql_name(&self) -> String {
        match self {
            SqlType::Boolean => "BOOLEAN".to_string(),
            SqlType::Integer => "INTEGER".to_string(),
            SqlType::BigInt => "BIGINT".to_string(),
            SqlType::Double => "DOUBLE PRECISION".to_string(),
            SqlType::Decimal { precision, scale } => format!("DECIMAL({}, {})", precision, scale),
            SqlType::VarChar(len) => format!("VARCHAR({})", len),
            SqlType::Text => "TEXT".to_string(),
            SqlType::Blob => "BLOB".to_string(),
            SqlType::Date => "DATE".to_string(),
            SqlType::Timestamp => "TIMESTAMP".to_string(),
            SqlType::Uuid => "UUID".to_string(),
        }
    }

    /// Check if this type is numeric.
    pub const fn is_numeric(&self) -> bool {
        matches!(
            self,
            SqlType::Integer | SqlType::BigInt | SqlType::Double | SqlType::Decimal { .. }
        )
    }

    /// Check if this type is an integer type.
    pub const fn is_integer(&self) -> bool {
        matches!(self, SqlType::Integer | SqlType::BigInt)
    }

    /// Check if this type is text-based.
    pub const fn is_text(&self) -> bool {
        matches!(self, SqlType::VarChar(_) | SqlType::Text)
    }

    /// Check if this type is a date/time type.
    pub const fn is_temporal(&self) -> bool {
        matches!(self, SqlType::Date | SqlType::Timestamp)
    }

    /// Value assigned to a non-nullable field of a freshly created object.
    pub fn default_value(&self) -> Value {
        match self {
            SqlType::Boolean => Value::Bool(false),
            SqlType::Integer => Value::Int(0),
            SqlType::BigInt => Value::BigInt(0),
            SqlType::Double => Value::Double(0.0),
            SqlType::Decimal { .. } => Value::Decimal("0".to_string()),
            SqlType::VarChar(_) | SqlType::Text => Value::Text(String::new()),
            SqlType::Blob => Value::Bytes(Vec::new()),
            SqlType::Date => Value::Date(0),
            SqlType::Timestamp => Value::Timestamp(0),
            SqlType::Uuid => Value::Uuid([0; 16]),
        }
    }

    /// Reinterpret `value` as this type.
    ///
    /// Used on field writes, on values read back from a data source (whose
    /// native representation may differ), and when a cached statement is
    /// replayed with new parameter values. NULL passes through unchanged.
    pub fn coerce(&self, value: Value) -> crate::Result<Value> {
        if value.is_null() {
            return Ok(value);
        }
        let coerced = match (self, &value) {
            (SqlType::Boolean, v) => v.as_bool().map(Value::Bool),
            (SqlType::Integer, v) => v
                .as_i64()
                .or_else(|| integral_f64(v))
                .and_then(|i| i32::try_from(i).ok())
                .map(Value::Int),
            (SqlType::BigInt, v) => v.as_i64().or_else(|| integral_f64(v)).map(Value::BigInt),
            (SqlType::Double, v) => v.as_f64().map(Value::Double),
            (SqlType::Decimal { .. }, Value::Decimal(_)) => Some(value.clone()),
            (SqlType::Decimal { .. }, Value::Text(s)) => {
                s.parse::<f64>().ok().map(|_| Value::Decimal(s.clone()))
            }
            (SqlType::Decimal { .. }, v) => match v {
                Value::Int(_) | Value::BigInt(_) | Value::Double(_) => {
                    Some(Value::Decimal(v.to_string()))
                }
                _ => None,
            },
            (SqlType::VarChar(len), Value::Text(s)) => {
                if s.chars().count() <= *len as usize {
                    Some(value.clone())
                } else {
                    return Err(Error::Type(TypeError {
                        expected: "text within declared length",
                        actual: format!("{} characters", s.chars().count()),
                        field: None,
                    }));
                }
            }
            (SqlType::Text, Value::Text(_)) => Some(value.clone()),
            (SqlType::Blob, Value::Bytes(_)) => Some(value.clone()),
            (SqlType::Date, Value::Date(_)) => Some(value.clone()),
            (SqlType::Date, v) => v
                .as_i64()
                .and_then(|i| i32::try_from(i).ok())
                .map(Value::Date),
            (SqlType::Timestamp, Value::Timestamp(_)) => Some(value.clone()),
            (SqlType::Timestamp, v) => v.as_i64().map(Value::Timestamp),
            (SqlType::Uuid, Value::Uuid(_)) => Some(value.clone()),
            (SqlType::Uuid, Value::Bytes(b)) => <[u8; 16]>::try_from(b.as_slice())
                .ok()
                .map(Value::Uuid),
            _ => None,
        };
        coerced.ok_or_else(|| {
            Error::Type(TypeError {
                expected: self.expected_name(),
                actual: value.type_name().to_string(),
                field: None,
            })
        })
    }

    const fn expected_name(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE",
            SqlType::Decimal { .. } => "DECIMAL",
            SqlType::VarChar(_) | SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Date => "DATE",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Uuid => "UUID",
        }
    }
}

fn integral_f64(v: &Value) -> Option<i64> {
    match v {
        Value::Double(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_widens_and_narrows_integers() {
        assert_eq!(SqlType::BigInt.coerce(Value::Int(4)).unwrap(), Value::BigInt(4));
        assert!(matches!(
            SqlType::Integer.coerce(Value::BigInt(4)).unwrap(),
            Value::Int(4)
        ));
        assert!(SqlType::Integer.coerce(Value::BigInt(i64::MAX)).is_err());
    }

    #[test]
    fn coerce_rejects_wrong_kind() {
        let err = SqlType::Date.coerce(Value::Text("yesterday".into())).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Type);
    }

    #[test]
    fn coerce_checks_varchar_length() {
        assert!(SqlType::VarChar(3).coerce(Value::from("abc")).is_ok());
        assert!(SqlType::VarChar(3).coerce(Value::from("abcd")).is_err());
    }

    #[test]
    fn null_passes_through() {
        assert!(SqlType::Uuid.coerce(Value::Null).unwrap().is_null());
    }

    #[test]
    fn defaults_match_type() {
        assert!(matches!(SqlType::Double.default_value(), Value::Double(_)));
        assert_eq!(SqlType::Text.default_value(), Value::Text(String::new()));
    }
}
