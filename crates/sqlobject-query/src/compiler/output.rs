//! Compiled statement and parameter binding.

use sqlobject_core::{Error, Result, SqlType, Value};

use crate::dialect::Dialect;

/// Where a bound parameter's value comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamSource {
    /// A literal of the query that was not inlined
    Value(Value),
    /// The caller-supplied parameter at this position
    External(usize),
}

/// One positional parameter of a compiled statement.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSlot {
    pub source: ParamSource,
    /// Type the value is reinterpreted as when bound
    pub declared: Option<SqlType>,
}

impl ParamSlot {
    fn coerce(&self, value: Value) -> Result<Value> {
        match self.declared {
            Some(ty) => ty.coerce(value),
            None => Ok(value),
        }
    }
}

/// SQL text plus its ordered parameter slots.
#[derive(Debug, Clone)]
pub struct CompiledQuery {
    pub sql: String,
    pub slots: Vec<ParamSlot>,
    /// Number of projected columns
    pub columns: usize,
    /// Classes whose rows the query reads
    pub dependent_classes: Vec<String>,
    /// Relation tables the query reads
    pub dependent_relations: Vec<String>,
}

impl CompiledQuery {
    /// Ordered parameters of a query that uses no external parameters.
    pub fn params(&self) -> Result<Vec<Value>> {
        self.bind(&[])
    }

    /// Ordered parameters, filling external slots from `external`.
    pub fn bind(&self, external: &[Value]) -> Result<Vec<Value>> {
        self.slots
            .iter()
            .map(|slot| {
                let value = match &slot.source {
                    ParamSource::Value(v) => v.clone(),
                    ParamSource::External(i) => external.get(*i).cloned().ok_or_else(|| {
                        Error::Custom(format!(
                            "query expects parameter {} but {} were supplied",
                            i,
                            external.len()
                        ))
                    })?,
                };
                slot.coerce(value)
            })
            .collect()
    }

    /// Reuse the SQL text with a complete new positional parameter list.
    ///
    /// Each value is reinterpreted with the type declared for its slot.
    pub fn replay(&self, positional: &[Value]) -> Result<Vec<Value>> {
        if positional.len() != self.slots.len() {
            return Err(Error::Custom(format!(
                "statement has {} parameters, {} supplied",
                self.slots.len(),
                positional.len()
            )));
        }
        self.slots
            .iter()
            .zip(positional)
            .map(|(slot, v)| slot.coerce(v.clone()))
            .collect()
    }

    pub fn has_external(&self) -> bool {
        self.slots
            .iter()
            .any(|s| matches!(s.source, ParamSource::External(_)))
    }
}

const MARK_START: char = '\u{1}';
const MARK_END: char = '\u{2}';

/// Placeholder marker for slot `id`, numbered later by [`number_placeholders`].
pub(crate) fn marker(id: usize) -> String {
    format!("{MARK_START}{id}{MARK_END}")
}

/// Replace markers with dialect placeholders in text order.
pub(crate) fn number_placeholders(
    sql: &str,
    slots: &[ParamSlot],
    dialect: Dialect,
) -> Result<(String, Vec<ParamSlot>)> {
    let mut out = String::with_capacity(sql.len());
    let mut ordered = Vec::new();
    let mut chars = sql.chars();
    while let Some(c) = chars.next() {
        if c != MARK_START {
            out.push(c);
            continue;
        }
        let id: String = chars.by_ref().take_while(|c| *c != MARK_END).collect();
        let slot = id
            .parse::<usize>()
            .ok()
            .and_then(|i| slots.get(i))
            .ok_or_else(|| Error::Custom(format!("dangling parameter marker {id}")))?;
        ordered.push(slot.clone());
        out.push_str(&dialect.placeholder(ordered.len()));
    }
    Ok((out, ordered))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot(source: ParamSource, declared: Option<SqlType>) -> ParamSlot {
        ParamSlot { source, declared }
    }

    #[test]
    fn markers_are_numbered_in_text_order() {
        let slots = vec![
            slot(ParamSource::Value(Value::Int(1)), None),
            slot(ParamSource::Value(Value::Int(2)), None),
        ];
        let sql = format!("a = {} AND b = {}", marker(1), marker(0));
        let (text, ordered) = number_placeholders(&sql, &slots, Dialect::Postgres).unwrap();
        assert_eq!(text, "a = $1 AND b = $2");
        assert_eq!(ordered[0].source, ParamSource::Value(Value::Int(2)));
    }

    #[test]
    fn replay_reinterprets_declared_types() {
        let q = CompiledQuery {
            sql: "SELECT 1 WHERE x = ?1".into(),
            slots: vec![slot(ParamSource::Value(Value::Int(5)), Some(SqlType::Date))],
            columns: 1,
            dependent_classes: vec![],
            dependent_relations: vec![],
        };
        let params = q.replay(&[Value::BigInt(19000)]).unwrap();
        assert!(matches!(params[0], Value::Date(19000)));
        assert!(q.replay(&[]).is_err());
    }

    #[test]
    fn bind_requires_external_values() {
        let q = CompiledQuery {
            sql: String::new(),
            slots: vec![slot(ParamSource::External(0), Some(SqlType::BigInt))],
            columns: 1,
            dependent_classes: vec![],
            dependent_relations: vec![],
        };
        assert!(q.has_external());
        assert!(q.params().is_err());
        assert_eq!(q.bind(&[Value::Int(3)]).unwrap(), vec![Value::BigInt(3)]);
    }
}
