//! Literal inlining and parameter slots.

use std::sync::OnceLock;

use regex::Regex;
use sqlobject_core::{SqlType, Value};

use super::State;
use super::output::{ParamSlot, ParamSource, marker};

fn safe_text() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^[^'"\\\x00-\x1f\x7f`;]*$"#).unwrap_or_else(|_| unreachable!())
    })
}

/// Whether `text` may appear verbatim between single quotes.
pub(crate) fn is_safe_text(text: &str, max_len: usize) -> bool {
    text.chars().count() <= max_len && safe_text().is_match(text)
}

impl State<'_> {
    /// Inline text for a literal, when the safety switch allows it.
    fn inline(&self, value: &Value) -> Option<String> {
        if value.is_null() {
            return Some("NULL".to_string());
        }
        if !self.options.inline_safe_literals {
            return None;
        }
        match value {
            Value::Bool(b) => Some(self.dialect.bool_literal(*b).to_string()),
            Value::Int(i) => Some(i.to_string()),
            Value::BigInt(i) => Some(i.to_string()),
            Value::Text(s) if is_safe_text(s, self.options.max_inline_literal_len) => {
                Some(format!("'{s}'"))
            }
            _ => None,
        }
    }

    /// Literal as SQL text: inlined when safe and untyped, else a placeholder.
    pub(super) fn literal(&mut self, value: &Value, declared: Option<SqlType>) -> String {
        if declared.is_none() {
            if let Some(text) = self.inline(value) {
                return text;
            }
        }
        self.slot(ParamSource::Value(value.clone()), declared)
    }

    pub(super) fn external(&mut self, index: usize, declared: Option<SqlType>) -> String {
        self.slot(ParamSource::External(index), declared)
    }

    fn slot(&mut self, source: ParamSource, declared: Option<SqlType>) -> String {
        self.slots.push(ParamSlot { source, declared });
        marker(self.slots.len() - 1)
    }
}
