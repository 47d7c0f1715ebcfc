//! Static description of classes, fields, tables and relations.
//!
//! A [`Schema`] is built once with [`SchemaBuilder`] and shared read-only by
//! the query compiler and every transaction.

mod builder;
mod class;
mod field;

pub use builder::SchemaBuilder;
pub use class::{
    CacheSettings, ClassDef, ClassInfo, CollectionInfo, CollectionKind, InboundReference,
    RelationInfo, TableInfo,
};
pub use field::{DeleteAction, FieldInfo};

use std::collections::BTreeMap;

use crate::error::{Error, Result};
use crate::value::Value;

/// Resolved, immutable schema.
#[derive(Debug, Clone)]
pub struct Schema {
    classes: BTreeMap<String, ClassInfo>,
    order: Vec<String>,
    relations: BTreeMap<String, RelationInfo>,
}

impl Schema {
    /// Look up a class, failing with a resolution error.
    pub fn class(&self, name: &str) -> Result<&ClassInfo> {
        self.classes
            .get(name)
            .ok_or_else(|| Error::unresolved(name, "schema"))
    }

    pub fn get_class(&self, name: &str) -> Option<&ClassInfo> {
        self.classes.get(name)
    }

    /// Classes in declaration order.
    pub fn classes(&self) -> impl Iterator<Item = &ClassInfo> {
        self.order.iter().filter_map(|n| self.classes.get(n))
    }

    pub fn relation(&self, table: &str) -> Result<&RelationInfo> {
        self.relations
            .get(table)
            .ok_or_else(|| Error::unresolved(table, "relations"))
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationInfo> {
        self.relations.values()
    }

    /// Whether `class` is `ancestor` or derives from it.
    pub fn is_subclass(&self, class: &str, ancestor: &str) -> bool {
        self.classes.get(class).is_some_and(|c| c.is_a(ancestor))
    }

    /// Discriminator values of `class` and its concrete descendants.
    ///
    /// Empty when the hierarchy has no discriminator.
    pub fn discriminator_values(&self, class: &str) -> Vec<Value> {
        let Some(info) = self.classes.get(class) else {
            return Vec::new();
        };
        info.concrete_classes
            .iter()
            .filter_map(|c| self.classes.get(c))
            .filter_map(|c| c.discriminator_value.clone())
            .collect()
    }

    /// Whether rows of `class` must be filtered by discriminator.
    ///
    /// True for subclasses of a hierarchy that declares a discriminator.
    pub fn needs_discriminator_filter(&self, class: &str) -> bool {
        self.classes
            .get(class)
            .is_some_and(|c| c.discriminator.is_some() && c.parent.is_some())
    }

    /// Concrete class below `base` identified by a discriminator value.
    pub fn class_for_discriminator(&self, base: &str, value: &Value) -> Option<&ClassInfo> {
        let info = self.classes.get(base)?;
        info.concrete_classes
            .iter()
            .filter_map(|c| self.classes.get(c))
            .find(|c| c.discriminator_value.as_ref() == Some(value))
    }

    /// Relation tables a class takes part in, with the column pointing to it.
    pub fn relations_of(&self, class: &str) -> Vec<(&RelationInfo, &str)> {
        let Some(info) = self.classes.get(class) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        for rel in self.relations.values() {
            if info.is_a(&rel.left_class) {
                out.push((rel, rel.left_column.as_str()));
            }
            if info.is_a(&rel.right_class) && rel.right_column != rel.left_column {
                out.push((rel, rel.right_column.as_str()));
            }
        }
        out
    }
}
