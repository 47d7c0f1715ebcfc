//! Class, table, relation and collection metadata.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::field::FieldInfo;
use crate::value::Value;

/// Per-class cache policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Lifetime of a cached snapshot
    pub expiration: Duration,
    /// Whether each hit extends the lifetime
    pub sliding: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            expiration: Duration::from_secs(300),
            sliding: false,
        }
    }
}

/// One physical table composing (part of) a class's row.
#[derive(Debug, Clone)]
pub struct TableInfo {
    pub name: String,
    /// Position of the table within the class's table list
    pub group: usize,
    /// Class whose declaration introduced the table
    pub declared_in: String,
    /// Ordinals of the fields stored in this table, key fields excluded
    pub fields: Vec<usize>,
}

/// A many-to-many join table with one column per side.
#[derive(Debug, Clone)]
pub struct RelationInfo {
    /// Join table name
    pub table: String,
    pub left_class: String,
    pub left_column: String,
    pub right_class: String,
    pub right_column: String,
}

impl RelationInfo {
    pub fn new(
        table: impl Into<String>,
        left_class: impl Into<String>,
        left_column: impl Into<String>,
        right_class: impl Into<String>,
        right_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            left_class: left_class.into(),
            left_column: left_column.into(),
            right_class: right_class.into(),
            right_column: right_column.into(),
        }
    }
}

/// Shape of a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionKind {
    /// Children referencing the owner through `foreign_key`.
    OneToMany { child: String, foreign_key: String },
    /// Targets linked through a relation table.
    ManyToMany {
        relation: String,
        /// Owner sits on the relation's right side
        reversed: bool,
    },
}

/// A named collection declared on a class.
#[derive(Debug, Clone)]
pub struct CollectionInfo {
    pub name: String,
    pub kind: CollectionKind,
    /// Equality conditions every member must satisfy (field, value)
    pub filter: Vec<(String, Value)>,
    /// Class of the members, filled in by the schema builder
    pub target: String,
    /// Relation column pointing to the owner (many-to-many only)
    pub owner_column: String,
    /// Relation column pointing to the member (many-to-many only)
    pub target_column: String,
}

impl CollectionInfo {
    pub fn one_to_many(
        name: impl Into<String>,
        child: impl Into<String>,
        foreign_key: impl Into<String>,
    ) -> Self {
        let child = child.into();
        Self {
            name: name.into(),
            target: child.clone(),
            kind: CollectionKind::OneToMany {
                child,
                foreign_key: foreign_key.into(),
            },
            filter: Vec::new(),
            owner_column: String::new(),
            target_column: String::new(),
        }
    }

    pub fn many_to_many(name: impl Into<String>, relation: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CollectionKind::ManyToMany {
                relation: relation.into(),
                reversed: false,
            },
            filter: Vec::new(),
            target: String::new(),
            owner_column: String::new(),
            target_column: String::new(),
        }
    }

    /// Use the relation from its right side.
    pub fn reversed(mut self) -> Self {
        if let CollectionKind::ManyToMany { reversed, .. } = &mut self.kind {
            *reversed = true;
        }
        self
    }

    /// Restrict members to those whose `field` equals `value`.
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter.push((field.into(), value.into()));
        self
    }

    pub fn is_many_to_many(&self) -> bool {
        matches!(self.kind, CollectionKind::ManyToMany { .. })
    }

    pub fn relation(&self) -> Option<&str> {
        match &self.kind {
            CollectionKind::ManyToMany { relation, .. } => Some(relation),
            CollectionKind::OneToMany { .. } => None,
        }
    }

    pub fn foreign_key(&self) -> Option<&str> {
        match &self.kind {
            CollectionKind::OneToMany { foreign_key, .. } => Some(foreign_key),
            CollectionKind::ManyToMany { .. } => None,
        }
    }
}

/// Class declaration fed to the schema builder.
#[derive(Debug, Clone)]
pub struct ClassDef {
    pub name: String,
    pub parent: Option<String>,
    /// Own table; `None` stores own fields in the nearest ancestor's table
    pub table: Option<String>,
    pub is_abstract: bool,
    pub triggers_enabled: bool,
    /// Discriminator field name (root classes only)
    pub discriminator: Option<String>,
    pub discriminator_value: Option<Value>,
    pub cache: Option<CacheSettings>,
    pub fields: Vec<FieldInfo>,
    pub collections: Vec<CollectionInfo>,
}

impl ClassDef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: None,
            table: None,
            is_abstract: false,
            triggers_enabled: true,
            discriminator: None,
            discriminator_value: None,
            cache: None,
            fields: Vec::new(),
            collections: Vec::new(),
        }
    }

    pub fn extends(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn abstract_class(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn without_triggers(mut self) -> Self {
        self.triggers_enabled = false;
        self
    }

    /// Declare the discriminator column of a hierarchy root.
    pub fn discriminator(mut self, field: impl Into<String>) -> Self {
        self.discriminator = Some(field.into());
        self
    }

    /// Discriminator value identifying rows of this class.
    pub fn discriminator_value(mut self, value: impl Into<Value>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    pub fn cached(mut self, settings: CacheSettings) -> Self {
        self.cache = Some(settings);
        self
    }

    pub fn field(mut self, field: FieldInfo) -> Self {
        self.fields.push(field);
        self
    }

    pub fn collection(mut self, collection: CollectionInfo) -> Self {
        self.collections.push(collection);
        self
    }
}

/// A field elsewhere in the schema that references a class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundReference {
    pub class: String,
    pub field: String,
}

/// Resolved class metadata.
#[derive(Debug, Clone)]
pub struct ClassInfo {
    pub name: String,
    pub parent: Option<String>,
    /// Hierarchy root
    pub root: String,
    /// Ancestors, nearest first
    pub ancestors: Vec<String>,
    pub is_abstract: bool,
    pub triggers_enabled: bool,
    /// All fields, inherited first, indexed by ordinal
    pub fields: Vec<FieldInfo>,
    /// Table-groups, inherited first; group 0 holds the key
    pub tables: Vec<TableInfo>,
    /// Ordinals of the key fields
    pub primary_key: Vec<usize>,
    pub discriminator: Option<usize>,
    pub discriminator_value: Option<Value>,
    /// Collections, inherited first
    pub collections: Vec<CollectionInfo>,
    pub cache: Option<CacheSettings>,
    /// This class (when concrete) and every concrete descendant
    pub concrete_classes: Vec<String>,
    /// Fields of any class that reference this class or an ancestor
    pub inbound: Vec<InboundReference>,
}

impl ClassInfo {
    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Reference field whose navigation name is `segment`.
    pub fn navigation(&self, segment: &str) -> Option<&FieldInfo> {
        self.fields
            .iter()
            .find(|f| f.navigation_name() == Some(segment))
    }

    /// Whether `segment` names a field, navigation or collection here.
    pub fn has_member(&self, segment: &str) -> bool {
        self.field(segment).is_some()
            || self.navigation(segment).is_some()
            || self.collection(segment).is_some()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.field(name).map(|f| f.ordinal)
    }

    pub fn collection(&self, name: &str) -> Option<&CollectionInfo> {
        self.collections.iter().find(|c| c.name == name)
    }

    pub fn key_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.primary_key.iter().map(|&i| &self.fields[i])
    }

    pub fn has_composite_key(&self) -> bool {
        self.primary_key.len() > 1
    }

    pub fn is_key_field(&self, ordinal: usize) -> bool {
        self.primary_key.contains(&ordinal)
    }

    pub fn primary_table(&self) -> &TableInfo {
        &self.tables[0]
    }

    /// Whether this class is `other` or derives from it.
    pub fn is_a(&self, other: &str) -> bool {
        self.name == other || self.ancestors.iter().any(|a| a == other)
    }

    pub fn is_cached(&self) -> bool {
        self.cache.is_some()
    }

    /// Reference fields, in ordinal order.
    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter().filter(|f| f.references.is_some())
    }
}
