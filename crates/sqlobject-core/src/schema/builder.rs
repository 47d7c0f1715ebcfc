//! Validation and resolution of class declarations into a [`Schema`].

use std::collections::{BTreeMap, HashMap, HashSet};

use super::class::{ClassDef, ClassInfo, CollectionKind, InboundReference, RelationInfo, TableInfo};
use super::Schema;
use crate::error::{Error, Result, SchemaErrorKind};
use crate::field_values::TableMask;
use crate::identifiers::is_valid_identifier;
use crate::value::Value;

/// Collects class and relation declarations and resolves them.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    classes: Vec<ClassDef>,
    relations: Vec<RelationInfo>,
}

impl SchemaBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn class(mut self, class: ClassDef) -> Self {
        self.classes.push(class);
        self
    }

    pub fn relation(mut self, relation: RelationInfo) -> Self {
        self.relations.push(relation);
        self
    }

    /// Resolve inheritance, ordinals, table-groups and cross references.
    #[tracing::instrument(level = "debug", skip(self), fields(classes = self.classes.len()))]
    pub fn build(self) -> Result<Schema> {
        let mut defs: HashMap<String, ClassDef> = HashMap::new();
        let mut order = Vec::with_capacity(self.classes.len());
        for def in self.classes {
            check_names(&def)?;
            if defs.contains_key(&def.name) {
                return Err(Error::schema(
                    SchemaErrorKind::DuplicateClass,
                    format!("class '{}' declared twice", def.name),
                ));
            }
            order.push(def.name.clone());
            defs.insert(def.name.clone(), def);
        }

        let mut relations = BTreeMap::new();
        for rel in self.relations {
            for class in [&rel.left_class, &rel.right_class] {
                if !defs.contains_key(class) {
                    return Err(Error::schema(
                        SchemaErrorKind::UnknownReference,
                        format!("relation '{}' names unknown class '{}'", rel.table, class),
                    ));
                }
            }
            relations.insert(rel.table.clone(), rel);
        }

        let mut resolved: BTreeMap<String, ClassInfo> = BTreeMap::new();
        for name in &order {
            let mut visiting = HashSet::new();
            resolve_class(name, &defs, &mut resolved, &mut visiting)?;
        }

        link_references(&order, &mut resolved, &relations)?;

        tracing::debug!(classes = resolved.len(), relations = relations.len(), "schema resolved");
        Ok(Schema {
            classes: resolved,
            order,
            relations,
        })
    }
}

fn check_names(def: &ClassDef) -> Result<()> {
    let names = std::iter::once(def.name.as_str())
        .chain(def.table.as_deref())
        .chain(def.fields.iter().flat_map(|f| [f.name.as_str(), f.column.as_str()]))
        .chain(def.fields.iter().filter_map(|f| f.navigation.as_deref()))
        .chain(def.collections.iter().map(|c| c.name.as_str()));
    for name in names {
        if !is_valid_identifier(name) {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!("'{}' in class '{}' is not a valid identifier", name, def.name),
            ));
        }
    }
    Ok(())
}

fn resolve_class(
    name: &str,
    defs: &HashMap<String, ClassDef>,
    resolved: &mut BTreeMap<String, ClassInfo>,
    visiting: &mut HashSet<String>,
) -> Result<()> {
    if resolved.contains_key(name) {
        return Ok(());
    }
    if !visiting.insert(name.to_string()) {
        return Err(Error::schema(
            SchemaErrorKind::Invalid,
            format!("inheritance cycle through '{}'", name),
        ));
    }
    let def = &defs[name];

    let mut info = match &def.parent {
        Some(parent) => {
            if !defs.contains_key(parent) {
                return Err(Error::schema(
                    SchemaErrorKind::UnknownParent,
                    format!("class '{}' extends unknown class '{}'", name, parent),
                ));
            }
            resolve_class(parent, defs, resolved, visiting)?;
            let p = &resolved[parent.as_str()];
            let mut ancestors = vec![p.name.clone()];
            ancestors.extend(p.ancestors.iter().cloned());
            ClassInfo {
                name: name.to_string(),
                parent: Some(p.name.clone()),
                root: p.root.clone(),
                ancestors,
                is_abstract: def.is_abstract,
                triggers_enabled: def.triggers_enabled,
                fields: p.fields.clone(),
                tables: p.tables.clone(),
                primary_key: p.primary_key.clone(),
                discriminator: p.discriminator,
                discriminator_value: None,
                collections: p.collections.clone(),
                cache: def.cache.clone().or_else(|| p.cache.clone()),
                concrete_classes: Vec::new(),
                inbound: Vec::new(),
            }
        }
        None => ClassInfo {
            name: name.to_string(),
            parent: None,
            root: name.to_string(),
            ancestors: Vec::new(),
            is_abstract: def.is_abstract,
            triggers_enabled: def.triggers_enabled,
            fields: Vec::new(),
            tables: Vec::new(),
            primary_key: Vec::new(),
            discriminator: None,
            discriminator_value: None,
            collections: Vec::new(),
            cache: def.cache.clone(),
            concrete_classes: Vec::new(),
            inbound: Vec::new(),
        },
    };

    if def.table.is_some() || def.parent.is_none() {
        if info.tables.len() == TableMask::CAPACITY {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!(
                    "class '{}' spans more than {} tables",
                    name,
                    TableMask::CAPACITY
                ),
            ));
        }
        info.tables.push(TableInfo {
            name: def.table.clone().unwrap_or_else(|| name.to_string()),
            group: info.tables.len(),
            declared_in: name.to_string(),
            fields: Vec::new(),
        });
    }
    let own_group = info.tables.len() - 1;

    for field in &def.fields {
        let nav_clash = field
            .navigation
            .as_deref()
            .is_some_and(|n| n != field.name && info.has_member(n));
        if info.field(&field.name).is_some() || nav_clash {
            return Err(Error::schema(
                SchemaErrorKind::DuplicateField,
                format!("field '{}' declared twice in '{}'", field.name, name),
            ));
        }
        if field.primary_key && def.parent.is_some() {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!("subclass '{}' cannot declare key field '{}'", name, field.name),
            ));
        }
        let mut field = field.clone();
        field.ordinal = info.fields.len();
        field.table_group = if field.primary_key { 0 } else { own_group };
        field.declared_in = name.to_string();
        if field.primary_key {
            field.nullable = false;
            info.primary_key.push(field.ordinal);
        } else {
            info.tables[own_group].fields.push(field.ordinal);
        }
        info.fields.push(field);
    }

    if info.primary_key.is_empty() {
        return Err(Error::schema(
            SchemaErrorKind::MissingPrimaryKey,
            format!("class '{}' has no primary key", name),
        ));
    }

    if let Some(disc) = &def.discriminator {
        if def.parent.is_some() {
            return Err(Error::schema(
                SchemaErrorKind::Invalid,
                format!("discriminator must be declared on the root of '{}'", name),
            ));
        }
        let ordinal = info.field_index(disc).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::Invalid,
                format!("discriminator field '{}' not found in '{}'", disc, name),
            )
        })?;
        info.discriminator = Some(ordinal);
    }

    if let Some(ordinal) = info.discriminator {
        if !def.is_abstract || def.discriminator_value.is_some() {
            let raw = def
                .discriminator_value
                .clone()
                .unwrap_or_else(|| Value::Text(name.to_string()));
            info.discriminator_value = Some(info.fields[ordinal].sql_type.coerce(raw)?);
        }
    } else if def.discriminator_value.is_some() {
        return Err(Error::schema(
            SchemaErrorKind::Invalid,
            format!("'{}' has a discriminator value but its hierarchy has no discriminator", name),
        ));
    }

    for collection in &def.collections {
        if info.collection(&collection.name).is_some() {
            return Err(Error::schema(
                SchemaErrorKind::DuplicateField,
                format!("collection '{}' declared twice in '{}'", collection.name, name),
            ));
        }
        info.collections.push(collection.clone());
    }

    visiting.remove(name);
    resolved.insert(name.to_string(), info);
    Ok(())
}

fn link_references(
    order: &[String],
    resolved: &mut BTreeMap<String, ClassInfo>,
    relations: &BTreeMap<String, RelationInfo>,
) -> Result<()> {
    // Reference targets must exist and carry a single-column key.
    for info in resolved.values() {
        for field in info.reference_fields() {
            let target_name = field.references.as_deref().unwrap_or_default();
            let target = resolved.get(target_name).ok_or_else(|| {
                Error::schema(
                    SchemaErrorKind::UnknownReference,
                    format!("{}.{} references unknown class '{}'", info.name, field.name, target_name),
                )
            })?;
            if target.has_composite_key() {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!(
                        "{}.{} references '{}' which has a composite key",
                        info.name, field.name, target_name
                    ),
                ));
            }
        }
    }

    // Collections: member class and relation columns.
    let snapshot = resolved.clone();
    for info in resolved.values_mut() {
        let owner = &snapshot[info.name.as_str()];
        for collection in &mut info.collections {
            match &collection.kind {
                CollectionKind::OneToMany { child, foreign_key } => {
                    let child_info = snapshot.get(child).ok_or_else(|| {
                        Error::schema(
                            SchemaErrorKind::UnknownReference,
                            format!("collection {}.{} names unknown class '{}'", owner.name, collection.name, child),
                        )
                    })?;
                    let fk = child_info.field(foreign_key).ok_or_else(|| {
                        Error::schema(
                            SchemaErrorKind::UnknownReference,
                            format!("collection {}.{}: '{}' has no field '{}'", owner.name, collection.name, child, foreign_key),
                        )
                    })?;
                    let points_here = fk.references.as_deref().is_some_and(|r| {
                        owner.is_a(r) || snapshot.get(r).is_some_and(|t| t.is_a(&owner.name))
                    });
                    if !points_here {
                        return Err(Error::schema(
                            SchemaErrorKind::Invalid,
                            format!("{}.{} does not reference '{}'", child, foreign_key, owner.name),
                        ));
                    }
                    collection.target = child.clone();
                }
                CollectionKind::ManyToMany { relation, reversed } => {
                    let rel = relations.get(relation).ok_or_else(|| {
                        Error::schema(
                            SchemaErrorKind::UnknownReference,
                            format!("collection {}.{} names unknown relation '{}'", owner.name, collection.name, relation),
                        )
                    })?;
                    let (owner_class, owner_col, target_class, target_col) = if *reversed {
                        (&rel.right_class, &rel.right_column, &rel.left_class, &rel.left_column)
                    } else {
                        (&rel.left_class, &rel.left_column, &rel.right_class, &rel.right_column)
                    };
                    if !owner.is_a(owner_class) {
                        return Err(Error::schema(
                            SchemaErrorKind::Invalid,
                            format!("'{}' is not on the owning side of relation '{}'", owner.name, relation),
                        ));
                    }
                    collection.target = target_class.clone();
                    collection.owner_column = owner_col.clone();
                    collection.target_column = target_col.clone();
                }
            }
            let target = &snapshot[collection.target.as_str()];
            for (field, value) in &mut collection.filter {
                let f = target.field(field).ok_or_else(|| {
                    Error::schema(
                        SchemaErrorKind::UnknownReference,
                        format!("filter of {}.{} names unknown field '{}'", owner.name, collection.name, field),
                    )
                })?;
                *value = f.sql_type.coerce(value.clone())?;
            }
        }
    }

    // Concrete descendants, in declaration order, and unique discriminators.
    let names: Vec<String> = order.to_vec();
    for name in &names {
        let concrete: Vec<String> = names
            .iter()
            .filter(|c| {
                let c = &resolved[c.as_str()];
                !c.is_abstract && c.is_a(name)
            })
            .cloned()
            .collect();
        if let Some(info) = resolved.get_mut(name) {
            info.concrete_classes = concrete;
        }
    }
    let mut seen: HashMap<(String, Value), String> = HashMap::new();
    for name in &names {
        let info = &resolved[name.as_str()];
        if info.is_abstract {
            continue;
        }
        if let Some(value) = &info.discriminator_value {
            if let Some(other) = seen.insert((info.root.clone(), value.clone()), name.clone()) {
                return Err(Error::schema(
                    SchemaErrorKind::Invalid,
                    format!("'{}' and '{}' share discriminator value {}", other, name, value),
                ));
            }
        }
    }

    // Inbound references for the delete protocol.
    let mut inbound: HashMap<String, Vec<InboundReference>> = HashMap::new();
    for name in &names {
        let referencing = &resolved[name.as_str()];
        for field in referencing.reference_fields() {
            if field.declared_in != *name {
                continue;
            }
            let target = field.references.as_deref().unwrap_or_default();
            for candidate in &names {
                if resolved[candidate.as_str()].is_a(target) {
                    inbound.entry(candidate.clone()).or_default().push(InboundReference {
                        class: name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }
    }
    for (name, refs) in inbound {
        if let Some(info) = resolved.get_mut(&name) {
            info.inbound = refs;
        }
    }
    Ok(())
}
