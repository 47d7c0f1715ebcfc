//! Lowering of `Count` and `Contains` over collections.

use sqlobject_core::{CollectionInfo, CollectionKind, Error, Result};

use super::State;
use super::resolve::{Resolved, Want};
use crate::ast::{ContainsTarget, Path};

/// Correlated member sub-query under construction.
struct Members {
    scope: usize,
    /// Column holding the member key
    key: String,
    conds: Vec<String>,
}

impl State<'_> {
    fn collection_of(&mut self, path: &Path) -> Result<(String, CollectionInfo)> {
        match self.resolve(path, Want::Collection)? {
            Resolved::Collection(owner, collection) => Ok((self.key_column(&owner)?, collection)),
            _ => Err(Error::unresolved(path.last(), "collections")),
        }
    }

    /// Open a scope holding the members of `collection` owned by `owner_key`.
    fn members(&mut self, owner_key: &str, collection: &CollectionInfo) -> Result<Members> {
        let schema = self.schema;
        let target = schema.class(&collection.target)?;
        let scope = self.push_scope();
        let mut conds = Vec::new();

        let key = match &collection.kind {
            CollectionKind::OneToMany { foreign_key, .. } => {
                let member = self.add_source(scope, "", target);
                let fk = target
                    .field(foreign_key)
                    .ok_or_else(|| Error::unresolved(foreign_key, &target.name))?;
                conds.push(format!("{} = {}", self.column_of(&member, fk)?, owner_key));
                for (name, value) in &collection.filter {
                    let field = target
                        .field(name)
                        .ok_or_else(|| Error::unresolved(name, &target.name))?;
                    let column = self.column_of(&member, field)?;
                    conds.push(format!("{} = {}", column, self.literal(value, None)));
                }
                if schema.needs_discriminator_filter(&target.name) {
                    conds.push(self.discriminator_condition(&member.alias, target)?);
                }
                self.key_column(&member)?
            }
            CollectionKind::ManyToMany { relation, .. } => {
                let rel_alias = self.add_relation_source(scope, relation);
                let member_key = self.col(&rel_alias, &collection.target_column);
                conds.push(format!(
                    "{} = {}",
                    self.col(&rel_alias, &collection.owner_column),
                    owner_key
                ));
                // Member rows are only needed to check their fields.
                if !collection.filter.is_empty() || schema.needs_discriminator_filter(&target.name) {
                    let pk = target
                        .key_fields()
                        .next()
                        .ok_or_else(|| Error::unresolved("key", &target.name))?;
                    let member = self.add_class_join(
                        scope,
                        0,
                        target,
                        false,
                        vec![(pk.column.clone(), member_key.clone())],
                    )?;
                    for (name, value) in &collection.filter {
                        let field = target
                            .field(name)
                            .ok_or_else(|| Error::unresolved(name, &target.name))?;
                        let column = self.column_of(&member, field)?;
                        conds.push(format!("{} = {}", column, self.literal(value, None)));
                    }
                }
                member_key
            }
        };
        Ok(Members { scope, key, conds })
    }

    /// Close the member scope into `SELECT <what> FROM ... WHERE ...`.
    fn finish_members(&mut self, members: Members, what: &str) -> Result<String> {
        let (from, extra) = self.render_from(members.scope)?;
        self.scopes.truncate(members.scope);
        let mut conds = members.conds;
        conds.extend(extra);
        Ok(format!("SELECT {} {} WHERE {}", what, from, conds.join(" AND ")))
    }

    /// `(SELECT COUNT(*) FROM child WHERE fk = owner ...)`
    pub(super) fn count(&mut self, path: &Path) -> Result<String> {
        let (owner_key, collection) = self.collection_of(path)?;
        let members = self.members(&owner_key, &collection)?;
        Ok(format!("({})", self.finish_members(members, "COUNT(*)")?))
    }

    /// `EXISTS (SELECT 1 FROM child WHERE fk = owner AND member = needle)`
    pub(super) fn contains(&mut self, path: &Path, target: &ContainsTarget) -> Result<String> {
        let (owner_key, collection) = self.collection_of(path)?;
        let member_class = self.schema.class(&collection.target)?;
        if member_class.has_composite_key() {
            return Err(Error::unsupported(
                "composite key membership",
                format!(
                    "Contains over '{}' is not supported: '{}' has a composite key",
                    path, member_class.name
                ),
            ));
        }
        // The needle belongs to the enclosing scope.
        let needle = match target {
            ContainsTarget::Value(expr) => format!("= {}", self.compile_expr(expr)?),
            ContainsTarget::Query(query) => {
                let (sql, columns) = self.compile_query(query)?;
                if columns != 1 {
                    return Err(Error::unsupported(
                        "multi-column membership",
                        format!("Contains sub-query must select one column, not {columns}"),
                    ));
                }
                format!("IN ({sql})")
            }
        };
        let mut members = self.members(&owner_key, &collection)?;
        members.conds.push(format!("{} {}", members.key, needle));
        Ok(format!("EXISTS ({})", self.finish_members(members, "1")?))
    }
}
