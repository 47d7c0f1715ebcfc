//! Path resolution, join synthesis and FROM rendering.

use std::collections::HashMap;

use sqlobject_core::{ClassInfo, CollectionInfo, Error, FieldInfo, Result};

use super::State;
use crate::ast::Path;
use crate::dialect::OuterJoinSyntax;

/// A FROM source of one query scope.
#[derive(Debug, Clone)]
pub(super) struct Source {
    /// Query alias; empty for synthesized sources
    pub name: String,
    /// Class of the rows; empty for relation tables
    pub class: String,
    pub table: String,
    pub alias: String,
}

#[derive(Debug, Clone)]
pub(super) enum JoinCond {
    /// `joined = other`
    Eq { joined: String, other: String },
    /// `joined IN (values)`
    In { joined: String, values: Vec<String> },
}

#[derive(Debug, Clone)]
pub(super) struct JoinSpec {
    /// Index of the source this join chain hangs from
    pub root: usize,
    pub outer: bool,
    pub table: String,
    pub alias: String,
    pub conds: Vec<JoinCond>,
}

/// Sources and synthesized joins of one SELECT.
#[derive(Debug, Default)]
pub(super) struct Scope {
    pub sources: Vec<Source>,
    pub joins: Vec<JoinSpec>,
    /// (source alias, destination) -> joined alias
    pub join_index: HashMap<(String, String), String>,
}

/// An object reachable in some scope: its class and primary-table alias.
#[derive(Debug, Clone)]
pub(super) struct ObjRef {
    pub class: String,
    pub alias: String,
    pub scope: usize,
    pub root: usize,
    pub outer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Want {
    /// Scalar value; an object path yields its key
    Value,
    Object,
    Collection,
    /// Whatever the path ends on
    Any,
}

#[derive(Debug)]
pub(super) enum Resolved {
    Column(String),
    Object(ObjRef),
    Collection(ObjRef, CollectionInfo),
}

impl<'s> State<'s> {
    pub(super) fn new_alias(&mut self) -> String {
        let alias = format!("t{}", self.next_alias);
        self.next_alias += 1;
        alias
    }

    pub(super) fn col(&self, alias: &str, column: &str) -> String {
        format!("{}.{}", alias, self.dialect.quote_identifier(column))
    }

    pub(super) fn push_scope(&mut self) -> usize {
        self.scopes.push(Scope::default());
        self.scopes.len() - 1
    }

    /// Register a class source in scope `scope`.
    pub(super) fn add_source(&mut self, scope: usize, name: &str, class: &ClassInfo) -> ObjRef {
        let alias = self.new_alias();
        let root = self.scopes[scope].sources.len();
        self.scopes[scope].sources.push(Source {
            name: name.to_string(),
            class: class.name.clone(),
            table: class.primary_table().name.clone(),
            alias: alias.clone(),
        });
        self.dependent_classes.insert(class.name.clone());
        ObjRef {
            class: class.name.clone(),
            alias,
            scope,
            root,
            outer: false,
        }
    }

    /// Register a relation table source in scope `scope`, returning its alias.
    pub(super) fn add_relation_source(&mut self, scope: usize, table: &str) -> String {
        let alias = self.new_alias();
        self.scopes[scope].sources.push(Source {
            name: String::new(),
            class: String::new(),
            table: table.to_string(),
            alias: alias.clone(),
        });
        self.dependent_relations.insert(table.to_string());
        alias
    }

    /// Add a join to a class's primary table, hanging from `root`.
    ///
    /// `on` pairs a column of the joined table with the expression it equals.
    pub(super) fn add_class_join(
        &mut self,
        scope: usize,
        root: usize,
        class: &ClassInfo,
        outer: bool,
        on: Vec<(String, String)>,
    ) -> Result<ObjRef> {
        let alias = self.new_alias();
        let mut conds: Vec<JoinCond> = on
            .into_iter()
            .map(|(column, other)| JoinCond::Eq {
                joined: self.col(&alias, &column),
                other,
            })
            .collect();
        if self.schema.needs_discriminator_filter(&class.name) {
            let (joined, values) = self.discriminator_values(&alias, class)?;
            conds.push(JoinCond::In { joined, values });
        }
        self.scopes[scope].joins.push(JoinSpec {
            root,
            outer,
            table: class.primary_table().name.clone(),
            alias: alias.clone(),
            conds,
        });
        self.dependent_classes.insert(class.name.clone());
        Ok(ObjRef {
            class: class.name.clone(),
            alias,
            scope,
            root,
            outer,
        })
    }

    /// Column of `field` on `obj`, joining its secondary table when needed.
    pub(super) fn column_of(&mut self, obj: &ObjRef, field: &FieldInfo) -> Result<String> {
        if field.primary_key || field.table_group == 0 {
            return Ok(self.col(&obj.alias, &field.column));
        }
        let schema = self.schema;
        let class = schema.class(&obj.class)?;
        let table = &class.tables[field.table_group];
        let key = (obj.alias.clone(), format!("#{}", table.name));
        if let Some(alias) = self.scopes[obj.scope].join_index.get(&key) {
            let alias = alias.clone();
            return Ok(self.col(&alias, &field.column));
        }
        let alias = self.new_alias();
        let conds = class
            .key_fields()
            .map(|k| JoinCond::Eq {
                joined: self.col(&alias, &k.column),
                other: self.col(&obj.alias, &k.column),
            })
            .collect();
        let scope = &mut self.scopes[obj.scope];
        scope.joins.push(JoinSpec {
            root: obj.root,
            outer: obj.outer,
            table: table.name.clone(),
            alias: alias.clone(),
            conds,
        });
        scope.join_index.insert(key, alias.clone());
        Ok(self.col(&alias, &field.column))
    }

    /// Step through reference `field` of `obj`, reusing an existing join.
    pub(super) fn navigate(&mut self, obj: &ObjRef, field: &FieldInfo) -> Result<ObjRef> {
        let schema = self.schema;
        let target_name = field.references.as_deref().unwrap_or_default();
        let target = schema.class(target_name)?;
        let key = (obj.alias.clone(), field.name.clone());
        if let Some(alias) = self.scopes[obj.scope].join_index.get(&key) {
            let alias = alias.clone();
            let outer = self.scopes[obj.scope]
                .joins
                .iter()
                .find(|j| j.alias == alias)
                .is_some_and(|j| j.outer);
            return Ok(ObjRef {
                class: target.name.clone(),
                alias,
                scope: obj.scope,
                root: obj.root,
                outer,
            });
        }
        let source_col = self.column_of(obj, field)?;
        let outer = field.nullable || (self.options.propagate_outer_joins && obj.outer);
        let target_key = target.key_fields().next().ok_or_else(|| {
            Error::unsupported("reference", format!("'{}' has no key", target.name))
        })?;
        let on = vec![(target_key.column.clone(), source_col)];
        let joined = self.add_class_join(obj.scope, obj.root, target, outer, on)?;
        self.scopes[obj.scope]
            .join_index
            .insert(key, joined.alias.clone());
        tracing::trace!(
            from = %obj.alias,
            field = %field.name,
            to = %joined.alias,
            outer,
            "join synthesized"
        );
        Ok(joined)
    }

    /// Key column of an object, for value contexts.
    pub(super) fn key_column(&self, obj: &ObjRef) -> Result<String> {
        let class = self.schema.class(&obj.class)?;
        if class.has_composite_key() {
            return Err(Error::unsupported(
                "composite key",
                format!("'{}' has a composite key and cannot be used as a single value", class.name),
            ));
        }
        let key = class
            .key_fields()
            .next()
            .ok_or_else(|| Error::unresolved("key", &class.name))?;
        Ok(self.col(&obj.alias, &key.column))
    }

    /// Every key column of an object.
    pub(super) fn key_columns(&self, obj: &ObjRef) -> Result<Vec<String>> {
        let class = self.schema.class(&obj.class)?;
        Ok(class
            .key_fields()
            .map(|k| self.col(&obj.alias, &k.column))
            .collect())
    }

    fn source_ref(&self, scope: usize, index: usize) -> ObjRef {
        let src = &self.scopes[scope].sources[index];
        ObjRef {
            class: src.class.clone(),
            alias: src.alias.clone(),
            scope,
            root: index,
            outer: false,
        }
    }

    fn scope_description(&self, scope: usize) -> String {
        let classes: Vec<String> = self.scopes[scope]
            .sources
            .iter()
            .filter(|s| !s.class.is_empty())
            .map(|s| {
                if s.name.is_empty() {
                    s.class.clone()
                } else {
                    format!("{} {}", s.class, s.name)
                }
            })
            .collect();
        format!("FROM {}", classes.join(", "))
    }

    /// Starting object of a path and the number of segments it consumed.
    fn start(&self, path: &Path) -> Result<(ObjRef, usize)> {
        let first = path.first();
        for scope in (0..self.scopes.len()).rev() {
            if let Some(i) = self.scopes[scope]
                .sources
                .iter()
                .position(|s| !s.name.is_empty() && s.name == first)
            {
                return Ok((self.source_ref(scope, i), 1));
            }
        }
        for scope in (0..self.scopes.len()).rev() {
            let matches: Vec<usize> = self.scopes[scope]
                .sources
                .iter()
                .enumerate()
                .filter(|(_, s)| {
                    !s.class.is_empty()
                        && self
                            .schema
                            .get_class(&s.class)
                            .is_some_and(|c| c.has_member(first))
                })
                .map(|(i, _)| i)
                .collect();
            match matches.as_slice() {
                [] => continue,
                [i] => return Ok((self.source_ref(scope, *i), 0)),
                _ => return Err(Error::ambiguous(first, self.scope_description(scope))),
            }
        }
        let innermost = self.scopes.len().saturating_sub(1);
        Err(Error::unresolved(first, self.scope_description(innermost)))
    }

    /// Resolve a path hop by hop.
    pub(super) fn resolve(&mut self, path: &Path, want: Want) -> Result<Resolved> {
        let schema = self.schema;
        let (mut obj, mut i) = self.start(path)?;
        let segments = &path.segments;
        if i == segments.len() {
            return match want {
                Want::Collection => Err(Error::unresolved(path.to_string(), "collections")),
                _ => Ok(Resolved::Object(obj)),
            };
        }
        while i < segments.len() {
            let segment = &segments[i];
            let last = i + 1 == segments.len();
            let class = schema.class(&obj.class)?;

            if let Some(collection) = class.collection(segment) {
                if !last {
                    return Err(Error::unsupported(
                        "collection navigation",
                        format!("'{}' in '{}' is a collection; use Count or Contains", segment, path),
                    ));
                }
                return match want {
                    Want::Collection | Want::Any => Ok(Resolved::Collection(obj, collection.clone())),
                    _ => Err(Error::unsupported(
                        "collection value",
                        format!("'{}' is a collection and has no scalar value", path),
                    )),
                };
            }

            let field = class
                .navigation(segment)
                .or_else(|| class.field(segment))
                .ok_or_else(|| Error::unresolved(segment, &class.name))?;

            if last {
                return match want {
                    Want::Object if field.is_reference() => {
                        Ok(Resolved::Object(self.navigate(&obj, field)?))
                    }
                    Want::Object => Err(Error::unresolved(
                        segment,
                        format!("references of {}", class.name),
                    )),
                    Want::Collection => Err(Error::unresolved(
                        segment,
                        format!("collections of {}", class.name),
                    )),
                    Want::Value | Want::Any => Ok(Resolved::Column(self.column_of(&obj, field)?)),
                };
            }

            if !field.is_reference() {
                return Err(Error::unresolved(
                    &segments[i + 1],
                    format!("{}.{} (not a reference)", class.name, segment),
                ));
            }
            obj = self.navigate(&obj, field)?;
            i += 1;
        }
        Ok(Resolved::Object(obj))
    }

    /// Discriminator column of `class` at `alias` and its quoted values.
    pub(super) fn discriminator_values(
        &mut self,
        alias: &str,
        class: &ClassInfo,
    ) -> Result<(String, Vec<String>)> {
        let Some(ordinal) = class.discriminator else {
            return Err(Error::unresolved("discriminator", &class.name));
        };
        let column = self.col(alias, &class.fields[ordinal].column);
        let values = self
            .schema
            .discriminator_values(&class.name)
            .iter()
            .map(|v| self.literal(v, None))
            .collect();
        Ok((column, values))
    }

    /// `alias.kind IN (...)` restricting rows to `class` and its subclasses.
    pub(super) fn discriminator_condition(&mut self, alias: &str, class: &ClassInfo) -> Result<String> {
        let (column, values) = self.discriminator_values(alias, class)?;
        Ok(in_condition(&column, &values))
    }

    /// FROM clause of a scope plus WHERE conditions contributed by joins.
    pub(super) fn render_from(&self, scope: usize) -> Result<(String, Vec<String>)> {
        let scope = &self.scopes[scope];
        let mut extra = Vec::new();
        let mut items = Vec::with_capacity(scope.sources.len());
        match self.outer_syntax {
            OuterJoinSyntax::Ansi => {
                for (i, src) in scope.sources.iter().enumerate() {
                    let mut item = format!("{} {}", self.dialect.quote_identifier(&src.table), src.alias);
                    for join in scope.joins.iter().filter(|j| j.root == i) {
                        let conds: Vec<String> = join.conds.iter().map(render_cond).collect();
                        item.push_str(&format!(
                            " {} {} {} ON {}",
                            if join.outer { "LEFT JOIN" } else { "INNER JOIN" },
                            self.dialect.quote_identifier(&join.table),
                            join.alias,
                            conds.join(" AND ")
                        ));
                    }
                    items.push(item);
                }
            }
            OuterJoinSyntax::Oracle => {
                for src in &scope.sources {
                    items.push(format!("{} {}", self.dialect.quote_identifier(&src.table), src.alias));
                }
                for join in &scope.joins {
                    items.push(format!("{} {}", self.dialect.quote_identifier(&join.table), join.alias));
                    for cond in &join.conds {
                        extra.push(render_oracle_cond(cond, join.outer)?);
                    }
                }
            }
        }
        Ok((format!("FROM {}", items.join(", ")), extra))
    }
}

pub(super) fn in_condition(column: &str, values: &[String]) -> String {
    match values {
        [] => "1 = 0".to_string(),
        [v] => format!("{column} = {v}"),
        _ => format!("{column} IN ({})", values.join(", ")),
    }
}

fn render_cond(cond: &JoinCond) -> String {
    match cond {
        JoinCond::Eq { joined, other } => format!("{joined} = {other}"),
        JoinCond::In { joined, values } => in_condition(joined, values),
    }
}

fn render_oracle_cond(cond: &JoinCond, outer: bool) -> Result<String> {
    if !outer {
        return Ok(render_cond(cond));
    }
    match cond {
        JoinCond::Eq { joined, other } => Ok(format!("{joined}(+) = {other}")),
        JoinCond::In { joined, values } => match values.as_slice() {
            [v] => Ok(format!("{joined}(+) = {v}")),
            _ => Err(Error::unsupported(
                "outer join syntax",
                "(+) outer joins cannot carry a multi-valued discriminator filter",
            )),
        },
    }
}
