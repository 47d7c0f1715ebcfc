//! Recursive-descent compiler from the query AST to dialect SQL.
//!
//! Every node compiles to an owned SQL fragment. Parameters are emitted as
//! markers and numbered in text order once the whole statement is
//! assembled, so fragments can be composed in any order. FROM clauses are
//! rendered last because resolving paths anywhere in a query (including
//! correlated sub-queries) may add joins to an enclosing scope.

mod collection;
mod literal;
mod output;
mod resolve;

pub use output::{CompiledQuery, ParamSlot, ParamSource};

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use sqlobject_core::identifiers::is_valid_identifier;
use sqlobject_core::{ClassInfo, Error, Result, Schema, Value};

use crate::ast::{BinaryOp, Expr, Paging, Path, Query, UnaryOp};
use crate::dialect::{Dialect, OuterJoinSyntax, PagingStrategy};
use resolve::{ObjRef, Resolved, Scope, Want};

/// Compiler switches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Inline literals that are provably safe instead of binding them
    pub inline_safe_literals: bool,
    /// Longest text literal that may be inlined
    pub max_inline_literal_len: usize,
    /// Overrides the dialect's paging strategy
    pub paging: Option<PagingStrategy>,
    /// Overrides the dialect's outer join syntax
    pub outer_join_syntax: Option<OuterJoinSyntax>,
    /// Make every hop after an outer hop outer as well.
    ///
    /// Off by default, each hop is joined by its own field's nullability.
    /// A projection like `p.manager.department.name` then joins the
    /// department with an inner join after the outer manager join, and rows
    /// without a manager drop out. Turn this on to keep them.
    pub propagate_outer_joins: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            inline_safe_literals: true,
            max_inline_literal_len: 64,
            paging: None,
            outer_join_syntax: None,
            propagate_outer_joins: false,
        }
    }
}

impl CompileOptions {
    pub fn paging(mut self, strategy: PagingStrategy) -> Self {
        self.paging = Some(strategy);
        self
    }

    pub fn outer_join_syntax(mut self, syntax: OuterJoinSyntax) -> Self {
        self.outer_join_syntax = Some(syntax);
        self
    }

    /// Bind every literal as a parameter.
    pub fn bind_all_literals(mut self) -> Self {
        self.inline_safe_literals = false;
        self
    }
}

/// Compiles queries against one schema for one dialect.
#[derive(Debug, Clone)]
pub struct Compiler<'s> {
    schema: &'s Schema,
    dialect: Dialect,
    options: CompileOptions,
}

impl<'s> Compiler<'s> {
    pub fn new(schema: &'s Schema, dialect: Dialect) -> Self {
        Self {
            schema,
            dialect,
            options: CompileOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn options(&self) -> &CompileOptions {
        &self.options
    }

    pub fn schema(&self) -> &'s Schema {
        self.schema
    }

    /// Compile a full query into SQL text and ordered parameter slots.
    #[tracing::instrument(level = "debug", skip(self, query), fields(dialect = ?self.dialect))]
    pub fn compile(&self, query: &Query) -> Result<CompiledQuery> {
        let mut state = State::new(self.schema, self.dialect, &self.options);
        let (sql, columns) = state.compile_query(query)?;
        let (sql, slots) = output::number_placeholders(&sql, &state.slots, self.dialect)?;
        tracing::trace!(sql = %sql, params = slots.len(), "compiled query");
        Ok(CompiledQuery {
            sql,
            slots,
            columns,
            dependent_classes: state.dependent_classes.into_iter().collect(),
            dependent_relations: state.dependent_relations.into_iter().collect(),
        })
    }
}

/// Compile `query` with default options.
pub fn compile(query: &Query, schema: &Schema, dialect: Dialect) -> Result<CompiledQuery> {
    Compiler::new(schema, dialect).compile(query)
}

/// Mutable state of one compilation.
struct State<'s> {
    schema: &'s Schema,
    dialect: Dialect,
    options: &'s CompileOptions,
    outer_syntax: OuterJoinSyntax,
    paging: PagingStrategy,
    /// Query scopes, outermost first
    scopes: Vec<Scope>,
    slots: Vec<ParamSlot>,
    next_alias: usize,
    dependent_classes: BTreeSet<String>,
    dependent_relations: BTreeSet<String>,
}

/// One projected column and its caller-chosen alias.
type SelectColumn = (String, Option<String>);

fn is_null_literal(expr: &Expr) -> bool {
    matches!(
        expr,
        Expr::Literal {
            value: Value::Null,
            ..
        }
    )
}

fn negation(negated: bool) -> &'static str {
    if negated { "NOT " } else { "" }
}

impl<'s> State<'s> {
    fn new(schema: &'s Schema, dialect: Dialect, options: &'s CompileOptions) -> Self {
        Self {
            schema,
            dialect,
            options,
            outer_syntax: options
                .outer_join_syntax
                .unwrap_or(dialect.default_outer_join_syntax()),
            paging: options.paging.unwrap_or(dialect.default_paging()),
            scopes: Vec::new(),
            slots: Vec::new(),
            next_alias: 0,
            dependent_classes: BTreeSet::new(),
            dependent_relations: BTreeSet::new(),
        }
    }

    fn compile_expr(&mut self, expr: &Expr) -> Result<String> {
        match expr {
            Expr::Path(path) => self.value_of(path),
            Expr::Literal { value, declared } => Ok(self.literal(value, *declared)),
            Expr::Parameter { index, declared } => Ok(self.external(*index, *declared)),
            Expr::Binary { left, op, right } => self.binary(left, *op, right),
            Expr::Unary { op, expr } => {
                let inner = self.compile_expr(expr)?;
                Ok(match op {
                    UnaryOp::Not => format!("NOT ({inner})"),
                    UnaryOp::Neg => format!("-({inner})"),
                })
            }
            Expr::IsNull { expr, negated } => Ok(format!(
                "{} IS {}NULL",
                self.compile_expr(expr)?,
                negation(*negated)
            )),
            Expr::In {
                expr,
                list,
                negated,
            } => {
                if list.is_empty() {
                    return Ok(if *negated { "1 = 1" } else { "1 = 0" }.to_string());
                }
                let lhs = self.compile_expr(expr)?;
                let items = list
                    .iter()
                    .map(|e| self.compile_expr(e))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("{lhs} {}IN ({})", negation(*negated), items.join(", ")))
            }
            Expr::InQuery {
                expr,
                query,
                negated,
            } => {
                let lhs = self.compile_expr(expr)?;
                let sql = self.scalar_query(query)?;
                Ok(format!("{lhs} {}IN ({sql})", negation(*negated)))
            }
            Expr::Like {
                expr,
                pattern,
                negated,
            } => {
                let lhs = self.compile_expr(expr)?;
                let pattern = self.compile_expr(pattern)?;
                Ok(format!("{lhs} {}LIKE {pattern}", negation(*negated)))
            }
            Expr::Count(path) => self.count(path),
            Expr::Contains { collection, target } => self.contains(collection, target),
            Expr::Exists(query) => {
                let (sql, _) = self.compile_query(query)?;
                Ok(format!("EXISTS ({sql})"))
            }
            Expr::Subquery(query) => Ok(format!("({})", self.scalar_query(query)?)),
            Expr::ClassOf(path) => self.class_of(path),
            Expr::Function { name, args } => {
                if !is_valid_identifier(name) {
                    return Err(Error::unsupported(
                        "function",
                        format!("'{name}' is not a valid function name"),
                    ));
                }
                let args = args
                    .iter()
                    .map(|a| self.compile_expr(a))
                    .collect::<Result<Vec<_>>>()?;
                Ok(format!("{}({})", name.to_uppercase(), args.join(", ")))
            }
            Expr::Star => Ok("*".to_string()),
        }
    }

    fn binary(&mut self, left: &Expr, op: BinaryOp, right: &Expr) -> Result<String> {
        if matches!(op, BinaryOp::Eq | BinaryOp::Ne) {
            let operand = if is_null_literal(right) {
                Some(left)
            } else if is_null_literal(left) {
                Some(right)
            } else {
                None
            };
            if let Some(operand) = operand {
                let sql = self.compile_expr(operand)?;
                return Ok(format!("{sql} IS {}NULL", negation(op == BinaryOp::Ne)));
            }
        }
        let l = self.compile_expr(left)?;
        let r = self.compile_expr(right)?;
        Ok(match op {
            BinaryOp::Concat => self.dialect.concat(&l, &r),
            BinaryOp::Mod if self.dialect == Dialect::Oracle => format!("MOD({l}, {r})"),
            op if op.is_comparison() => format!("{l} {} {r}", op.as_str()),
            op => format!("({l} {} {r})", op.as_str()),
        })
    }

    /// A path in value position: a column, or the key of an object.
    fn value_of(&mut self, path: &Path) -> Result<String> {
        match self.resolve(path, Want::Value)? {
            Resolved::Column(column) => Ok(column),
            Resolved::Object(obj) => self.key_column(&obj),
            Resolved::Collection(..) => Err(Error::unsupported(
                "collection value",
                format!("'{path}' is a collection"),
            )),
        }
    }

    /// Sub-query producing exactly one column.
    fn scalar_query(&mut self, query: &Query) -> Result<String> {
        let (sql, columns) = self.compile_query(query)?;
        if columns != 1 {
            return Err(Error::unsupported(
                "multi-column sub-query",
                format!("sub-query must select one column, not {columns}"),
            ));
        }
        Ok(sql)
    }

    /// Concrete class name of the object at `path`.
    fn class_of(&mut self, path: &Path) -> Result<String> {
        let obj = match self.resolve(path, Want::Object)? {
            Resolved::Object(obj) => obj,
            _ => return Err(Error::unresolved(path.last(), "references")),
        };
        let schema = self.schema;
        let class = schema.class(&obj.class)?;
        let concrete: Vec<&ClassInfo> = class
            .concrete_classes
            .iter()
            .filter_map(|c| schema.get_class(c))
            .collect();
        match (class.discriminator, concrete.as_slice()) {
            (Some(ordinal), list) if list.len() > 1 => {
                let column = self.column_of(&obj, &class.fields[ordinal])?;
                let mut sql = format!("CASE {column}");
                for c in list {
                    let Some(value) = &c.discriminator_value else {
                        continue;
                    };
                    let value = self.literal(value, None);
                    let name = self.literal(&Value::from(c.name.as_str()), None);
                    sql.push_str(&format!(" WHEN {value} THEN {name}"));
                }
                sql.push_str(" END");
                Ok(sql)
            }
            (_, [only]) => Ok(self.literal(&Value::from(only.name.as_str()), None)),
            _ => Ok(self.literal(&Value::from(class.name.as_str()), None)),
        }
    }

    fn select_items(&mut self, query: &Query, first: &ObjRef) -> Result<Vec<SelectColumn>> {
        let mut items = Vec::new();
        if query.select.is_empty() {
            for column in self.key_columns(first)? {
                items.push((column, None));
            }
            return Ok(items);
        }
        for item in &query.select {
            if let Some(alias) = &item.alias {
                if !is_valid_identifier(alias) {
                    return Err(Error::unsupported(
                        "select alias",
                        format!("'{alias}' is not a valid alias"),
                    ));
                }
            }
            let Expr::Path(path) = &item.expr else {
                items.push((self.compile_expr(&item.expr)?, item.alias.clone()));
                continue;
            };
            match self.resolve(path, Want::Any)? {
                Resolved::Column(column) => items.push((column, item.alias.clone())),
                Resolved::Object(obj) => {
                    let keys = self.key_columns(&obj)?;
                    let alias = if keys.len() == 1 { item.alias.clone() } else { None };
                    items.extend(keys.into_iter().map(|k| (k, alias.clone())));
                }
                Resolved::Collection(..) => {
                    return Err(Error::unsupported(
                        "collection value",
                        format!("'{path}' is a collection; select its Count instead"),
                    ));
                }
            }
        }
        Ok(items)
    }

    /// Compile a query in a fresh scope, returning its SQL and column count.
    fn compile_query(&mut self, query: &Query) -> Result<(String, usize)> {
        if query.from.is_empty() {
            return Err(Error::unsupported(
                "empty FROM",
                "a query needs at least one FROM source",
            ));
        }
        let schema = self.schema;
        let scope = self.push_scope();
        let mut sources = Vec::with_capacity(query.from.len());
        for item in &query.from {
            if !item.alias.is_empty()
                && self.scopes[scope].sources.iter().any(|s| s.name == item.alias)
            {
                return Err(Error::ambiguous(&item.alias, "FROM aliases"));
            }
            let class = schema.class(&item.class)?;
            sources.push(self.add_source(scope, &item.alias, class));
        }

        let items = self.select_items(query, &sources[0])?;

        let mut conds = Vec::new();
        if let Some(filter) = &query.filter {
            conds.push(self.compile_expr(filter)?);
        }
        for source in &sources {
            let class = schema.class(&source.class)?;
            if schema.needs_discriminator_filter(&class.name) {
                conds.push(self.discriminator_condition(&source.alias, class)?);
            }
        }
        let group = query
            .group_by
            .iter()
            .map(|e| self.compile_expr(e))
            .collect::<Result<Vec<_>>>()?;
        let having = query
            .having
            .as_ref()
            .map(|h| self.compile_expr(h))
            .transpose()?;
        let mut order = Vec::with_capacity(query.order_by.len());
        for o in &query.order_by {
            let sql = self.compile_expr(&o.expr)?;
            order.push(if o.descending { format!("{sql} DESC") } else { sql });
        }
        if order.is_empty() && query.paging.is_some() {
            order = if group.is_empty() {
                self.key_columns(&sources[0])?
            } else {
                group.clone()
            };
        }

        let (from, extra) = self.render_from(scope)?;
        self.scopes.truncate(scope);
        conds.extend(extra);

        let mut tail = format!(" {from}");
        if !conds.is_empty() {
            tail.push_str(" WHERE ");
            tail.push_str(&conds.join(" AND "));
        }
        if !group.is_empty() {
            tail.push_str(" GROUP BY ");
            tail.push_str(&group.join(", "));
        }
        if let Some(having) = having {
            tail.push_str(" HAVING ");
            tail.push_str(&having);
        }

        let distinct = if query.distinct { "DISTINCT " } else { "" };
        let sql = match query.paging {
            None => {
                let mut sql = format!("SELECT {distinct}{}{tail}", self.plain_list(&items));
                if !order.is_empty() {
                    sql.push_str(" ORDER BY ");
                    sql.push_str(&order.join(", "));
                }
                sql
            }
            Some(paging) => self.paged(query.distinct, &items, &tail, &order.join(", "), paging)?,
        };
        Ok((sql, items.len()))
    }

    fn plain_list(&self, items: &[SelectColumn]) -> String {
        items
            .iter()
            .map(|(expr, alias)| match alias {
                Some(alias) => format!("{expr} AS {}", self.dialect.quote_identifier(alias)),
                None => expr.clone(),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Wrap a query body so only rows `[start, start + count)` come back.
    fn paged(
        &self,
        distinct: bool,
        items: &[SelectColumn],
        tail: &str,
        order: &str,
        paging: Paging,
    ) -> Result<String> {
        let Paging { start, count } = paging;
        let end = start.saturating_add(count);
        let keyword = if distinct { "DISTINCT " } else { "" };
        if self.paging == PagingStrategy::LimitOffset {
            return Ok(format!(
                "SELECT {keyword}{}{tail} ORDER BY {order}{}",
                self.plain_list(items),
                self.dialect.limit_offset(start, count)
            ));
        }

        let names: Vec<String> = items
            .iter()
            .enumerate()
            .map(|(i, (_, alias))| match alias {
                Some(alias) => self.dialect.quote_identifier(alias),
                None => format!("c{i}"),
            })
            .collect();
        let aliased = items
            .iter()
            .zip(&names)
            .map(|((expr, _), name)| format!("{expr} AS {name}"))
            .collect::<Vec<_>>()
            .join(", ");
        let outer = |table: &str| {
            names
                .iter()
                .map(|n| format!("{table}.{n}"))
                .collect::<Vec<_>>()
                .join(", ")
        };

        match self.paging {
            PagingStrategy::WindowRowNumber => {
                if distinct {
                    return Err(Error::unsupported(
                        "distinct paging",
                        "DISTINCT cannot be combined with row-number window paging",
                    ));
                }
                Ok(format!(
                    "SELECT {} FROM (SELECT {aliased}, ROW_NUMBER() OVER (ORDER BY {order}) AS rn__{tail}) pg \
                     WHERE pg.rn__ > {start} AND pg.rn__ <= {end} ORDER BY pg.rn__",
                    outer("pg")
                ))
            }
            _ => Ok(format!(
                "SELECT {} FROM (SELECT pg1.*, ROWNUM AS rn__ FROM \
                 (SELECT {keyword}{aliased}{tail} ORDER BY {order}) pg1 WHERE ROWNUM <= {end}) pg2 \
                 WHERE pg2.rn__ > {start} ORDER BY pg2.rn__",
                outer("pg2")
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::OrderBy;
    use sqlobject_core::{
        ClassDef, CollectionInfo, DeleteAction, ErrorKind, FieldInfo, RelationInfo, SchemaBuilder,
        SqlType,
    };

    fn schema() -> Schema {
        SchemaBuilder::new()
            .class(
                ClassDef::new("Department")
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("name", SqlType::Text)),
            )
            .class(
                ClassDef::new("Person")
                    .discriminator("kind")
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("name", SqlType::Text))
                    .field(FieldInfo::new("kind", SqlType::Text))
                    .field(
                        FieldInfo::new("managerId", SqlType::BigInt)
                            .nullable()
                            .references("Person")
                            .navigation("manager")
                            .delete_action(DeleteAction::Nullify),
                    )
                    .field(
                        FieldInfo::new("departmentId", SqlType::BigInt)
                            .references("Department")
                            .navigation("department"),
                    )
                    .collection(CollectionInfo::one_to_many("Reports", "Person", "managerId")),
            )
            .class(
                ClassDef::new("Employee")
                    .extends("Person")
                    .table("Employee")
                    .field(FieldInfo::new("salary", SqlType::Double)),
            )
            .class(
                ClassDef::new("Contractor")
                    .extends("Person")
                    .discriminator_value("C")
                    .field(FieldInfo::new("agency", SqlType::Text).nullable()),
            )
            .class(
                ClassDef::new("Project")
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("title", SqlType::Text))
                    .collection(CollectionInfo::many_to_many("Members", "PersonProject").reversed()),
            )
            .class(
                ClassDef::new("Order")
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .collection(CollectionInfo::one_to_many("Lines", "OrderLine", "orderId")),
            )
            .class(
                ClassDef::new("OrderLine")
                    .field(
                        FieldInfo::new("orderId", SqlType::BigInt)
                            .primary_key()
                            .references("Order"),
                    )
                    .field(FieldInfo::new("lineNo", SqlType::Integer).primary_key()),
            )
            .relation(RelationInfo::new(
                "PersonProject",
                "Person",
                "person_id",
                "Project",
                "project_id",
            ))
            .build()
            .unwrap()
    }

    fn sqlite(query: &Query) -> CompiledQuery {
        let schema = schema();
        compile(query, &schema, Dialect::Sqlite).unwrap()
    }

    #[test]
    fn nullable_reference_compiles_to_outer_join() {
        let q = Query::from("Person", "p").filter(Expr::path("p.manager.name").eq("X"));
        let c = sqlite(&q);
        assert_eq!(
            c.sql,
            "SELECT t0.\"id\" FROM \"Person\" t0 LEFT JOIN \"Person\" t1 ON t1.\"id\" = t0.\"managerId\" \
             WHERE t1.\"name\" = 'X'"
        );
        assert!(c.slots.is_empty());
    }

    #[test]
    fn join_kind_follows_each_hop() {
        let q = Query::from("Person", "p")
            .filter(Expr::path("p.manager.department.name").eq("R&D"))
            .filter(Expr::path("p.department.name").ne("Ops"));
        let sql = sqlite(&q).sql;
        assert_eq!(sql.matches("LEFT JOIN").count(), 1);
        assert_eq!(sql.matches("INNER JOIN").count(), 2);

        let schema = schema();
        let propagated = Compiler::new(&schema, Dialect::Sqlite)
            .with_options(CompileOptions {
                propagate_outer_joins: true,
                ..CompileOptions::default()
            })
            .compile(&q)
            .unwrap();
        assert_eq!(propagated.sql.matches("LEFT JOIN").count(), 2);

        let projected = Query::from("Person", "p").select(Expr::path("p.manager.department.name"));
        let per_hop = sqlite(&projected).sql;
        assert!(per_hop.contains("LEFT JOIN") && per_hop.contains("INNER JOIN"));
        let kept = Compiler::new(&schema, Dialect::Sqlite)
            .with_options(CompileOptions {
                propagate_outer_joins: true,
                ..CompileOptions::default()
            })
            .compile(&projected)
            .unwrap();
        assert!(!kept.sql.contains("INNER JOIN"));
        assert_eq!(kept.sql.matches("LEFT JOIN").count(), 2);
    }

    #[test]
    fn repeated_prefix_reuses_join() {
        let q = Query::from("Person", "p")
            .select(Expr::path("p.manager.name"))
            .filter(Expr::path("p.manager.id").gt(3i64))
            .order_by(OrderBy::asc(Expr::path("p.manager.name")));
        let sql = sqlite(&q).sql;
        assert_eq!(sql.matches("JOIN").count(), 1);
    }

    #[test]
    fn reference_in_value_position_is_the_foreign_key() {
        let q = Query::from("Person", "p").filter(Expr::path("p.manager").is_null());
        assert_eq!(
            sqlite(&q).sql,
            "SELECT t0.\"id\" FROM \"Person\" t0 WHERE t0.\"managerId\" IS NULL"
        );
    }

    #[test]
    fn one_to_many_count_is_correlated() {
        let q = Query::from("Person", "p").filter(Expr::count("p.Reports").gt(2i64));
        assert_eq!(
            sqlite(&q).sql,
            "SELECT t0.\"id\" FROM \"Person\" t0 WHERE \
             (SELECT COUNT(*) FROM \"Person\" t1 WHERE t1.\"managerId\" = t0.\"id\") > 2"
        );
    }

    #[test]
    fn contains_lowers_to_exists() {
        let q = Query::from("Person", "p").filter(Expr::contains("Reports", Expr::param(0)));
        let c = sqlite(&q);
        assert_eq!(
            c.sql,
            "SELECT t0.\"id\" FROM \"Person\" t0 WHERE EXISTS \
             (SELECT 1 FROM \"Person\" t1 WHERE t1.\"managerId\" = t0.\"id\" AND t1.\"id\" = ?1)"
        );
        assert!(c.has_external());
    }

    #[test]
    fn many_to_many_contains_uses_relation_table() {
        let q = Query::from("Person", "p")
            .also_from("Project", "j")
            .filter(Expr::contains("j.Members", Expr::path("p")));
        let c = sqlite(&q);
        assert!(c.sql.contains(
            "EXISTS (SELECT 1 FROM \"PersonProject\" t2 WHERE t2.\"project_id\" = t1.\"id\" AND t2.\"person_id\" = t0.\"id\")"
        ));
        assert_eq!(c.dependent_relations, vec!["PersonProject".to_string()]);
    }

    #[test]
    fn contains_over_composite_key_is_unsupported() {
        let schema = schema();
        let q = Query::from("Order", "o").filter(Expr::contains("o.Lines", Expr::lit(1i64)));
        let err = compile(&q, &schema, Dialect::Sqlite).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnsupportedQueryFeature);
    }

    #[test]
    fn unresolved_and_ambiguous_names() {
        let schema = schema();
        let err = compile(
            &Query::from("Person", "p").filter(Expr::path("p.nickname").eq("x")),
            &schema,
            Dialect::Sqlite,
        )
        .unwrap_err();
        match err {
            Error::SchemaResolution(e) => {
                assert_eq!(e.segment, "nickname");
                assert!(!e.ambiguous);
            }
            other => panic!("unexpected error: {other}"),
        }

        let both = Query::from("Person", "a")
            .also_from("Department", "d")
            .filter(Expr::path("name").eq("x"));
        match compile(&both, &schema, Dialect::Sqlite).unwrap_err() {
            Error::SchemaResolution(e) => assert!(e.ambiguous),
            other => panic!("unexpected error: {other}"),
        }

        // salary lives on Employee, not Person
        let missing = Query::from("Person", "a")
            .also_from("Department", "d")
            .filter(Expr::path("salary").gt(1i64));
        assert!(compile(&missing, &schema, Dialect::Sqlite).is_err());
        let ok = Query::from("Person", "a")
            .also_from("Department", "d")
            .filter(Expr::path("kind").eq("C"));
        assert!(compile(&ok, &schema, Dialect::Sqlite).is_ok());
    }

    #[test]
    fn subclass_queries_filter_by_discriminator_and_join_own_table() {
        let q = Query::from("Employee", "e").filter(Expr::path("e.salary").gt(10i64));
        assert_eq!(
            sqlite(&q).sql,
            "SELECT t0.\"id\" FROM \"Person\" t0 INNER JOIN \"Employee\" t1 ON t1.\"id\" = t0.\"id\" \
             WHERE t1.\"salary\" > 10 AND t0.\"kind\" = 'Employee'"
        );
    }

    #[test]
    fn class_of_maps_discriminator_values() {
        let q = Query::from("Person", "p").select(Expr::class_of("p"));
        assert_eq!(
            sqlite(&q).sql,
            "SELECT CASE t0.\"kind\" WHEN 'Person' THEN 'Person' WHEN 'Employee' THEN 'Employee' \
             WHEN 'C' THEN 'Contractor' END FROM \"Person\" t0"
        );
        let leaf = Query::from("Contractor", "c").select(Expr::class_of("c"));
        assert!(sqlite(&leaf).sql.starts_with("SELECT 'Contractor' FROM"));
    }

    #[test]
    fn unsafe_and_typed_literals_are_bound() {
        let q = Query::from("Person", "p")
            .filter(Expr::path("p.name").eq("O'Brien"))
            .filter(Expr::path("p.id").eq(Expr::typed_lit(7i64, SqlType::BigInt)));
        let c = sqlite(&q);
        assert!(c.sql.ends_with("WHERE (t0.\"name\" = ?1 AND t0.\"id\" = ?2)"));
        assert_eq!(
            c.params().unwrap(),
            vec![Value::from("O'Brien"), Value::BigInt(7)]
        );

        let schema = schema();
        let strict = Compiler::new(&schema, Dialect::Postgres)
            .with_options(CompileOptions::default().bind_all_literals())
            .compile(&Query::from("Person", "p").filter(Expr::path("p.name").eq("X")))
            .unwrap();
        assert!(strict.sql.ends_with("= $1"));
    }

    #[test]
    fn empty_in_list_is_constant() {
        let q = Query::from("Person", "p").filter(Expr::path("p.id").in_list(vec![]));
        assert!(sqlite(&q).sql.ends_with("WHERE 1 = 0"));
    }

    #[test]
    fn paging_strategies_have_expected_shapes() {
        let schema = schema();
        let q = Query::from("Person", "p")
            .select(Expr::path("p.id"))
            .page(10, 5);
        let limit = compile(&q, &schema, Dialect::Sqlite).unwrap();
        assert_eq!(
            limit.sql,
            "SELECT t0.\"id\" FROM \"Person\" t0 ORDER BY t0.\"id\" LIMIT 5 OFFSET 10"
        );

        let window = compile(&q, &schema, Dialect::SqlServer).unwrap();
        assert_eq!(
            window.sql,
            "SELECT pg.c0 FROM (SELECT t0.[id] AS c0, ROW_NUMBER() OVER (ORDER BY t0.[id]) AS rn__ \
             FROM [Person] t0) pg WHERE pg.rn__ > 10 AND pg.rn__ <= 15 ORDER BY pg.rn__"
        );

        let nested = compile(&q, &schema, Dialect::Oracle).unwrap();
        assert_eq!(
            nested.sql,
            "SELECT pg2.c0 FROM (SELECT pg1.*, ROWNUM AS rn__ FROM \
             (SELECT t0.\"id\" AS c0 FROM \"Person\" t0 ORDER BY t0.\"id\") pg1 WHERE ROWNUM <= 15) pg2 \
             WHERE pg2.rn__ > 10 ORDER BY pg2.rn__"
        );
    }

    #[test]
    fn nested_row_number_bounds_follow_the_page() {
        let schema = schema();
        let n = 7;
        for start in [0, 2, n - 1, n] {
            for count in [0, 1, n - 1, n, n + 1] {
                let q = Query::from("Person", "p")
                    .select(Expr::path("p.id"))
                    .page(start, count);
                let sql = compile(&q, &schema, Dialect::Oracle).unwrap().sql;
                assert_eq!(
                    sql,
                    format!(
                        "SELECT pg2.c0 FROM (SELECT pg1.*, ROWNUM AS rn__ FROM \
                         (SELECT t0.\"id\" AS c0 FROM \"Person\" t0 ORDER BY t0.\"id\") pg1 \
                         WHERE ROWNUM <= {}) pg2 WHERE pg2.rn__ > {start} ORDER BY pg2.rn__",
                        start + count
                    ),
                    "start={start} count={count}"
                );
            }
        }
    }

    #[test]
    fn oracle_outer_join_syntax() {
        let schema = schema();
        let q = Query::from("Person", "p").filter(Expr::path("p.manager.name").eq("X"));
        let c = Compiler::new(&schema, Dialect::Oracle)
            .with_options(CompileOptions::default().outer_join_syntax(OuterJoinSyntax::Oracle))
            .compile(&q)
            .unwrap();
        assert_eq!(
            c.sql,
            "SELECT t0.\"id\" FROM \"Person\" t0, \"Person\" t1 \
             WHERE t1.\"name\" = 'X' AND t1.\"id\"(+) = t0.\"managerId\""
        );
    }

    #[test]
    fn correlated_subquery_joins_land_in_outer_scope() {
        let q = Query::from("Person", "p").filter(Expr::exists(
            Query::from("Department", "d").filter(Expr::path("d.name").eq(Expr::path("p.manager.name"))),
        ));
        let sql = sqlite(&q).sql;
        assert!(sql.starts_with("SELECT t0.\"id\" FROM \"Person\" t0 LEFT JOIN \"Person\" t2"));
        assert!(sql.contains("EXISTS (SELECT t1.\"id\" FROM \"Department\" t1 WHERE t1.\"name\" = t2.\"name\")"));
    }

    #[test]
    fn compilation_is_deterministic() {
        let q = Query::from("Person", "p")
            .filter(Expr::path("p.manager.name").like("A%"))
            .order_by(OrderBy::desc(Expr::path("p.name")));
        assert_eq!(sqlite(&q).sql, sqlite(&q).sql);
    }
}
