//! Object query AST.
//!
//! Queries are written against classes, fields and collections, never
//! against tables and columns. A [`Path`] like `p.manager.name` starts at a
//! FROM alias (or at an unqualified member of one FROM source) and steps
//! through reference fields.

use std::fmt;

use sqlobject_core::{SqlType, Value};

/// A dotted chain of property names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Path {
    pub segments: Vec<String>,
}

impl Path {
    /// Split `text` on dots.
    pub fn parse(text: &str) -> Self {
        Self {
            segments: text.split('.').map(str::to_string).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn first(&self) -> &str {
        self.segments.first().map_or("", String::as_str)
    }

    pub fn last(&self) -> &str {
        self.segments.last().map_or("", String::as_str)
    }

    /// All segments but the last.
    pub fn parent(&self) -> Path {
        let n = self.segments.len().saturating_sub(1);
        Path {
            segments: self.segments[..n].to_vec(),
        }
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.segments.join("."))
    }
}

impl From<&str> for Path {
    fn from(text: &str) -> Self {
        Path::parse(text)
    }
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Concat,
}

impl BinaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Concat => "||",
        }
    }

    pub const fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub const fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Not,
    Neg,
}

/// What a collection is tested against in `Contains`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContainsTarget {
    /// A single member key or object path
    Value(Box<Expr>),
    /// Member keys produced by a sub-query
    Query(Box<Query>),
}

/// Query expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Expr {
    /// Field, reference or object path
    Path(Path),
    /// Literal value, optionally tagged with the type it must be bound as
    Literal {
        value: Value,
        declared: Option<SqlType>,
    },
    /// External positional parameter (0-based)
    Parameter {
        index: usize,
        declared: Option<SqlType>,
    },
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },
    Unary {
        op: UnaryOp,
        expr: Box<Expr>,
    },
    IsNull {
        expr: Box<Expr>,
        negated: bool,
    },
    In {
        expr: Box<Expr>,
        list: Vec<Expr>,
        negated: bool,
    },
    InQuery {
        expr: Box<Expr>,
        query: Box<Query>,
        negated: bool,
    },
    Like {
        expr: Box<Expr>,
        pattern: Box<Expr>,
        negated: bool,
    },
    /// Number of members of a collection path
    Count(Path),
    /// Whether a collection path holds a member
    Contains {
        collection: Path,
        target: ContainsTarget,
    },
    Exists(Box<Query>),
    /// Scalar sub-query
    Subquery(Box<Query>),
    /// Name of the concrete class of the object at a path
    ClassOf(Path),
    /// Function call; aggregates included
    Function {
        name: String,
        args: Vec<Expr>,
    },
    /// `*`, only meaningful as a function argument
    Star,
}

impl Expr {
    pub fn path(text: &str) -> Self {
        Expr::Path(Path::parse(text))
    }

    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal {
            value: value.into(),
            declared: None,
        }
    }

    /// Literal bound with an explicit type.
    pub fn typed_lit(value: impl Into<Value>, declared: SqlType) -> Self {
        Expr::Literal {
            value: value.into(),
            declared: Some(declared),
        }
    }

    pub fn param(index: usize) -> Self {
        Expr::Parameter {
            index,
            declared: None,
        }
    }

    pub fn typed_param(index: usize, declared: SqlType) -> Self {
        Expr::Parameter {
            index,
            declared: Some(declared),
        }
    }

    pub fn count(collection: &str) -> Self {
        Expr::Count(Path::parse(collection))
    }

    pub fn contains(collection: &str, member: Expr) -> Self {
        Expr::Contains {
            collection: Path::parse(collection),
            target: ContainsTarget::Value(Box::new(member)),
        }
    }

    pub fn contains_any(collection: &str, query: Query) -> Self {
        Expr::Contains {
            collection: Path::parse(collection),
            target: ContainsTarget::Query(Box::new(query)),
        }
    }

    pub fn class_of(path: &str) -> Self {
        Expr::ClassOf(Path::parse(path))
    }

    pub fn exists(query: Query) -> Self {
        Expr::Exists(Box::new(query))
    }

    pub fn subquery(query: Query) -> Self {
        Expr::Subquery(Box::new(query))
    }

    pub fn func(name: &str, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.to_string(),
            args,
        }
    }

    /// `COUNT(*)`
    pub fn count_star() -> Self {
        Expr::func("COUNT", vec![Expr::Star])
    }

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    pub fn add(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Add, other)
    }

    pub fn sub(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Sub, other)
    }

    pub fn mul(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Mul, other)
    }

    pub fn div(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Div, other)
    }

    pub fn concat(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Concat, other)
    }

    pub fn not(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Not,
            expr: Box::new(self),
        }
    }

    pub fn neg(self) -> Self {
        Expr::Unary {
            op: UnaryOp::Neg,
            expr: Box::new(self),
        }
    }

    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    pub fn in_list(self, list: Vec<Expr>) -> Self {
        Expr::In {
            expr: Box::new(self),
            list,
            negated: false,
        }
    }

    pub fn in_query(self, query: Query) -> Self {
        Expr::InQuery {
            expr: Box::new(self),
            query: Box::new(query),
            negated: false,
        }
    }

    pub fn like(self, pattern: impl Into<Expr>) -> Self {
        Expr::Like {
            expr: Box::new(self),
            pattern: Box::new(pattern.into()),
            negated: false,
        }
    }

    /// Whether this expression is a literal or an external parameter.
    pub fn is_bindable(&self) -> bool {
        matches!(self, Expr::Literal { .. } | Expr::Parameter { .. })
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::lit(value)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::lit(s)
    }
}

impl From<i32> for Expr {
    fn from(v: i32) -> Self {
        Expr::lit(v)
    }
}

impl From<i64> for Expr {
    fn from(v: i64) -> Self {
        Expr::lit(v)
    }
}

impl From<bool> for Expr {
    fn from(v: bool) -> Self {
        Expr::lit(v)
    }
}

impl From<f64> for Expr {
    fn from(v: f64) -> Self {
        Expr::lit(v)
    }
}

/// One source of the FROM list.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FromItem {
    pub class: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SelectItem {
    pub expr: Expr,
    pub alias: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OrderBy {
    pub expr: Expr,
    pub descending: bool,
}

impl OrderBy {
    pub fn asc(expr: Expr) -> Self {
        Self {
            expr,
            descending: false,
        }
    }

    pub fn desc(expr: Expr) -> Self {
        Self {
            expr,
            descending: true,
        }
    }
}

/// Half-open row window `[start, start + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Paging {
    pub start: usize,
    pub count: usize,
}

/// A full query expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Query {
    pub distinct: bool,
    /// Empty selects the key of the first FROM source
    pub select: Vec<SelectItem>,
    pub from: Vec<FromItem>,
    pub filter: Option<Expr>,
    pub group_by: Vec<Expr>,
    pub having: Option<Expr>,
    pub order_by: Vec<OrderBy>,
    pub paging: Option<Paging>,
}

impl Query {
    /// `SELECT ... FROM class alias`
    pub fn from(class: &str, alias: &str) -> Self {
        Self {
            from: vec![FromItem {
                class: class.to_string(),
                alias: alias.to_string(),
            }],
            ..Self::default()
        }
    }

    /// Add another FROM source.
    pub fn also_from(mut self, class: &str, alias: &str) -> Self {
        self.from.push(FromItem {
            class: class.to_string(),
            alias: alias.to_string(),
        });
        self
    }

    pub fn select(mut self, expr: Expr) -> Self {
        self.select.push(SelectItem { expr, alias: None });
        self
    }

    pub fn select_as(mut self, expr: Expr, alias: &str) -> Self {
        self.select.push(SelectItem {
            expr,
            alias: Some(alias.to_string()),
        });
        self
    }

    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// AND `expr` into the filter.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    pub fn having(mut self, expr: Expr) -> Self {
        self.having = Some(expr);
        self
    }

    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    pub fn page(mut self, start: usize, count: usize) -> Self {
        self.paging = Some(Paging { start, count });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_parsing() {
        let p = Path::parse("p.manager.name");
        assert_eq!(p.len(), 3);
        assert_eq!(p.first(), "p");
        assert_eq!(p.last(), "name");
        assert_eq!(p.parent().to_string(), "p.manager");
    }

    #[test]
    fn filters_are_anded() {
        let q = Query::from("Person", "p")
            .filter(Expr::path("p.name").eq("a"))
            .filter(Expr::path("p.id").gt(1i64));
        assert!(matches!(
            q.filter,
            Some(Expr::Binary {
                op: BinaryOp::And,
                ..
            })
        ));
    }
}
