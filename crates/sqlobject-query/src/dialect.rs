//! SQL dialect strategy: quoting, placeholders, type names, paging and
//! outer-join syntax.

use serde::{Deserialize, Serialize};
use sqlobject_core::SqlType;
use sqlobject_core::identifiers::{quote_ident, quote_ident_bracket, quote_ident_mysql};

/// How a row window is selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PagingStrategy {
    /// Two levels of sub-query wrapping numbered with `ROWNUM`
    NestedRowNumber,
    /// `ROW_NUMBER() OVER (ORDER BY ...)` in one wrapping sub-query
    WindowRowNumber,
    /// Native `LIMIT`/`OFFSET` (or `OFFSET ... FETCH`)
    LimitOffset,
}

/// How outer joins are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OuterJoinSyntax {
    /// `LEFT JOIN ... ON ...`
    Ansi,
    /// Comma-joined FROM list with `(+)` markers in WHERE
    Oracle,
}

/// SQL dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
    /// Oracle dialect (uses :1, :2 placeholders)
    Oracle,
    /// SQL Server dialect (uses @p1, @p2 placeholders)
    SqlServer,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
            Dialect::Oracle => format!(":{index}"),
            Dialect::SqlServer => format!("@p{index}"),
        }
    }

    /// Quote an identifier for this dialect.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite | Dialect::Oracle => quote_ident(name),
            Dialect::Mysql => quote_ident_mysql(name),
            Dialect::SqlServer => quote_ident_bracket(name),
        }
    }

    pub const fn default_paging(self) -> PagingStrategy {
        match self {
            Dialect::Postgres | Dialect::Sqlite | Dialect::Mysql => PagingStrategy::LimitOffset,
            Dialect::Oracle => PagingStrategy::NestedRowNumber,
            Dialect::SqlServer => PagingStrategy::WindowRowNumber,
        }
    }

    pub const fn default_outer_join_syntax(self) -> OuterJoinSyntax {
        OuterJoinSyntax::Ansi
    }

    pub const fn bool_literal(self, value: bool) -> &'static str {
        match (self, value) {
            (Dialect::Postgres, true) => "TRUE",
            (Dialect::Postgres, false) => "FALSE",
            (_, true) => "1",
            (_, false) => "0",
        }
    }

    /// Row window clause appended after ORDER BY.
    pub fn limit_offset(self, start: usize, count: usize) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite | Dialect::Mysql => {
                format!(" LIMIT {count} OFFSET {start}")
            }
            Dialect::Oracle | Dialect::SqlServer => {
                format!(" OFFSET {start} ROWS FETCH NEXT {count} ROWS ONLY")
            }
        }
    }

    /// Render string concatenation.
    pub fn concat(self, left: &str, right: &str) -> String {
        match self {
            Dialect::Mysql => format!("CONCAT({left}, {right})"),
            Dialect::SqlServer => format!("({left} + {right})"),
            _ => format!("({left} || {right})"),
        }
    }

    /// Column type name for this dialect.
    pub fn type_name(self, ty: SqlType) -> String {
        match (self, ty) {
            (Dialect::Sqlite, t) if t.is_integer() => "INTEGER".to_string(),
            (Dialect::Sqlite, SqlType::Boolean) => "INTEGER".to_string(),
            (Dialect::Sqlite, SqlType::Double) => "REAL".to_string(),
            (Dialect::Sqlite, SqlType::Uuid) => "BLOB".to_string(),
            (Dialect::Postgres, SqlType::Blob) => "BYTEA".to_string(),
            (Dialect::Mysql, SqlType::Uuid) => "BINARY(16)".to_string(),
            (Dialect::Mysql, SqlType::Double) => "DOUBLE".to_string(),
            (Dialect::Oracle, SqlType::Integer) => "NUMBER(10)".to_string(),
            (Dialect::Oracle, SqlType::BigInt) => "NUMBER(19)".to_string(),
            (Dialect::Oracle, SqlType::Boolean) => "NUMBER(1)".to_string(),
            (Dialect::Oracle, SqlType::Text) => "CLOB".to_string(),
            (Dialect::Oracle, SqlType::VarChar(n)) => format!("VARCHAR2({n})"),
            (Dialect::Oracle, SqlType::Uuid) => "RAW(16)".to_string(),
            (Dialect::SqlServer, SqlType::Boolean) => "BIT".to_string(),
            (Dialect::SqlServer, SqlType::Text) => "NVARCHAR(MAX)".to_string(),
            (Dialect::SqlServer, SqlType::Blob) => "VARBINARY(MAX)".to_string(),
            (Dialect::SqlServer, SqlType::Timestamp) => "DATETIME2".to_string(),
            (Dialect::SqlServer, SqlType::Uuid) => "UNIQUEIDENTIFIER".to_string(),
            (Dialect::SqlServer, SqlType::Double) => "FLOAT".to_string(),
            (_, t) => t.sql_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders() {
        assert_eq!(Dialect::Postgres.placeholder(2), "$2");
        assert_eq!(Dialect::Sqlite.placeholder(2), "?2");
        assert_eq!(Dialect::Mysql.placeholder(2), "?");
        assert_eq!(Dialect::Oracle.placeholder(2), ":2");
        assert_eq!(Dialect::SqlServer.placeholder(2), "@p2");
    }

    #[test]
    fn quoting() {
        assert_eq!(Dialect::Sqlite.quote_identifier("Person"), "\"Person\"");
        assert_eq!(Dialect::Mysql.quote_identifier("Person"), "`Person`");
        assert_eq!(Dialect::SqlServer.quote_identifier("Person"), "[Person]");
    }

    #[test]
    fn type_mapping() {
        assert_eq!(Dialect::Sqlite.type_name(SqlType::BigInt), "INTEGER");
        assert_eq!(Dialect::Oracle.type_name(SqlType::VarChar(20)), "VARCHAR2(20)");
        assert_eq!(Dialect::Postgres.type_name(SqlType::Text), "TEXT");
    }

    #[test]
    fn paging_defaults() {
        assert_eq!(Dialect::Oracle.default_paging(), PagingStrategy::NestedRowNumber);
        assert_eq!(Dialect::Sqlite.limit_offset(10, 5), " LIMIT 5 OFFSET 10");
    }
}
