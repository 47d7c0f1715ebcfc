//! Synchronous database connection trait.
//!
//! [`SqlConnection`] is the narrow row-cursor interface the generic SQL data
//! source drives. Concrete drivers live outside this workspace; the
//! integration tests wrap an embedded SQLite database.

use std::time::Duration;

use crate::error::Result;
use crate::row::Row;
use crate::value::Value;

/// A blocking connection to a relational backend.
///
/// # Example
///
/// ```rust,ignore
/// conn.begin()?;
/// conn.execute("INSERT INTO logs (msg) VALUES (?)", &[Value::Text("action".into())])?;
/// conn.commit()?;
/// ```
pub trait SqlConnection {
    /// Execute a query and return all rows.
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a statement (INSERT, UPDATE, DELETE) and return rows affected.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute multiple statements in order.
    ///
    /// Returns the number of rows affected by each statement.
    fn batch(&mut self, statements: &[(String, Vec<Value>)]) -> Result<Vec<u64>> {
        statements
            .iter()
            .map(|(sql, params)| self.execute(sql, params))
            .collect()
    }

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Apply a per-statement timeout, if the driver supports one.
    fn set_command_timeout(&mut self, _timeout: Option<Duration>) {}

    /// Check that the connection is usable.
    fn ping(&mut self) -> Result<()> {
        self.query("SELECT 1", &[]).map(|_| ())
    }
}

impl<C: SqlConnection + ?Sized> SqlConnection for Box<C> {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).query(sql, params)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        (**self).execute(sql, params)
    }

    fn batch(&mut self, statements: &[(String, Vec<Value>)]) -> Result<Vec<u64>> {
        (**self).batch(statements)
    }

    fn begin(&mut self) -> Result<()> {
        (**self).begin()
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }

    fn set_command_timeout(&mut self, timeout: Option<Duration>) {
        (**self).set_command_timeout(timeout);
    }

    fn ping(&mut self) -> Result<()> {
        (**self).ping()
    }
}
