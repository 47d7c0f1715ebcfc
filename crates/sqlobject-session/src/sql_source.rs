//! Generic SQL data source over any [`SqlConnection`].
//!
//! Writes are rendered as dialect DML:
//! - INSERT/UPDATE/DELETE per table-group row
//! - INSERT/DELETE per relation tuple
//!
//! Between [`begin_batched_save`](DataSource::begin_batched_save) and
//! [`finish_batched_save`](DataSource::finish_batched_save) statements are
//! buffered and sent together; any read flushes the buffer first so it
//! observes every write issued before it.

use std::sync::Arc;
use std::time::Duration;

use sqlobject_core::{
    ClassInfo, FieldValues, Result, Row, Schema, SqlConnection, TableMask, Tuple, Value,
};
use sqlobject_query::{
    CompileOptions, CompiledQuery, Compiler, Dialect, Expr, Query, StatementCache, cache_key,
};

use crate::datasource::{DataSource, WriteOp};

/// [`DataSource`] that renders SQL for a [`Dialect`] and runs it on `C`.
#[derive(Debug)]
pub struct SqlDataSource<C: SqlConnection> {
    name: String,
    conn: C,
    dialect: Dialect,
    schema: Arc<Schema>,
    options: CompileOptions,
    statements: StatementCache,
    batching: bool,
    pending: Vec<(String, Vec<Value>)>,
}

impl<C: SqlConnection> SqlDataSource<C> {
    pub fn new(name: impl Into<String>, conn: C, dialect: Dialect, schema: Arc<Schema>) -> Self {
        Self {
            name: name.into(),
            conn,
            dialect,
            schema,
            options: CompileOptions::default(),
            statements: StatementCache::new(128),
            batching: false,
            pending: Vec::new(),
        }
    }

    /// Options for the loading statements this source compiles.
    #[must_use]
    pub fn with_compile_options(mut self, options: CompileOptions) -> Self {
        self.options = options;
        self
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    pub fn into_connection(self) -> C {
        self.conn
    }

    /// Number of buffered statements not yet sent.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn quote(&self, name: &str) -> String {
        self.dialect.quote_identifier(name)
    }

    fn placeholders(&self, from: usize, count: usize) -> Vec<String> {
        (from..from + count)
            .map(|i| self.dialect.placeholder(i))
            .collect()
    }

    /// SQL text and parameters of one write.
    pub fn render(&self, op: &WriteOp) -> (String, Vec<Value>) {
        match op {
            WriteOp::Insert {
                table,
                columns,
                values,
            } => {
                let cols: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    self.quote(table),
                    cols.join(", "),
                    self.placeholders(1, values.len()).join(", ")
                );
                (sql, values.clone())
            }
            WriteOp::Update {
                table,
                key_columns,
                key,
                columns,
                values,
            } => {
                let set: Vec<String> = columns
                    .iter()
                    .zip(self.placeholders(1, columns.len()))
                    .map(|(c, p)| format!("{} = {}", self.quote(c), p))
                    .collect();
                let sql = format!(
                    "UPDATE {} SET {} WHERE {}",
                    self.quote(table),
                    set.join(", "),
                    self.key_condition(key_columns, columns.len() + 1)
                );
                let mut params = values.clone();
                params.extend(key.iter().cloned());
                (sql, params)
            }
            WriteOp::Delete {
                table,
                key_columns,
                key,
            } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {}",
                    self.quote(table),
                    self.key_condition(key_columns, 1)
                );
                (sql, key.clone())
            }
            WriteOp::Link {
                table,
                left_column,
                left,
                right_column,
                right,
            } => {
                let sql = format!(
                    "INSERT INTO {} ({}, {}) VALUES ({}, {})",
                    self.quote(table),
                    self.quote(left_column),
                    self.quote(right_column),
                    self.dialect.placeholder(1),
                    self.dialect.placeholder(2)
                );
                (sql, vec![left.clone(), right.clone()])
            }
            WriteOp::Unlink {
                table,
                left_column,
                left,
                right_column,
                right,
            } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {} AND {} = {}",
                    self.quote(table),
                    self.quote(left_column),
                    self.dialect.placeholder(1),
                    self.quote(right_column),
                    self.dialect.placeholder(2)
                );
                (sql, vec![left.clone(), right.clone()])
            }
            WriteOp::UnlinkAll {
                table,
                column,
                value,
            } => {
                let sql = format!(
                    "DELETE FROM {} WHERE {} = {}",
                    self.quote(table),
                    self.quote(column),
                    self.dialect.placeholder(1)
                );
                (sql, vec![value.clone()])
            }
        }
    }

    fn key_condition(&self, key_columns: &[String], first: usize) -> String {
        key_columns
            .iter()
            .zip(self.placeholders(first, key_columns.len()))
            .map(|(c, p)| format!("{} = {}", self.quote(c), p))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// Send every buffered statement.
    fn flush(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        tracing::debug!(source = %self.name, statements = self.pending.len(), "flushing buffered writes");
        for (sql, params) in std::mem::take(&mut self.pending) {
            tracing::trace!(sql = %sql, "execute");
            self.conn
                .execute(&sql, &params)
                .map_err(|e| e.with_statement(&sql))?;
        }
        Ok(())
    }

    /// Compiled SELECT of the key and one table-group's fields by key.
    fn load_statement(&mut self, class: &ClassInfo, group: usize) -> Result<Arc<CompiledQuery>> {
        let key = cache_key(&("load", class.name.as_str(), group));
        let schema = &self.schema;
        let dialect = self.dialect;
        let options = &self.options;
        self.statements.get_or_compile(key, || {
            let mut query = Query::from(&class.name, "t");
            for field in class.key_fields() {
                query = query.select(Expr::path(&format!("t.{}", field.name)));
            }
            for &ordinal in &class.tables[group].fields {
                query = query.select(Expr::path(&format!("t.{}", class.fields[ordinal].name)));
            }
            for (i, field) in class.key_fields().enumerate() {
                query = query.filter(
                    Expr::path(&format!("t.{}", field.name))
                        .eq(Expr::typed_param(i, field.sql_type)),
                );
            }
            Compiler::new(schema, dialect)
                .with_options(options.clone())
                .compile(&query)
        })
    }
}

impl<C: SqlConnection> DataSource for SqlDataSource<C> {
    fn name(&self) -> &str {
        &self.name
    }

    fn dialect(&self) -> Dialect {
        self.dialect
    }

    fn begin(&mut self) -> Result<()> {
        tracing::debug!(source = %self.name, "begin");
        self.conn.begin()
    }

    fn commit(&mut self) -> Result<()> {
        self.flush()?;
        self.batching = false;
        tracing::debug!(source = %self.name, "commit");
        self.conn.commit()
    }

    fn rollback(&mut self) -> Result<()> {
        self.pending.clear();
        self.batching = false;
        tracing::debug!(source = %self.name, "rollback");
        self.conn.rollback()
    }

    fn set_command_timeout(&mut self, timeout: Option<Duration>) {
        self.conn.set_command_timeout(timeout);
    }

    fn begin_batched_save(&mut self) -> Result<()> {
        self.batching = true;
        Ok(())
    }

    fn finish_batched_save(&mut self) -> Result<()> {
        self.batching = false;
        self.flush()
    }

    #[tracing::instrument(level = "trace", skip(self, class), fields(class = %class.name, key = %key))]
    fn load_tables(
        &mut self,
        class: &ClassInfo,
        key: &Tuple,
        groups: TableMask,
    ) -> Result<Option<FieldValues>> {
        self.flush()?;
        let mut values = FieldValues::new(class.fields.len());
        for (&ordinal, value) in class.primary_key.iter().zip(key.values()) {
            values.set(ordinal, value.clone());
        }
        let key_len = class.primary_key.len();
        for group in groups.groups().filter(|&g| g < class.tables.len()) {
            let statement = self.load_statement(class, group)?;
            let params = statement.bind(key.values())?;
            tracing::trace!(sql = %statement.sql, "load");
            let rows = self
                .conn
                .query(&statement.sql, &params)
                .map_err(|e| e.with_statement(&statement.sql))?;
            let Some(row) = rows.into_iter().next() else {
                return Ok(None);
            };
            let fields = &class.tables[group].fields;
            for (&ordinal, value) in fields.iter().zip(row.into_values().into_iter().skip(key_len)) {
                values.set(ordinal, class.fields[ordinal].sql_type.coerce(value)?);
            }
        }
        Ok(Some(values))
    }

    fn execute_compiled(&mut self, query: &CompiledQuery, params: &[Value]) -> Result<Vec<Row>> {
        self.flush()?;
        tracing::trace!(sql = %query.sql, params = params.len(), "query");
        self.conn
            .query(&query.sql, params)
            .map_err(|e| e.with_statement(&query.sql))
    }

    fn execute_raw(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        self.flush()?;
        tracing::trace!(sql = %sql, "raw query");
        self.conn.query(sql, params).map_err(|e| e.with_statement(sql))
    }

    fn write(&mut self, op: &WriteOp) -> Result<()> {
        let (sql, params) = self.render(op);
        if self.batching {
            self.pending.push((sql, params));
            return Ok(());
        }
        tracing::trace!(sql = %sql, "execute");
        self.conn
            .execute(&sql, &params)
            .map(|_| ())
            .map_err(|e| e.with_statement(&sql))
    }
}
