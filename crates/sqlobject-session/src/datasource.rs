//! The data source contract.
//!
//! A [`DataSource`] is one backing store a transaction talks to. The
//! coordinator opens a session on first use, drives reads and
//! [`WriteOp`]s through it, and commits or rolls it back at the end of the
//! transaction. Sessions of different sources are driven one after the
//! other, never in parallel.

use std::time::Duration;

use sqlobject_core::{ClassInfo, FieldValues, Result, Row, TableMask, Tuple, Value};
use sqlobject_query::{CompiledQuery, Dialect};

/// A row-level write produced by the commit and delete protocols.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Insert one table-group row.
    Insert {
        table: String,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Update columns of one table-group row.
    Update {
        table: String,
        key_columns: Vec<String>,
        key: Vec<Value>,
        columns: Vec<String>,
        values: Vec<Value>,
    },
    /// Delete one table-group row.
    Delete {
        table: String,
        key_columns: Vec<String>,
        key: Vec<Value>,
    },
    /// Insert a relation tuple.
    Link {
        table: String,
        left_column: String,
        left: Value,
        right_column: String,
        right: Value,
    },
    /// Delete a relation tuple.
    Unlink {
        table: String,
        left_column: String,
        left: Value,
        right_column: String,
        right: Value,
    },
    /// Delete every relation tuple whose `column` equals `value`.
    UnlinkAll {
        table: String,
        column: String,
        value: Value,
    },
}

impl WriteOp {
    pub fn table(&self) -> &str {
        match self {
            WriteOp::Insert { table, .. }
            | WriteOp::Update { table, .. }
            | WriteOp::Delete { table, .. }
            | WriteOp::Link { table, .. }
            | WriteOp::Unlink { table, .. }
            | WriteOp::UnlinkAll { table, .. } => table,
        }
    }

    pub fn is_insert(&self) -> bool {
        matches!(self, WriteOp::Insert { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, WriteOp::Delete { .. })
    }

    /// Whether the op touches a relation table.
    pub fn is_relation(&self) -> bool {
        matches!(
            self,
            WriteOp::Link { .. } | WriteOp::Unlink { .. } | WriteOp::UnlinkAll { .. }
        )
    }
}

/// One backing store.
///
/// Loading methods return values addressed by the class's field ordinals,
/// already coerced to the declared field types.
pub trait DataSource {
    fn name(&self) -> &str;

    fn dialect(&self) -> Dialect;

    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Passed through from the transaction configuration.
    fn set_command_timeout(&mut self, _timeout: Option<Duration>) {}

    /// Start buffering writes until [`finish_batched_save`](Self::finish_batched_save).
    fn begin_batched_save(&mut self) -> Result<()>;

    fn finish_batched_save(&mut self) -> Result<()>;

    /// Load the key and the fields of `groups` for one object.
    ///
    /// `Ok(None)` when the primary table has no row for `key`.
    fn load_tables(
        &mut self,
        class: &ClassInfo,
        key: &Tuple,
        groups: TableMask,
    ) -> Result<Option<FieldValues>>;

    fn load_table(
        &mut self,
        class: &ClassInfo,
        key: &Tuple,
        group: usize,
    ) -> Result<Option<FieldValues>> {
        self.load_tables(class, key, TableMask::single(group))
    }

    fn load_all_tables(&mut self, class: &ClassInfo, key: &Tuple) -> Result<Option<FieldValues>> {
        self.load_tables(class, key, TableMask::all(class.tables.len()))
    }

    /// Run a compiled query and return its rows.
    fn execute_compiled(&mut self, query: &CompiledQuery, params: &[Value]) -> Result<Vec<Row>>;

    fn execute_raw(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    fn write(&mut self, op: &WriteOp) -> Result<()>;

    /// Keys produced by a query selecting key columns only.
    fn load_keys(&mut self, query: &CompiledQuery, params: &[Value]) -> Result<Vec<Tuple>> {
        let rows = self.execute_compiled(query, params)?;
        Ok(rows
            .into_iter()
            .map(|row| Tuple::new(row.into_values()))
            .collect())
    }

    /// Objects produced by a query selecting the key columns followed by the
    /// primary table-group's fields.
    fn load_object_list(
        &mut self,
        class: &ClassInfo,
        query: &CompiledQuery,
        params: &[Value],
    ) -> Result<Vec<(Tuple, FieldValues)>> {
        let rows = self.execute_compiled(query, params)?;
        let key_len = class.primary_key.len();
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let mut values = FieldValues::new(class.fields.len());
            let raw = row.into_values();
            let mut key = Vec::with_capacity(key_len);
            let ordinals = class
                .primary_key
                .iter()
                .chain(class.primary_table().fields.iter());
            for (i, (&ordinal, value)) in ordinals.zip(raw).enumerate() {
                let value = class.fields[ordinal].sql_type.coerce(value)?;
                if i < key_len {
                    key.push(value.clone());
                }
                values.set(ordinal, value);
            }
            out.push((Tuple::new(key), values));
        }
        Ok(out)
    }
}

impl<D: DataSource + ?Sized> DataSource for Box<D> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn dialect(&self) -> Dialect {
        (**self).dialect()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn close(&mut self) -> Result<()> {
        (**self).close()
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

    fn begin_batched_save(&mut self) -> Result<()> {
        (**self).begin_batched_save()
    }

    fn finish_batched_save(&mut self) -> Result<()> {
        (**self).finish_batched_save()
    }

    fn load_tables(
        &mut self,
        class: &ClassInfo,
        key: &Tuple,
        groups: TableMask,
    ) -> Result<Option<FieldValues>> {
        (**self).load_tables(class, key, groups)
    }

    fn load_table(
        &mut self,
        class: &ClassInfo,
        key: &Tuple,
        group: usize,
    ) -> Result<Option<FieldValues>> {
        (**self).load_table(class, key, group)
    }

    fn load_all_tables(&mut self, class: &ClassInfo, key: &Tuple) -> Result<Option<FieldValues>> {
        (**self).load_all_tables(class, key)
    }

    fn load_keys(&mut self, query: &CompiledQuery, params: &[Value]) -> Result<Vec<Tuple>> {
        (**self).load_keys(query, params)
    }

    fn load_object_list(
        &mut self,
        class: &ClassInfo,
        query: &CompiledQuery,
        params: &[Value],
    ) -> Result<Vec<(Tuple, FieldValues)>> {
        (**self).load_object_list(class, query, params)
    }

    fn execute_compiled(&mut self, query: &CompiledQuery, params: &[Value]) -> Result<Vec<Row>> {
        (**self).execute_compiled(query, params)
    }

    fn execute_raw(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        (**self).execute_raw(sql, params)
    }

    fn write(&mut self, op: &WriteOp) -> Result<()> {
        (**self).write(op)
    }
}
