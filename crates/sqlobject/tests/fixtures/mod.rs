//! Shared fixtures for the end-to-end tests.
//!
//! [`SharedDb`] adapts an in-memory `rusqlite` database to
//! [`SqlConnection`]. Clones share one connection, so only one transaction
//! may hold it open at a time.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{Connection, params_from_iter};
use sqlobject::prelude::*;
use sqlobject::CacheSettings;

pub const DDL: &str = r#"
PRAGMA foreign_keys = ON;
CREATE TABLE "Person" (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    kind TEXT NOT NULL,
    agency TEXT
);
CREATE TABLE "Employee" (
    id INTEGER PRIMARY KEY REFERENCES "Person"(id),
    salary REAL NOT NULL
);
CREATE TABLE "Currency" (
    id INTEGER PRIMARY KEY,
    code TEXT NOT NULL,
    rate REAL NOT NULL
);
CREATE TABLE "Item" (
    id INTEGER PRIMARY KEY,
    label TEXT NOT NULL,
    rank INTEGER NOT NULL
);
"#;

#[derive(Debug, Clone)]
pub struct SharedDb(Rc<RefCell<Connection>>);

fn backend(err: rusqlite::Error) -> Error {
    Error::backend(err.to_string())
}

fn to_sqlite(value: &Value) -> SqliteValue {
    match value {
        Value::Null => SqliteValue::Null,
        Value::Bool(b) => SqliteValue::Integer(i64::from(*b)),
        Value::Int(i) => SqliteValue::Integer(i64::from(*i)),
        Value::BigInt(i) | Value::Timestamp(i) => SqliteValue::Integer(*i),
        Value::Date(d) => SqliteValue::Integer(i64::from(*d)),
        Value::Double(f) => SqliteValue::Real(*f),
        Value::Decimal(s) | Value::Text(s) => SqliteValue::Text(s.clone()),
        Value::Bytes(b) => SqliteValue::Blob(b.clone()),
        Value::Uuid(u) => SqliteValue::Blob(u.to_vec()),
    }
}

fn from_sqlite(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::BigInt(i),
        ValueRef::Real(f) => Value::Double(f),
        ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
        ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
    }
}

impl SharedDb {
    pub fn open() -> Self {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(DDL).unwrap();
        Self(Rc::new(RefCell::new(conn)))
    }

    pub fn seed(&self, sql: &str) {
        self.0.borrow().execute_batch(sql).unwrap();
    }

    /// First column of every row of `sql`.
    pub fn column(&self, sql: &str) -> Vec<Value> {
        let mut conn = self.clone();
        conn.query(sql, &[])
            .unwrap()
            .into_iter()
            .map(|row| row.into_values().into_iter().next().unwrap_or(Value::Null))
            .collect()
    }
}

impl SqlConnection for SharedDb {
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let conn = self.0.borrow();
        let mut stmt = conn.prepare(sql).map_err(backend)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let mut rows = stmt
            .query(params_from_iter(params.iter().map(to_sqlite)))
            .map_err(backend)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(backend)? {
            let mut values = Vec::with_capacity(columns.len());
            for i in 0..columns.len() {
                values.push(from_sqlite(row.get_ref(i).map_err(backend)?));
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        let conn = self.0.borrow();
        let changed = conn
            .execute(sql, params_from_iter(params.iter().map(to_sqlite)))
            .map_err(backend)?;
        Ok(changed as u64)
    }

    fn begin(&mut self) -> Result<()> {
        self.0.borrow().execute_batch("BEGIN").map_err(backend)
    }

    fn commit(&mut self) -> Result<()> {
        self.0.borrow().execute_batch("COMMIT").map_err(backend)
    }

    fn rollback(&mut self) -> Result<()> {
        self.0.borrow().execute_batch("ROLLBACK").map_err(backend)
    }
}

pub fn schema() -> Arc<Schema> {
    Arc::new(
        SchemaBuilder::new()
            .class(
                ClassDef::new("Person")
                    .discriminator("kind")
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("name", SqlType::Text))
                    .field(FieldInfo::new("kind", SqlType::Text)),
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
                ClassDef::new("Currency")
                    .cached(CacheSettings::default())
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("code", SqlType::Text))
                    .field(FieldInfo::new("rate", SqlType::Double)),
            )
            .class(
                ClassDef::new("Item")
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("label", SqlType::Text))
                    .field(FieldInfo::new("rank", SqlType::BigInt)),
            )
            .build()
            .unwrap(),
    )
}
