//! Shared fixtures for sqlobject-session integration tests.
//!
//! [`SharedDb`] adapts an in-memory `rusqlite` database to
//! [`SqlConnection`]; clones share one connection so a test can inspect
//! rows written by a transaction that owns another clone.

#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use rusqlite::types::{Value as SqliteValue, ValueRef};
use rusqlite::{Connection, params_from_iter};
use sqlobject_core::{
    ClassDef, CollectionInfo, DeleteAction, Error, FieldInfo, RelationInfo, Result, Row, Schema,
    SchemaBuilder, SqlConnection, SqlType, Value,
};
use sqlobject_query::Dialect;
use sqlobject_session::{ObjectTriggers, SqlDataSource, Transaction, TransactionConfig};

pub const DDL: &str = r#"
PRAGMA foreign_keys = ON;
CREATE TABLE "Person" (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    manager_id INTEGER REFERENCES "Person"(id)
);
CREATE TABLE "Project" (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL
);
CREATE TABLE "PersonProject" (
    person_id INTEGER NOT NULL REFERENCES "Person"(id),
    project_id INTEGER NOT NULL REFERENCES "Project"(id),
    PRIMARY KEY (person_id, project_id)
);
CREATE TABLE "Task" (
    id INTEGER PRIMARY KEY,
    title TEXT NOT NULL,
    owner_id INTEGER REFERENCES "Person"(id)
);
CREATE TABLE "Node" (
    id INTEGER PRIMARY KEY,
    label TEXT NOT NULL,
    next_id INTEGER NOT NULL
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

    /// Run setup statements outside any transaction.
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

    pub fn count(&self, table: &str) -> i64 {
        self.column(&format!(r#"SELECT COUNT(*) FROM "{table}""#))[0]
            .as_i64()
            .unwrap()
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
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("name", SqlType::Text))
                    .field(
                        FieldInfo::new("managerId", SqlType::BigInt)
                            .column("manager_id")
                            .nullable()
                            .references("Person")
                            .navigation("manager")
                            .delete_action(DeleteAction::Nullify),
                    )
                    .collection(CollectionInfo::one_to_many("reports", "Person", "managerId"))
                    .collection(CollectionInfo::many_to_many("projects", "PersonProject")),
            )
            .class(
                ClassDef::new("Project")
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("title", SqlType::Text))
                    .collection(CollectionInfo::many_to_many("members", "PersonProject").reversed()),
            )
            .class(
                ClassDef::new("Task")
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("title", SqlType::Text))
                    .field(
                        FieldInfo::new("ownerId", SqlType::BigInt)
                            .column("owner_id")
                            .nullable()
                            .references("Person")
                            .navigation("owner")
                            .delete_action(DeleteAction::Cascade),
                    ),
            )
            .class(
                ClassDef::new("Node")
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("label", SqlType::Text))
                    .field(
                        FieldInfo::new("nextId", SqlType::BigInt)
                            .column("next_id")
                            .references("Node")
                            .navigation("next"),
                    ),
            )
            .relation(RelationInfo::new(
                "PersonProject",
                "Person",
                "person_id",
                "Project",
                "project_id",
            ))
            .build()
            .unwrap(),
    )
}

pub fn transaction(db: &SharedDb) -> Transaction {
    transaction_with(db, TransactionConfig::default())
}

pub fn transaction_with(db: &SharedDb, config: TransactionConfig) -> Transaction {
    let schema = schema();
    let mut txn = Transaction::with_config(Arc::clone(&schema), config);
    txn.add_source(SqlDataSource::new("sqlite", db.clone(), Dialect::Sqlite, schema));
    txn
}

/// Triggers that record every event they see as `"<event>:<key>"`.
#[derive(Debug, Default)]
pub struct EventLog(pub Mutex<Vec<String>>);

impl EventLog {
    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    fn push(&self, txn: &mut Transaction, event: &str, id: sqlobject_session::ObjectId) -> Result<()> {
        let key = txn
            .key_of(id)?
            .map_or_else(|| "?".to_string(), |k| k.to_string());
        self.0.lock().unwrap().push(format!("{event}:{key}"));
        Ok(())
    }
}

impl ObjectTriggers for EventLog {
    fn before_insert(&self, txn: &mut Transaction, id: sqlobject_session::ObjectId) -> Result<()> {
        self.push(txn, "before_insert", id)
    }

    fn after_insert(&self, txn: &mut Transaction, id: sqlobject_session::ObjectId) -> Result<()> {
        self.push(txn, "after_insert", id)
    }

    fn before_update(&self, txn: &mut Transaction, id: sqlobject_session::ObjectId) -> Result<()> {
        self.push(txn, "before_update", id)
    }

    fn after_update(&self, txn: &mut Transaction, id: sqlobject_session::ObjectId) -> Result<()> {
        self.push(txn, "after_update", id)
    }

    fn before_delete(&self, txn: &mut Transaction, id: sqlobject_session::ObjectId) -> Result<()> {
        self.push(txn, "before_delete", id)
    }

    fn after_delete(&self, txn: &mut Transaction, id: sqlobject_session::ObjectId) -> Result<()> {
        self.push(txn, "after_delete", id)
    }
}
