//! Transactional object runtime for SQLObject Rust.
//!
//! `sqlobject-session` is the **object runtime layer**. A [`Transaction`]
//! owns every live object it materializes, tracks their changes and writes
//! them through one or more [`DataSource`]s at commit.
//!
//! # Role In The Architecture
//!
//! - **Objects**: [`DataObject`] holds field values, load and dirty masks and
//!   materialized collections, addressed by [`ObjectId`] handles.
//! - **Identity**: one live object per (hierarchy root, key), held strongly
//!   or evictably per [`RetentionMode`].
//! - **Protocols**: commit, precommit, rollback and delete, with cyclic
//!   insert ordering and cache invalidation.
//! - **Triggers**: [`ObjectTriggers`] for field and lifecycle events.
//! - **Change logs**: [`ChangeLog`] serialization and replay.
//! - **Evaluation**: query expressions evaluated against an object in memory.
//!
//! # Example
//!
//! ```ignore
//! let mut txn = Transaction::new(schema.clone());
//! txn.add_source(SqlDataSource::new("main", conn, Dialect::Sqlite, schema));
//!
//! let ada = txn.create("Person")?;
//! txn.set_value(ada, "name", "Ada")?;
//! txn.commit()?;
//! ```

pub mod changelog;
pub mod config;
pub mod datasource;
pub mod hooks;
pub mod keygen;
pub mod object;
pub mod relation;
pub mod sql_source;

mod collections;
mod commit;
mod delete;
mod eval;
mod query;
mod registry;
mod transaction;

pub use changelog::{ChangeLog, FieldRecord, ObjectRecord, RecordMode, RelationRecord};
pub use config::{RetentionMode, TransactionConfig};
pub use datasource::{DataSource, WriteOp};
pub use hooks::{FieldChange, ObjectEvent, ObjectTriggers};
pub use keygen::{KeyGenerator, SequentialKeyGenerator};
pub use object::{DataObject, ObjectFlags, ObjectId};
pub use relation::{RelationChange, RelationOp};
pub use sql_source::SqlDataSource;
pub use transaction::Transaction;
