//! SQLObject Rust: transparent object persistence over relational databases.
//!
//! Applications work with in-memory objects described by a [`Schema`];
//! a [`Transaction`] loads them on demand, tracks every change and writes
//! the rows back at commit. Queries are written over classes, fields and
//! collections and compiled into dialect SQL.
//!
//! # Layers
//!
//! - `sqlobject-core`: values, the schema model, the connection trait and
//!   the object cache contract
//! - `sqlobject-query`: the query AST, dialects and the compiler
//! - `sqlobject-session`: the object runtime and transaction coordinator
//!
//! This crate re-exports all three and adds [`Session`], a factory that
//! opens transactions sharing one schema, cache and key generator.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlobject::prelude::*;
//!
//! let schema = Arc::new(
//!     SchemaBuilder::new()
//!         .class(
//!             ClassDef::new("Person")
//!                 .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
//!                 .field(FieldInfo::new("name", SqlType::Text)),
//!         )
//!         .build()?,
//! );
//! let session = Session::builder(schema).memory_cache().build();
//!
//! let mut txn = session.begin(conn)?;
//! let ada = txn.create("Person")?;
//! txn.set_value(ada, "name", "Ada")?;
//! txn.commit()?;
//!
//! let people = Query::from("Person", "p")
//!     .filter(Expr::path("p.name").like(Expr::param(0)))
//!     .order_by(OrderBy::asc(Expr::path("p.name")));
//! let found = txn.query_objects(&people, &[Value::from("A%")])?;
//! ```

pub mod session;

pub use sqlobject_core::{
    BackendError, CacheEntry, CacheGuard, CacheSettings, ClassDef, ClassInfo, CollectionInfo,
    CollectionKind, ColumnInfo, CyclicReferenceError, DeleteAction, Error, ErrorKind, FieldInfo,
    FieldMask, FieldValues, HookError, InvalidationReason, MemoryCache, NoCache,
    NullConstraintError, ObjectCache, ObjectNotFoundError, RelationInfo, Result, Row, Schema,
    SchemaBuilder, SchemaError, SchemaResolutionError, SqlConnection, SqlType, TableInfo,
    TableMask, Tuple, TypeError, UnsupportedFeatureError, Value,
};
pub use sqlobject_query::{
    BinaryOp, CompileOptions, CompiledQuery, Compiler, Dialect, Expr, OrderBy, Paging,
    PagingStrategy, Path, Query, StatementCache, UnaryOp, compile,
};
pub use sqlobject_session::{
    ChangeLog, DataObject, DataSource, FieldChange, KeyGenerator, ObjectEvent, ObjectFlags,
    ObjectId, ObjectRecord, ObjectTriggers, RecordMode, RelationOp, RelationRecord,
    RetentionMode, SequentialKeyGenerator, SqlDataSource, Transaction, TransactionConfig,
};

pub use session::{Session, SessionBuilder};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use sqlobject::prelude::*;
/// ```
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::session::{Session, SessionBuilder};
    pub use sqlobject_core::{
        ClassDef, CollectionInfo, DeleteAction, Error, ErrorKind, FieldInfo, MemoryCache,
        ObjectCache, RelationInfo, Result, Row, Schema, SchemaBuilder, SqlConnection, SqlType,
        Tuple, Value,
    };
    pub use sqlobject_query::{CompileOptions, Dialect, Expr, OrderBy, PagingStrategy, Query};
    pub use sqlobject_session::{
        ChangeLog, DataSource, ObjectId, ObjectTriggers, RetentionMode, SqlDataSource,
        Transaction, TransactionConfig,
    };
}
