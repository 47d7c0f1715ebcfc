//! Core types and traits for SQLObject Rust.
//!
//! This crate provides the foundations shared by the query compiler and the
//! object runtime:
//!
//! - [`Value`] and [`SqlType`] for dynamically typed field values
//! - the [`schema`] model: classes, fields, tables, relations, collections
//! - [`Tuple`] keys, [`FieldValues`] storage and load/dirty masks
//! - the [`SqlConnection`] trait for synchronous backends
//! - the [`ObjectCache`] contract with [`MemoryCache`] and [`NoCache`]
//! - the crate-wide [`Error`] type

pub mod cache;
pub mod connection;
pub mod error;
pub mod field_values;
pub mod identifiers;
pub mod row;
pub mod schema;
pub mod tuple;
pub mod types;
pub mod value;

pub use cache::{CacheEntry, CacheGuard, InvalidationReason, MemoryCache, NoCache, ObjectCache};
pub use connection::SqlConnection;
pub use error::{
    BackendError, ConcurrentMutationError, CyclicReferenceError, Error, ErrorKind, HookError,
    NullConstraintError, ObjectNotFoundError, Result, SchemaError, SchemaErrorKind,
    SchemaResolutionError, TypeError, UnsupportedFeatureError,
};
pub use field_values::{FieldMask, FieldValues, TableMask};
pub use row::{ColumnInfo, Row};
pub use schema::{
    CacheSettings, ClassDef, ClassInfo, CollectionInfo, CollectionKind, DeleteAction, FieldInfo,
    InboundReference, RelationInfo, Schema, SchemaBuilder, TableInfo,
};
pub use tuple::Tuple;
pub use types::SqlType;
pub use value::Value;
