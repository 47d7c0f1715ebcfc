//! Object query language for SQLObject Rust.
//!
//! `sqlobject-query` is the **query compilation layer**. Queries are written
//! as an AST over classes, fields and collections of a
//! [`Schema`](sqlobject_core::Schema) and compiled into dialect SQL plus an
//! ordered parameter list.
//!
//! # Role In The Architecture
//!
//! - **AST**: [`Expr`], [`Path`] and [`Query`] describe what to fetch.
//! - **Dialect support**: [`Dialect`] supplies quoting, placeholders, type
//!   names, paging and outer-join syntax.
//! - **Compiler**: [`compile`] and [`Compiler`] resolve paths into joins,
//!   lower collections into correlated sub-queries and apply paging.
//! - **Statement cache**: [`StatementCache`] keeps compiled statements for
//!   replay with new parameter values.
//!
//! Compiled statements run through the `SqlConnection` trait from
//! `sqlobject-core`; most users reach this crate through the `sqlobject`
//! facade.

pub mod ast;
pub mod cache;
pub mod compiler;
pub mod dialect;

pub use ast::{
    BinaryOp, ContainsTarget, Expr, FromItem, OrderBy, Paging, Path, Query, SelectItem, UnaryOp,
};
pub use cache::{CachedStatement, StatementCache, cache_key, query_key};
pub use compiler::{CompileOptions, CompiledQuery, Compiler, ParamSlot, ParamSource, compile};
pub use dialect::{Dialect, OuterJoinSyntax, PagingStrategy};
