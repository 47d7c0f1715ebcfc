//! Statement caching for compiled queries.
//!
//! Caches compiled statements keyed by a hash of the query shape so that a
//! repeated query skips compilation and is replayed with new positional
//! parameters through [`CompiledQuery::replay`].

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Instant;

use sqlobject_core::Result;

use crate::ast::Query;
use crate::compiler::{CompileOptions, CompiledQuery};
use crate::dialect::Dialect;

/// A cached compiled statement.
#[derive(Debug, Clone)]
pub struct CachedStatement {
    pub statement: Arc<CompiledQuery>,
    /// When this entry was last accessed.
    pub last_used: Instant,
    /// Number of times this statement has been reused.
    pub hit_count: u64,
}

/// LRU-style cache for compiled statements.
///
/// Keyed by a `u64` hash that callers compute with [`cache_key`] or
/// [`query_key`]. When the cache exceeds `max_size`, the least-recently-used
/// entry is evicted.
#[derive(Debug)]
pub struct StatementCache {
    cache: HashMap<u64, CachedStatement>,
    max_size: usize,
}

impl StatementCache {
    /// Create a new cache with the given maximum number of entries.
    pub fn new(max_size: usize) -> Self {
        Self {
            cache: HashMap::with_capacity(max_size.min(256)),
            max_size,
        }
    }

    /// Get a cached statement or compile and insert it.
    ///
    /// `compile` is only called on a miss; a failed compilation is not cached.
    pub fn get_or_compile(
        &mut self,
        key: u64,
        compile: impl FnOnce() -> Result<CompiledQuery>,
    ) -> Result<Arc<CompiledQuery>> {
        if let Some(entry) = self.cache.get_mut(&key) {
            entry.last_used = Instant::now();
            entry.hit_count += 1;
            tracing::trace!(key, hits = entry.hit_count, "statement cache hit");
            return Ok(Arc::clone(&entry.statement));
        }
        let statement = Arc::new(compile()?);
        if self.cache.len() >= self.max_size {
            self.evict_lru();
        }
        self.cache.insert(
            key,
            CachedStatement {
                statement: Arc::clone(&statement),
                last_used: Instant::now(),
                hit_count: 0,
            },
        );
        Ok(statement)
    }

    pub fn get(&mut self, key: u64) -> Option<Arc<CompiledQuery>> {
        let entry = self.cache.get_mut(&key)?;
        entry.last_used = Instant::now();
        entry.hit_count += 1;
        Some(Arc::clone(&entry.statement))
    }

    /// Check if a statement is cached.
    pub fn contains(&self, key: u64) -> bool {
        self.cache.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Clear all cached statements.
    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Evict the least-recently-used entry.
    fn evict_lru(&mut self) {
        if let Some((&lru_key, _)) = self.cache.iter().min_by_key(|(_, entry)| entry.last_used) {
            self.cache.remove(&lru_key);
        }
    }
}

/// Compute a hash key for caching from any hashable value.
pub fn cache_key(value: &impl Hash) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// Cache key of a query compiled for `dialect` with `options`.
pub fn query_key(query: &Query, dialect: Dialect, options: &CompileOptions) -> u64 {
    cache_key(&(query, dialect, options))
}

impl Default for StatementCache {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Expr;
    use crate::compiler::Compiler;
    use sqlobject_core::{ClassDef, FieldInfo, Schema, SchemaBuilder, SqlType, Value};

    fn statement(sql: &str) -> CompiledQuery {
        CompiledQuery {
            sql: sql.to_string(),
            slots: Vec::new(),
            columns: 1,
            dependent_classes: Vec::new(),
            dependent_relations: Vec::new(),
        }
    }

    fn schema() -> Schema {
        SchemaBuilder::new()
            .class(
                ClassDef::new("Account")
                    .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                    .field(FieldInfo::new("opened", SqlType::Date)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_cache_hit() {
        let mut cache = StatementCache::new(10);
        let first = cache.get_or_compile(1, || Ok(statement("SELECT 1"))).unwrap();
        assert_eq!(first.sql, "SELECT 1");

        let called = std::cell::Cell::new(false);
        let second = cache
            .get_or_compile(1, || {
                called.set(true);
                Ok(statement("SELECT 1"))
            })
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!called.get());
    }

    #[test]
    fn test_failed_compile_is_not_cached() {
        let mut cache = StatementCache::new(10);
        let err = cache.get_or_compile(7, || Err(sqlobject_core::Error::Custom("bad".into())));
        assert!(err.is_err());
        assert!(!cache.contains(7));
    }

    #[test]
    fn test_lru_ordering() {
        let mut cache = StatementCache::new(2);
        cache.get_or_compile(1, || Ok(statement("SELECT 1"))).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        cache.get_or_compile(2, || Ok(statement("SELECT 2"))).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert!(cache.get(1).is_some());

        cache.get_or_compile(3, || Ok(statement("SELECT 3"))).unwrap();
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
        assert!(cache.contains(3));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_replay_with_new_parameters() {
        let schema = schema();
        let compiler = Compiler::new(&schema, Dialect::Sqlite);
        let query = crate::ast::Query::from("Account", "a")
            .filter(Expr::path("a.opened").gt(Expr::typed_lit(19_000i64, SqlType::Date)));
        let key = query_key(&query, compiler.dialect(), compiler.options());

        let mut cache = StatementCache::default();
        let compiled = cache.get_or_compile(key, || compiler.compile(&query)).unwrap();
        assert_eq!(compiled.params().unwrap(), vec![Value::Date(19_000)]);

        // same text, new value reinterpreted with the declared type
        let again = cache.get(key).unwrap();
        assert_eq!(again.replay(&[Value::BigInt(20_000)]).unwrap(), vec![Value::Date(20_000)]);
    }

    #[test]
    fn test_cache_key_function() {
        let key1 = cache_key(&"SELECT * FROM users");
        let key2 = cache_key(&"SELECT * FROM users");
        let key3 = cache_key(&"SELECT * FROM orders");

        assert_eq!(key1, key2);
        assert_ne!(key1, key3);
    }

    #[test]
    fn test_clear() {
        let mut cache = StatementCache::new(10);
        cache.get_or_compile(1, || Ok(statement("SELECT 1"))).unwrap();
        cache.get_or_compile(2, || Ok(statement("SELECT 2"))).unwrap();
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }
}
