//! Transaction factory shared by every unit of work against one database.
//!
//! A [`Session`] holds what outlives a single [`Transaction`]: the resolved
//! schema, the dialect, the object cache, the key generator and the triggers
//! registered per class. Each call to [`Session::begin`] wires these into a
//! fresh transaction over the given connection.
//!
//! # Example
//!
//! ```rust,ignore
//! use sqlobject::prelude::*;
//!
//! let session = Session::builder(schema)
//!     .dialect(Dialect::Sqlite)
//!     .cache(Arc::new(MemoryCache::new()))
//!     .build();
//!
//! let mut txn = session.begin(conn)?;
//! let ada = txn.create("Person")?;
//! txn.set_value(ada, "name", "Ada")?;
//! txn.commit()?;
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use sqlobject_core::{MemoryCache, NoCache, ObjectCache, Result, Schema, SqlConnection};
use sqlobject_query::Dialect;
use sqlobject_session::{
    KeyGenerator, ObjectTriggers, SequentialKeyGenerator, SqlDataSource, Transaction,
    TransactionConfig,
};

/// Creates transactions that share schema, cache, keys and triggers.
pub struct Session {
    schema: Arc<Schema>,
    dialect: Dialect,
    source_name: String,
    config: TransactionConfig,
    cache: Arc<dyn ObjectCache>,
    keys: Arc<dyn KeyGenerator>,
    triggers: BTreeMap<String, Arc<dyn ObjectTriggers>>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("dialect", &self.dialect)
            .field("source_name", &self.source_name)
            .field("config", &self.config)
            .field("triggers", &self.triggers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start configuring a session over `schema`.
    #[must_use]
    pub fn builder(schema: Arc<Schema>) -> SessionBuilder {
        SessionBuilder::new(schema)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// The cache every transaction of this session reads and invalidates.
    pub fn cache(&self) -> &Arc<dyn ObjectCache> {
        &self.cache
    }

    /// Open a transaction whose single data source runs on `conn`.
    pub fn begin<C>(&self, conn: C) -> Result<Transaction>
    where
        C: SqlConnection + 'static,
    {
        let mut txn = Transaction::with_config(Arc::clone(&self.schema), self.config.clone())
            .with_cache(Arc::clone(&self.cache))
            .with_key_generator(Arc::clone(&self.keys));
        txn.add_source(SqlDataSource::new(
            self.source_name.clone(),
            conn,
            self.dialect,
            Arc::clone(&self.schema),
        ));
        for (class, triggers) in &self.triggers {
            txn.register_triggers(class, Arc::clone(triggers))?;
        }
        tracing::debug!(
            source = %self.source_name,
            dialect = ?self.dialect,
            triggers = self.triggers.len(),
            "transaction opened"
        );
        Ok(txn)
    }
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    schema: Arc<Schema>,
    dialect: Dialect,
    source_name: String,
    config: TransactionConfig,
    cache: Option<Arc<dyn ObjectCache>>,
    keys: Option<Arc<dyn KeyGenerator>>,
    triggers: BTreeMap<String, Arc<dyn ObjectTriggers>>,
}

impl fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("dialect", &self.dialect)
            .field("source_name", &self.source_name)
            .field("config", &self.config)
            .field("has_cache", &self.cache.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self {
            schema,
            dialect: Dialect::Sqlite,
            source_name: "main".to_string(),
            config: TransactionConfig::default(),
            cache: None,
            keys: None,
            triggers: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Name reported by the data source in logs and errors.
    #[must_use]
    pub fn source_name(mut self, name: impl Into<String>) -> Self {
        self.source_name = name.into();
        self
    }

    #[must_use]
    pub fn config(mut self, config: TransactionConfig) -> Self {
        self.config = config;
        self
    }

    /// Read the transaction configuration from a JSON document.
    ///
    /// Missing keys keep their defaults.
    pub fn config_json(mut self, json: &str) -> Result<Self> {
        self.config = serde_json::from_str(json)?;
        Ok(self)
    }

    #[must_use]
    pub fn cache(mut self, cache: Arc<dyn ObjectCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Use a fresh [`MemoryCache`] shared by all transactions.
    #[must_use]
    pub fn memory_cache(self) -> Self {
        self.cache(Arc::new(MemoryCache::new()))
    }

    #[must_use]
    pub fn key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = Some(keys);
        self
    }

    /// Register triggers for `class` in every transaction.
    ///
    /// Fails when the class is unknown.
    pub fn triggers(mut self, class: &str, triggers: Arc<dyn ObjectTriggers>) -> Result<Self> {
        self.schema.class(class)?;
        self.triggers.insert(class.to_string(), triggers);
        Ok(self)
    }

    pub fn build(self) -> Session {
        Session {
            schema: self.schema,
            dialect: self.dialect,
            source_name: self.source_name,
            config: self.config,
            cache: self.cache.unwrap_or_else(|| Arc::new(NoCache)),
            keys: self
                .keys
                .unwrap_or_else(|| Arc::new(SequentialKeyGenerator::new())),
            triggers: self.triggers,
        }
    }
}
