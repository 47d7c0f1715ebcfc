//! Transaction configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlobject_query::CompileOptions;

/// How the live-object registry holds clean objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RetentionMode {
    /// Every materialized object stays resident for the whole transaction.
    #[default]
    Strong,
    /// Clean objects beyond `max_resident` may be dropped; their handles stay
    /// valid and the object is reloaded by key on next access.
    Evictable { max_resident: usize },
}

/// Configuration for [`Transaction`](crate::Transaction) behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    pub retention: RetentionMode,
    /// Options for every query compiled by the transaction
    pub compile: CompileOptions,
    /// Passed through to data sources only
    pub command_timeout: Option<Duration>,
    /// Serialize every loaded field of touched objects, not only dirty ones
    pub full_serialization: bool,
    /// Flush pending writes of the classes a query reads before running it
    pub precommit_before_query: bool,
    /// Capacity of the per-transaction statement cache
    pub statement_cache_size: usize,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            retention: RetentionMode::Strong,
            compile: CompileOptions::default(),
            command_timeout: None,
            full_serialization: false,
            precommit_before_query: true,
            statement_cache_size: 256,
        }
    }
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn retention(mut self, retention: RetentionMode) -> Self {
        self.retention = retention;
        self
    }

    #[must_use]
    pub fn compile_options(mut self, options: CompileOptions) -> Self {
        self.compile = options;
        self
    }

    #[must_use]
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn full_serialization(mut self, value: bool) -> Self {
        self.full_serialization = value;
        self
    }

    #[must_use]
    pub fn precommit_before_query(mut self, value: bool) -> Self {
        self.precommit_before_query = value;
        self
    }
}
