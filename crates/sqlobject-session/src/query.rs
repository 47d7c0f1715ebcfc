//! Running compiled queries inside a transaction.
//!
//! Queries compile once per (query, dialect, options) into the
//! transaction's statement cache. Before a query runs, pending changes of
//! the classes and relations it reads are precommitted so the database
//! sees them.

use std::collections::HashSet;
use std::sync::Arc;

use sqlobject_core::{CacheSettings, Error, Result, Row, TableMask, Tuple, Value};
use sqlobject_query::{CompiledQuery, Compiler, Expr, Query, query_key};

use crate::Transaction;
use crate::commit::Selection;
use crate::object::{ObjectFlags, ObjectId};
use crate::transaction::coerce_key;

impl Transaction {
    /// Source serving the first FROM class of `query`.
    fn query_source(&self, query: &Query) -> Result<usize> {
        let first = query
            .from
            .first()
            .ok_or_else(|| Error::unsupported("empty FROM", "a query needs at least one source class"))?;
        self.source_index(self.schema.class(&first.class)?)
    }

    /// Compile `query` for the dialect of the source it runs against.
    pub fn compile(&mut self, query: &Query) -> Result<Arc<CompiledQuery>> {
        let index = self.query_source(query)?;
        let dialect = self.sources[index].source.dialect();
        let options = self.config.compile.clone();
        let schema = Arc::clone(&self.schema);
        let key = query_key(query, dialect, &options);
        let compiled = self.statements.get_or_compile(key, || {
            Compiler::new(&schema, dialect).with_options(options).compile(query)
        })?;
        tracing::debug!(txn = self.id, sql = %compiled.sql, "query ready");
        Ok(compiled)
    }

    fn precommit_for(&mut self, compiled: &CompiledQuery) -> Result<()> {
        if !self.config.precommit_before_query {
            return Ok(());
        }
        let classes: Vec<&str> = compiled.dependent_classes.iter().map(String::as_str).collect();
        self.precommit(&classes)?;
        let relations: Vec<&str> = compiled
            .dependent_relations
            .iter()
            .map(String::as_str)
            .collect();
        self.precommit_relations(&relations)
    }

    fn prepare(&mut self, query: &Query, params: &[Value]) -> Result<(usize, Arc<CompiledQuery>, Vec<Value>)> {
        let index = self.query_source(query)?;
        let compiled = self.compile(query)?;
        self.precommit_for(&compiled)?;
        let bound = compiled.bind(params)?;
        Ok((index, compiled, bound))
    }

    /// Run `query` and return its raw rows.
    #[tracing::instrument(level = "debug", skip(self, query, params), fields(txn = self.id))]
    pub fn execute_query(&mut self, query: &Query, params: &[Value]) -> Result<Vec<Row>> {
        let (index, compiled, bound) = self.prepare(query, params)?;
        self.session(index)?.execute_compiled(&compiled, &bound)
    }

    /// Keys of the objects selected by `query`.
    ///
    /// With an empty select list the keys are coerced to the key types of
    /// the first FROM class.
    pub fn query_keys(&mut self, query: &Query, params: &[Value]) -> Result<Vec<Tuple>> {
        let (index, compiled, bound) = self.prepare(query, params)?;
        let keys = self.session(index)?.load_keys(&compiled, &bound)?;
        if !query.select.is_empty() {
            return Ok(keys);
        }
        let schema = Arc::clone(&self.schema);
        let info = schema.class(&query.from[0].class)?;
        keys.into_iter().map(|key| coerce_key(info, key)).collect()
    }

    /// Live objects selected by `query`, with their primary table-group
    /// filled from the same round trip.
    ///
    /// Objects marked for deletion are left out.
    #[tracing::instrument(level = "debug", skip(self, query, params), fields(txn = self.id))]
    pub fn query_objects(&mut self, query: &Query, params: &[Value]) -> Result<Vec<ObjectId>> {
        if !query.select.is_empty() {
            return Err(Error::unsupported(
                "object query projection",
                "object queries select the FROM object itself; leave the select list empty",
            ));
        }
        let schema = Arc::clone(&self.schema);
        let source = query
            .from
            .first()
            .ok_or_else(|| Error::unsupported("empty FROM", "a query needs at least one source class"))?;
        let info = schema.class(&source.class)?;
        let mut full = query.clone();
        let alias = if source.alias.is_empty() {
            let alias = unused_alias(query);
            full.from[0].alias.clone_from(&alias);
            alias
        } else {
            source.alias.clone()
        };
        full = full.select(Expr::path(&alias));
        for &ordinal in &info.primary_table().fields {
            full = full.select(Expr::path(&format!("{alias}.{}", info.fields[ordinal].name)));
        }

        let (index, compiled, bound) = self.prepare(&full, params)?;
        let rows = self.session(index)?.load_object_list(info, &compiled, &bound)?;
        let mut seen = HashSet::new();
        let mut out = Vec::with_capacity(rows.len());
        for (key, values) in rows {
            let id = self.get(&info.name, key)?;
            let obj = self.obj(id)?;
            if obj.is_marked_for_delete() || !seen.insert(id) {
                continue;
            }
            if !obj.is_insert_mode() && !obj.load_mask.contains(0) {
                let resolved = obj.class_resolved;
                self.apply_loaded(id, info, TableMask::single(0), Arc::new(values), false)?;
                if !resolved {
                    self.settle_class(id)?;
                }
                self.obj_mut(id)?.flags.remove(ObjectFlags::FROM_CACHE);
            }
            out.push(id);
        }
        tracing::debug!(objects = out.len(), "objects materialized");
        Ok(out)
    }

    /// Keys selected by `query`, shared through the cache's collection
    /// store under `name` and the parameter values.
    ///
    /// The cache is bypassed while this transaction holds changes the
    /// query depends on.
    pub fn load_keys_cached(&mut self, name: &str, query: &Query, params: &[Value]) -> Result<Vec<Tuple>> {
        let compiled = self.compile(query)?;
        if self.has_pending_changes(&compiled)? {
            tracing::debug!(collection = name, "pending changes, cache bypassed");
            return self.query_keys(query, params);
        }
        let cache_name = format!("{name}{params:?}");
        if let Some(keys) = self.cache.find_collection(&cache_name) {
            tracing::trace!(collection = name, "collection cache hit");
            return Ok(keys.as_ref().clone());
        }
        let keys = self.query_keys(query, params)?;
        let settings = self
            .schema
            .class(&query.from[0].class)?
            .cache
            .clone()
            .unwrap_or_default();
        let tags: Vec<String> = compiled
            .dependent_classes
            .iter()
            .chain(compiled.dependent_relations.iter())
            .cloned()
            .collect();
        self.cache
            .store_collection(&cache_name, keys.clone(), &tags, &settings);
        Ok(keys)
    }

    /// Whether anything this transaction changed may show in the results of
    /// `compiled`.
    fn has_pending_changes(&self, compiled: &CompiledQuery) -> Result<bool> {
        let mut roots = HashSet::new();
        for class in &compiled.dependent_classes {
            roots.insert(self.schema.class(class)?.root.as_str());
        }
        let object_changes = self.registry.resident_ids().into_iter().any(|id| {
            self.registry.try_get(id).is_some_and(|o| {
                let touched = o.is_dirty()
                    || o.is_insert_mode()
                    || !o.changed.is_empty()
                    || o.is_marked_for_delete();
                touched
                    && self
                        .schema
                        .get_class(&o.class)
                        .is_some_and(|c| roots.contains(c.root.as_str()))
            })
        });
        let deletes = self.deleted.iter().any(|d| {
            self.schema
                .get_class(&d.class)
                .is_some_and(|c| roots.contains(c.root.as_str()))
        });
        let relation_changes = compiled
            .dependent_relations
            .iter()
            .any(|r| self.relation_log.iter().any(|c| &c.relation == r));
        Ok(object_changes || deletes || relation_changes)
    }

    /// Run hand-written SQL against the first data source.
    ///
    /// Every pending change is flushed first when queries precommit.
    pub fn execute_raw(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        if self.config.precommit_before_query {
            self.flush(&Selection::All)?;
        }
        tracing::debug!(txn = self.id, sql, "raw statement");
        self.session(0)?.execute_raw(sql, params)
    }
}

/// An alias for the first FROM source that no other source already uses.
fn unused_alias(query: &Query) -> String {
    let taken = |name: &str| query.from.iter().any(|f| f.alias == name);
    let mut alias = "__object".to_string();
    let mut n = 1;
    while taken(&alias) {
        n += 1;
        alias = format!("__object{n}");
    }
    alias
}
