//! The transaction coordinator.
//!
//! A [`Transaction`] owns every object it materializes, the list of dirty
//! objects, the pending many-to-many changes and one session per data
//! source. Objects are addressed by [`ObjectId`]; field access loads the
//! owning table-group lazily, through the cache for cached classes.
//!
//! The commit, precommit and delete protocols live in their own modules and
//! extend `Transaction` with further `impl` blocks.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use sqlobject_core::{
    CacheEntry, ClassInfo, CollectionKind, Error, FieldInfo, FieldValues, NoCache,
    NullConstraintError, ObjectCache, ObjectNotFoundError, Result, Schema, SchemaErrorKind,
    TableMask, Tuple, TypeError, Value,
};
use sqlobject_query::StatementCache;

use crate::config::{RetentionMode, TransactionConfig};
use crate::datasource::{DataSource, WriteOp};
use crate::hooks::{self, FieldChange, ObjectEvent, ObjectTriggers, TriggerRegistry};
use crate::keygen::{KeyGenerator, SequentialKeyGenerator};
use crate::object::{DataObject, ObjectFlags, ObjectId};
use crate::registry::{Registry, Slot};
use crate::relation::{RelationBuffer, RelationChange};

static NEXT_TRANSACTION: AtomicU64 = AtomicU64::new(1);

pub(crate) struct SourceSlot {
    pub(crate) source: Box<dyn DataSource>,
    pub(crate) open: bool,
    pub(crate) batching: bool,
}

/// An object deleted during this transaction, journaled for the change log.
#[derive(Debug, Clone)]
pub(crate) struct DeletedRecord {
    pub(crate) class: String,
    pub(crate) key: Tuple,
}

/// A unit of work over one schema and one or more data sources.
///
/// ```rust,ignore
/// let mut txn = Transaction::new(schema).with_cache(cache);
/// txn.add_source(SqlDataSource::new("main", conn, Dialect::Sqlite, schema.clone()));
///
/// let person = txn.create("Person")?;
/// txn.set_value(person, "name", "Ada")?;
/// txn.commit()?;
/// ```
pub struct Transaction {
    pub(crate) id: u64,
    pub(crate) schema: Arc<Schema>,
    pub(crate) cache: Arc<dyn ObjectCache>,
    pub(crate) config: TransactionConfig,
    pub(crate) sources: Vec<SourceSlot>,
    routes: HashMap<String, usize>,
    pub(crate) registry: Registry,
    /// Objects in the order they became dirty; may hold stale entries
    pub(crate) dirty: Vec<ObjectId>,
    pub(crate) relations: RelationBuffer,
    /// Every relation change since the last commit, flushed or not
    pub(crate) relation_log: Vec<RelationChange>,
    /// Objects written since the last commit, awaiting after-commit hooks
    pub(crate) post_commit: Vec<ObjectId>,
    /// Class roots and relation tables flushed since their last change
    pub(crate) precommitted: HashSet<String>,
    /// Relation tables written since the last commit
    pub(crate) touched_relations: HashSet<String>,
    pub(crate) deleted: Vec<DeletedRecord>,
    triggers: TriggerRegistry,
    pub(crate) keys: Arc<dyn KeyGenerator>,
    pub(crate) statements: StatementCache,
    suppress: usize,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sources: Vec<&str> = self.sources.iter().map(|s| s.source.name()).collect();
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("sources", &sources)
            .field("resident", &self.registry.resident_count())
            .field("dirty", &self.dirty.len())
            .field("pending_relations", &self.relations.changes().len())
            .field("triggers", &self.triggers)
            .finish()
    }
}

pub(crate) fn key_text(key: Option<&Tuple>) -> String {
    key.map_or_else(|| "<unassigned>".to_string(), ToString::to_string)
}

pub(crate) fn not_found(class: &str, key: Option<&Tuple>) -> Error {
    Error::ObjectNotFound(ObjectNotFoundError {
        class: class.to_string(),
        key: key_text(key),
    })
}

/// Name the field a coercion failure happened on.
pub(crate) fn with_field(err: Error, field: &str) -> Error {
    match err {
        Error::Type(mut e) => {
            e.field = Some(field.to_string());
            Error::Type(e)
        }
        other => other,
    }
}

fn find_field<'a>(class: &'a ClassInfo, name: &str) -> Option<&'a FieldInfo> {
    class.field(name).or_else(|| class.navigation(name))
}

/// Coerce a caller-supplied key to the class's key field types.
pub(crate) fn coerce_key(class: &ClassInfo, key: Tuple) -> Result<Tuple> {
    if key.len() != class.primary_key.len() {
        return Err(Error::Type(TypeError {
            expected: "a key with one value per primary-key field",
            actual: format!("{} value(s)", key.len()),
            field: None,
        }));
    }
    let values = class
        .primary_key
        .iter()
        .zip(key.into_values())
        .map(|(&ordinal, value)| {
            let field = &class.fields[ordinal];
            if value.is_null() {
                return Err(Error::Type(TypeError {
                    expected: "a non-null key value",
                    actual: "NULL".to_string(),
                    field: Some(field.name.clone()),
                }));
            }
            field
                .sql_type
                .coerce(value)
                .map_err(|e| with_field(e, &field.name))
        })
        .collect::<Result<Vec<_>>>()?;
    Ok(Tuple::new(values))
}

/// An update-mode object for `key` with its key fields filled in.
fn keyed_object(class: &ClassInfo, key: &Tuple, resolved: bool) -> DataObject {
    let mut obj = DataObject::for_update(&class.name, key.clone(), class.fields.len(), resolved);
    for (&ordinal, value) in class.primary_key.iter().zip(key.values()) {
        obj.write(ordinal, value.clone());
    }
    obj
}

impl Transaction {
    pub fn new(schema: Arc<Schema>) -> Self {
        Self::with_config(schema, TransactionConfig::default())
    }

    pub fn with_config(schema: Arc<Schema>, config: TransactionConfig) -> Self {
        let id = NEXT_TRANSACTION.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            schema,
            cache: Arc::new(NoCache),
            statements: StatementCache::new(config.statement_cache_size.max(1)),
            config,
            sources: Vec::new(),
            routes: HashMap::new(),
            registry: Registry::new(id),
            dirty: Vec::new(),
            relations: RelationBuffer::default(),
            relation_log: Vec::new(),
            post_commit: Vec::new(),
            precommitted: HashSet::new(),
            touched_relations: HashSet::new(),
            deleted: Vec::new(),
            triggers: TriggerRegistry::default(),
            keys: Arc::new(SequentialKeyGenerator::new()),
            suppress: 0,
        }
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn ObjectCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Share a key generator, typically across every transaction of an
    /// application.
    #[must_use]
    pub fn with_key_generator(mut self, keys: Arc<dyn KeyGenerator>) -> Self {
        self.keys = keys;
        self
    }

    /// Attach a data source; the first one is the default for every class.
    pub fn add_source(&mut self, source: impl DataSource + 'static) -> usize {
        tracing::debug!(txn = self.id, source = source.name(), "data source attached");
        self.sources.push(SourceSlot {
            source: Box::new(source),
            open: false,
            batching: false,
        });
        self.sources.len() - 1
    }

    /// Store the hierarchy of `class` in source number `source`.
    pub fn route(&mut self, class: &str, source: usize) -> Result<()> {
        let root = self.schema.class(class)?.root.clone();
        if source >= self.sources.len() {
            return Err(Error::Custom(format!("no data source number {source}")));
        }
        self.routes.insert(root, source);
        Ok(())
    }

    /// Attach triggers to `class` and its subclasses.
    pub fn register_triggers(&mut self, class: &str, triggers: Arc<dyn ObjectTriggers>) -> Result<()> {
        self.schema.class(class)?;
        self.triggers.register(class, triggers);
        Ok(())
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Number of objects currently held in memory.
    pub fn resident_count(&self) -> usize {
        self.registry.resident_count()
    }

    /// Handles of the objects with unflushed changes, in the order they
    /// became dirty.
    pub fn dirty_objects(&self) -> Vec<ObjectId> {
        let mut seen = HashSet::new();
        self.dirty
            .iter()
            .copied()
            .filter(|id| {
                self.registry
                    .try_get(*id)
                    .is_some_and(|o| o.is_dirty() && !o.is_marked_for_delete())
            })
            .filter(|id| seen.insert(*id))
            .collect()
    }

    // ---- sessions ----

    pub(crate) fn source_index(&self, class: &ClassInfo) -> Result<usize> {
        if self.sources.is_empty() {
            return Err(Error::Custom("transaction has no data source".into()));
        }
        Ok(self.routes.get(&class.root).copied().unwrap_or(0))
    }

    /// The slot of source `index`, opening its session on first use.
    pub(crate) fn open_slot(&mut self, index: usize) -> Result<&mut SourceSlot> {
        let timeout = self.config.command_timeout;
        let txn = self.id;
        let slot = self
            .sources
            .get_mut(index)
            .ok_or_else(|| Error::Custom(format!("no data source number {index}")))?;
        if !slot.open {
            slot.source.open()?;
            slot.source.set_command_timeout(timeout);
            slot.source.begin()?;
            slot.open = true;
            tracing::debug!(txn, source = slot.source.name(), "session opened");
        }
        Ok(slot)
    }

    pub(crate) fn session(&mut self, index: usize) -> Result<&mut Box<dyn DataSource>> {
        Ok(&mut self.open_slot(index)?.source)
    }

    /// Send one write through the batched save of source `index`.
    pub(crate) fn write_op(&mut self, index: usize, op: &WriteOp) -> Result<()> {
        let slot = self.open_slot(index)?;
        if !slot.batching {
            slot.source.begin_batched_save()?;
            slot.batching = true;
        }
        tracing::trace!(source = slot.source.name(), table = op.table(), "write queued");
        slot.source.write(op)
    }

    /// Close every batched save opened by [`write_op`](Self::write_op).
    pub(crate) fn finish_batches(&mut self) -> Result<()> {
        for slot in &mut self.sources {
            if slot.batching {
                slot.batching = false;
                slot.source.finish_batched_save()?;
            }
        }
        Ok(())
    }

    // ---- triggers ----

    /// Run `f` with every trigger of this transaction switched off.
    pub fn with_triggers_suppressed<R>(&mut self, f: impl FnOnce(&mut Self) -> Result<R>) -> Result<R> {
        self.suppress += 1;
        let result = f(self);
        self.suppress -= 1;
        result
    }

    fn triggers_for(&self, class: &str) -> Option<Arc<dyn ObjectTriggers>> {
        if self.suppress > 0 {
            return None;
        }
        self.schema
            .get_class(class)
            .and_then(|info| self.triggers.resolve(info))
    }

    pub(crate) fn fire(&mut self, id: ObjectId, event: ObjectEvent) -> Result<()> {
        let obj = self.obj(id)?;
        if obj.flags.contains(ObjectFlags::OBJECT_TRIGGERS_DISABLED) {
            return Ok(());
        }
        let (class, key) = (obj.class.clone(), obj.key.clone());
        let Some(triggers) = self.triggers_for(&class) else {
            return Ok(());
        };
        tracing::trace!(object = %id, ?event, "object trigger");
        hooks::dispatch(triggers.as_ref(), self, event, id)
            .map_err(|e| hooks::hook_error(&class, key_text(key.as_ref()), None, e))
    }

    pub fn set_field_triggers_enabled(&mut self, id: ObjectId, enabled: bool) -> Result<()> {
        self.obj_mut(id)?
            .flags
            .set(ObjectFlags::FIELD_TRIGGERS_DISABLED, !enabled);
        Ok(())
    }

    pub fn set_object_triggers_enabled(&mut self, id: ObjectId, enabled: bool) -> Result<()> {
        self.obj_mut(id)?
            .flags
            .set(ObjectFlags::OBJECT_TRIGGERS_DISABLED, !enabled);
        Ok(())
    }

    /// Run the object's after-commit hook at the next commit even if it
    /// stays clean.
    pub fn force_post_commit(&mut self, id: ObjectId) -> Result<()> {
        self.obj_mut(id)?.flags.insert(ObjectFlags::FORCE_POST_COMMIT);
        Ok(())
    }

    // ---- object access ----

    /// The object behind `id`, reloaded by key if it was evicted.
    pub fn object(&mut self, id: ObjectId) -> Result<&DataObject> {
        self.obj(id)
    }

    pub(crate) fn obj(&mut self, id: ObjectId) -> Result<&DataObject> {
        Ok(&*self.obj_mut(id)?)
    }

    pub(crate) fn obj_mut(&mut self, id: ObjectId) -> Result<&mut DataObject> {
        let evicted = match self.registry.slot(id)? {
            Slot::Evicted { class, key } => Some((class.clone(), key.clone())),
            _ => None,
        };
        if let Some((class, key)) = evicted {
            let info = self.schema.class(&class)?;
            let obj = keyed_object(info, &key, true);
            self.registry.restore(id, obj)?;
            tracing::trace!(object = %id, %class, "evicted object rematerialized");
        }
        self.registry.get_mut(id)
    }

    /// Concrete class of the object, reading the discriminator if needed.
    pub fn class_of(&mut self, id: ObjectId) -> Result<String> {
        if !self.obj(id)?.class_resolved {
            self.ensure_group(id, 0)?;
        }
        Ok(self.obj(id)?.class.clone())
    }

    pub fn key_of(&mut self, id: ObjectId) -> Result<Option<Tuple>> {
        Ok(self.obj(id)?.key.clone())
    }

    pub fn is_dirty(&mut self, id: ObjectId) -> Result<bool> {
        Ok(self.obj(id)?.is_dirty())
    }

    pub(crate) fn note_dirty(&mut self, id: ObjectId, root: &str) {
        self.dirty.push(id);
        self.precommitted.remove(root);
    }

    // ---- creation and lookup ----

    /// New object in insert mode, keyed by the key generator when the class
    /// has a single integer key.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    pub fn create(&mut self, class: &str) -> Result<ObjectId> {
        let schema = Arc::clone(&self.schema);
        let info = schema.class(class)?;
        creatable(info)?;
        let key = self.keys.next_key(info)?;
        self.insert_object(info, key)
    }

    /// New object in insert mode with a caller-chosen key.
    pub fn create_with_key(&mut self, class: &str, key: impl Into<Tuple>) -> Result<ObjectId> {
        let schema = Arc::clone(&self.schema);
        let info = schema.class(class)?;
        creatable(info)?;
        let key = coerce_key(info, key.into())?;
        if self.registry.lookup(&info.root, &key).is_some() {
            return Err(Error::concurrent(
                &info.name,
                format!("an object with key {key} is already live"),
            ));
        }
        self.keys.observe(info, &key);
        self.insert_object(info, Some(key))
    }

    fn insert_object(&mut self, info: &ClassInfo, key: Option<Tuple>) -> Result<ObjectId> {
        let mut obj = DataObject::for_insert(&info.name, info.fields.len(), info.tables.len());
        for field in &info.fields {
            if field.primary_key || field.is_reference() {
                continue;
            }
            if Some(field.ordinal) == info.discriminator {
                if let Some(value) = &info.discriminator_value {
                    obj.write(field.ordinal, value.clone());
                    obj.mark_dirty(field.ordinal);
                }
            } else if !field.nullable {
                obj.write(field.ordinal, field.sql_type.default_value());
                obj.mark_dirty(field.ordinal);
            }
        }
        if let Some(key) = &key {
            for (&ordinal, value) in info.primary_key.iter().zip(key.values()) {
                obj.write(ordinal, value.clone());
                obj.mark_dirty(ordinal);
                obj.key_assigned.insert(ordinal);
            }
            obj.key = Some(key.clone());
        }
        obj.flags.insert(ObjectFlags::DIRTY);

        let id = self.registry.insert(obj);
        if let Some(key) = &key {
            self.registry.register_key(&info.root, key, id)?;
        }
        self.note_dirty(id, &info.root);
        tracing::debug!(object = %id, class = %info.name, key = %key_text(key.as_ref()), "object created");
        self.enforce_retention(Some(id));
        Ok(id)
    }

    /// Handle for the object of `class` with `key`, without loading it.
    ///
    /// Returns the live instance when one exists. Looking up a key through a
    /// class the live object is not an instance of is `ObjectNotFound`.
    pub fn get(&mut self, class: &str, key: impl Into<Tuple>) -> Result<ObjectId> {
        let schema = Arc::clone(&self.schema);
        let info = schema.class(class)?;
        let key = coerce_key(info, key.into())?;
        if let Some(id) = self.registry.lookup(&info.root, &key) {
            self.obj_mut(id)?;
            self.check_class(id, info)?;
            return Ok(id);
        }
        let resolved = info.discriminator.is_none()
            || (info.concrete_classes.len() == 1 && info.concrete_classes[0] == info.name);
        let id = self.registry.insert(keyed_object(info, &key, resolved));
        self.registry.register_key(&info.root, &key, id)?;
        self.keys.observe(info, &key);
        tracing::trace!(object = %id, class = %info.name, %key, "object registered");
        self.enforce_retention(Some(id));
        Ok(id)
    }

    /// Like [`get`](Self::get), then load the primary table-group so a
    /// missing row surfaces as `ObjectNotFound` right away.
    pub fn load(&mut self, class: &str, key: impl Into<Tuple>) -> Result<ObjectId> {
        let id = self.get(class, key)?;
        self.ensure_group(id, 0)?;
        Ok(id)
    }

    fn check_class(&mut self, id: ObjectId, requested: &ClassInfo) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let obj = self.obj(id)?;
        let (class, resolved, key) = (obj.class.clone(), obj.class_resolved, obj.key.clone());
        if schema.is_subclass(&class, &requested.name) {
            return Ok(());
        }
        if !resolved && schema.is_subclass(&requested.name, &class) {
            self.ensure_group(id, 0)?;
            if schema.is_subclass(&self.obj(id)?.class, &requested.name) {
                return Ok(());
            }
        }
        Err(not_found(&requested.name, key.as_ref()))
    }

    // ---- field access ----

    pub(crate) fn field_info(&mut self, id: ObjectId, name: &str) -> Result<FieldInfo> {
        let schema = Arc::clone(&self.schema);
        let obj = self.obj(id)?;
        let (class, resolved) = (obj.class.clone(), obj.class_resolved);
        if let Some(field) = find_field(schema.class(&class)?, name) {
            return Ok(field.clone());
        }
        if !resolved {
            self.ensure_group(id, 0)?;
            let class = self.obj(id)?.class.clone();
            if let Some(field) = find_field(schema.class(&class)?, name) {
                return Ok(field.clone());
            }
        }
        Err(Error::unresolved(name, class))
    }

    /// Read a field, loading its table-group first.
    ///
    /// A navigation name reads the reference's key value.
    pub fn value(&mut self, id: ObjectId, field: &str) -> Result<Value> {
        let info = self.field_info(id, field)?;
        self.ensure_group(id, info.table_group)?;
        Ok(self.obj(id)?.raw_value(info.ordinal).clone())
    }

    pub fn set_value(&mut self, id: ObjectId, field: &str, value: impl Into<Value>) -> Result<()> {
        let info = self.field_info(id, field)?;
        self.write_field(id, &info, value.into(), None)
    }

    /// The write path shared by field and reference setters.
    ///
    /// `target` is the resolved reference target to cache, when known.
    pub(crate) fn write_field(
        &mut self,
        id: ObjectId,
        field: &FieldInfo,
        value: Value,
        target: Option<Option<ObjectId>>,
    ) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let value = field
            .sql_type
            .coerce(value)
            .map_err(|e| with_field(e, &field.name))?;
        let obj = self.obj(id)?;
        let class = obj.class.clone();
        let key = obj.key.clone();
        if value.is_null() && !field.nullable {
            return Err(Error::NullConstraint(NullConstraintError {
                class,
                key: key_text(key.as_ref()),
                field: field.name.clone(),
            }));
        }
        if field.primary_key
            && (!obj.is_insert_mode() || obj.key_assigned.contains(field.ordinal))
        {
            return Err(Error::concurrent(
                class,
                format!("primary key field '{}' is already set", field.name),
            ));
        }

        self.ensure_group(id, field.table_group)?;
        let obj = self.obj(id)?;
        let old = obj.raw_value(field.ordinal).clone();
        let field_triggers_off = obj.flags.contains(ObjectFlags::FIELD_TRIGGERS_DISABLED);
        if old == value && !field.primary_key {
            if let Some(target) = target {
                if let Some(slot) = self.obj_mut(id)?.refs.get_mut(field.ordinal) {
                    *slot = target;
                }
            }
            return Ok(());
        }
        let triggers = if field_triggers_off {
            None
        } else {
            self.triggers_for(&class)
        };
        let change = FieldChange {
            object: id,
            field: field.name.clone(),
            old,
            new: value.clone(),
        };
        if let Some(triggers) = &triggers {
            triggers
                .before_field_change(self, &change)
                .map_err(|e| hooks::hook_error(&class, key_text(key.as_ref()), Some(&field.name), e))?;
        }

        let obj = self.obj_mut(id)?;
        obj.write(field.ordinal, value.clone());
        if let Some(Some(target)) = target {
            if let Some(slot) = obj.refs.get_mut(field.ordinal) {
                *slot = Some(target);
            }
        }
        let first = obj.mark_dirty(field.ordinal);
        let root = schema.class(&class)?.root.clone();
        if first {
            self.note_dirty(id, &root);
        } else {
            self.precommitted.remove(&root);
        }
        tracing::trace!(object = %id, field = %field.name, "field written");

        if field.is_reference() {
            self.relink_back_collections(id, field, &change.old, &value)?;
        }
        if field.primary_key {
            self.assign_key_part(id, field.ordinal)?;
        }
        if let Some(triggers) = &triggers {
            triggers
                .after_field_change(self, &change)
                .map_err(|e| hooks::hook_error(&class, key_text(key.as_ref()), Some(&field.name), e))?;
        }
        Ok(())
    }

    fn assign_key_part(&mut self, id: ObjectId, ordinal: usize) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let obj = self.obj_mut(id)?;
        obj.key_assigned.insert(ordinal);
        let info = schema.class(&obj.class)?;
        if obj.key.is_some() || !info.primary_key.iter().all(|&o| obj.key_assigned.contains(o)) {
            return Ok(());
        }
        let key = Tuple::new(
            info.primary_key
                .iter()
                .map(|&o| obj.raw_value(o).clone())
                .collect(),
        );
        obj.key = Some(key.clone());
        if let Err(err) = self.registry.register_key(&info.root, &key, id) {
            let obj = self.obj_mut(id)?;
            obj.key = None;
            obj.key_assigned.remove(ordinal);
            return Err(err);
        }
        self.keys.observe(info, &key);
        Ok(())
    }

    /// Keep materialized one-to-many collections of the old and new owner in
    /// step with a changed foreign key.
    fn relink_back_collections(
        &mut self,
        id: ObjectId,
        field: &FieldInfo,
        old: &Value,
        new: &Value,
    ) -> Result<()> {
        let Some(target) = field.references.as_deref() else {
            return Ok(());
        };
        let schema = Arc::clone(&self.schema);
        let root = schema.class(target)?.root.clone();
        let child = self.obj(id)?.clone();
        let child_info = schema.class(&child.class)?;

        for (value, add) in [(old, false), (new, true)] {
            if value.is_null() {
                continue;
            }
            let Some(owner) = self.registry.lookup(&root, &Tuple::new(vec![value.clone()])) else {
                continue;
            };
            let Some(owner_obj) = self.registry.try_get(owner) else {
                continue;
            };
            let owner_info = schema.class(&owner_obj.class)?;
            let names: Vec<String> = owner_info
                .collections
                .iter()
                .filter(|c| match &c.kind {
                    CollectionKind::OneToMany { child: class, foreign_key } => {
                        foreign_key == &field.name && child_info.is_a(class)
                    }
                    CollectionKind::ManyToMany { .. } => false,
                })
                .filter(|c| {
                    !add || c.filter.iter().all(|(name, expected)| {
                        child_info
                            .field_index(name)
                            .is_some_and(|o| child.raw_value(o) == expected)
                    })
                })
                .map(|c| c.name.clone())
                .collect();
            let owner_obj = self.registry.get_mut(owner)?;
            for name in names {
                if let Some(members) = owner_obj.collections.get_mut(&name) {
                    if add {
                        if !members.contains(&id) {
                            members.push(id);
                        }
                    } else {
                        members.retain(|m| *m != id);
                    }
                }
            }
        }
        Ok(())
    }

    // ---- references ----

    /// Target of a reference field, by field or navigation name.
    pub fn reference(&mut self, id: ObjectId, field: &str) -> Result<Option<ObjectId>> {
        let info = self.field_info(id, field)?;
        let Some(target_class) = info.references.clone() else {
            return Err(not_a_reference(&info));
        };
        self.ensure_group(id, info.table_group)?;
        let obj = self.obj(id)?;
        if let Some(Some(target)) = obj.refs.get(info.ordinal) {
            return Ok(Some(*target));
        }
        let value = obj.raw_value(info.ordinal).clone();
        if value.is_null() {
            return Ok(None);
        }
        let target = self.get(&target_class, Tuple::new(vec![value]))?;
        if let Some(slot) = self.obj_mut(id)?.refs.get_mut(info.ordinal) {
            *slot = Some(target);
        }
        Ok(Some(target))
    }

    /// Point a reference field at `target`, or clear it with `None`.
    ///
    /// The target must belong to this transaction and already have a key.
    pub fn set_reference(&mut self, id: ObjectId, field: &str, target: Option<ObjectId>) -> Result<()> {
        let info = self.field_info(id, field)?;
        let Some(target_class) = info.references.clone() else {
            return Err(not_a_reference(&info));
        };
        let value = match target {
            None => Value::Null,
            Some(target) => {
                if target.txn != self.id {
                    return Err(Error::concurrent(
                        target_class,
                        format!("reference target {target} belongs to another transaction"),
                    ));
                }
                let target_obj = self.obj(target)?;
                let (class, key) = (target_obj.class.clone(), target_obj.key.clone());
                if !self.schema.is_subclass(&class, &target_class) {
                    return Err(Error::Type(TypeError {
                        expected: "an instance of the referenced class",
                        actual: class,
                        field: Some(info.name.clone()),
                    }));
                }
                let key = key.ok_or_else(|| {
                    Error::Custom(format!("reference target {target} has no key yet"))
                })?;
                key.as_scalar().cloned().ok_or_else(|| {
                    Error::unsupported("composite reference", "reference targets need a single-field key")
                })?
            }
        };
        self.write_field(id, &info, value, Some(target))
    }

    // ---- loading ----

    pub(crate) fn ensure_group(&mut self, id: ObjectId, group: usize) -> Result<()> {
        self.load_group(id, group, u8::MAX)
    }

    /// Load one table-group, then prefetch its references up to `depth`.
    #[tracing::instrument(level = "debug", skip(self), fields(txn = self.id))]
    fn load_group(&mut self, id: ObjectId, group: usize, depth: u8) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let obj = self.obj(id)?;
        if obj.is_insert_mode() || obj.load_mask.contains(group) {
            return Ok(());
        }
        let Some(key) = obj.key.clone() else {
            return Ok(());
        };
        let (class, resolved) = (obj.class.clone(), obj.class_resolved);
        let info = schema.class(&class)?;
        if group >= info.tables.len() {
            return Err(Error::Custom(format!(
                "class '{class}' has no table-group {group}"
            )));
        }
        let mut wanted = TableMask::single(group);
        if !resolved {
            wanted.insert(0);
        }
        let index = self.source_index(info)?;

        if info.is_cached() {
            if !self.adopt_cached(id, info, &key, wanted)? {
                let all = TableMask::all(info.tables.len());
                let snapshot = Arc::new(self.fetch(index, info, &key, all)?);
                if let Some(settings) = &info.cache {
                    self.cache.add(
                        &info.root,
                        &key,
                        CacheEntry {
                            load_mask: all,
                            values: Arc::clone(&snapshot),
                        },
                        settings,
                    );
                }
                self.apply_loaded(id, info, all, snapshot, true)?;
                wanted = all;
            }
        } else {
            let values = self.fetch(index, info, &key, wanted)?;
            self.apply_loaded(id, info, wanted, Arc::new(values), false)?;
        }

        if !resolved {
            self.settle_class(id)?;
            if !self.obj(id)?.load_mask.contains(group) {
                return self.load_group(id, group, depth);
            }
        }
        for group in wanted.groups() {
            self.prefetch(id, group, depth)?;
        }
        Ok(())
    }

    fn fetch(&mut self, index: usize, info: &ClassInfo, key: &Tuple, groups: TableMask) -> Result<FieldValues> {
        tracing::debug!(class = %info.name, %key, groups = groups.bits(), "loading");
        self.session(index)?
            .load_tables(info, key, groups)?
            .ok_or_else(|| not_found(&info.name, Some(key)))
    }

    /// Adopt the cached snapshot when it covers `wanted`.
    fn adopt_cached(&mut self, id: ObjectId, info: &ClassInfo, key: &Tuple, wanted: TableMask) -> Result<bool> {
        let Some(entry) = self.cache.find(&info.root, key) else {
            return Ok(false);
        };
        if !entry.load_mask.covers(wanted) {
            tracing::warn!(
                class = %info.name,
                %key,
                cached = entry.load_mask.bits(),
                wanted = wanted.bits(),
                "cached snapshot misses requested table-groups, reloading"
            );
            return Ok(false);
        }
        tracing::trace!(class = %info.name, %key, "cache hit");
        self.apply_loaded(id, info, entry.load_mask, entry.values, true)?;
        Ok(true)
    }

    /// Install loaded values: adopt them when nothing is loaded or dirty
    /// yet, merge them under local changes otherwise.
    pub(crate) fn apply_loaded(
        &mut self,
        id: ObjectId,
        info: &ClassInfo,
        mask: TableMask,
        values: Arc<FieldValues>,
        shared: bool,
    ) -> Result<()> {
        let obj = self.obj_mut(id)?;
        if obj.dirty.is_empty() && obj.load_mask.is_empty() && values.len() >= obj.values.len() {
            obj.adopt(mask, values);
            obj.flags.set(ObjectFlags::FROM_CACHE, shared);
        } else {
            let ordinals: Vec<usize> = mask
                .groups()
                .filter_map(|g| info.tables.get(g))
                .flat_map(|table| table.fields.iter().copied())
                .collect();
            obj.merge_loaded(mask, &ordinals, &values);
        }
        Ok(())
    }

    /// Switch an object fetched through a polymorphic class to its concrete
    /// class, as named by the discriminator.
    pub(crate) fn settle_class(&mut self, id: ObjectId) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let obj = self.obj(id)?;
        if obj.class_resolved {
            return Ok(());
        }
        let info = schema.class(&obj.class)?;
        let concrete = match info.discriminator {
            Some(ordinal) => {
                let value = obj.raw_value(ordinal);
                match schema.class_for_discriminator(&info.name, value) {
                    Some(concrete) => concrete,
                    None => return Err(not_found(&info.name, obj.key.as_ref())),
                }
            }
            None => info,
        };
        // groups read through the base class miss the subclass's own columns
        let known = info.fields.len();
        let obj = self.obj_mut(id)?;
        let mut kept = TableMask::EMPTY;
        for group in obj.load_mask.groups() {
            let complete = concrete
                .tables
                .get(group)
                .is_some_and(|t| t.fields.iter().all(|&o| o < known));
            if complete {
                kept.insert(group);
            }
        }
        obj.load_mask = kept;
        obj.widen(&concrete.name, concrete.fields.len());
        tracing::trace!(object = %id, class = %concrete.name, "concrete class resolved");
        Ok(())
    }

    fn prefetch(&mut self, id: ObjectId, group: usize, depth: u8) -> Result<()> {
        let schema = Arc::clone(&self.schema);
        let obj = self.obj(id)?;
        let info = schema.class(&obj.class)?;
        let Some(table) = info.tables.get(group) else {
            return Ok(());
        };
        let targets: Vec<(usize, String, Value, u8)> = table
            .fields
            .iter()
            .map(|&o| &info.fields[o])
            .filter(|f| f.prefetch.min(depth) > 0)
            .filter(|f| obj.refs.get(f.ordinal).is_some_and(Option::is_none))
            .filter_map(|f| {
                let class = f.references.clone()?;
                let value = obj.raw_value(f.ordinal);
                (!value.is_null()).then(|| (f.ordinal, class, value.clone(), f.prefetch.min(depth)))
            })
            .collect();

        for (ordinal, class, value, depth) in targets {
            let target = self.get(&class, Tuple::new(vec![value]))?;
            if let Some(slot) = self.obj_mut(id)?.refs.get_mut(ordinal) {
                *slot = Some(target);
            }
            self.load_group(target, 0, depth - 1)?;
        }
        Ok(())
    }

    // ---- retention ----

    /// Evict clean objects beyond the configured limit, least recently
    /// used first. `keep` is never evicted.
    pub(crate) fn enforce_retention(&mut self, keep: Option<ObjectId>) {
        let RetentionMode::Evictable { max_resident } = self.config.retention else {
            return;
        };
        let resident = self.registry.resident_count();
        if resident <= max_resident {
            return;
        }
        let mut excess = resident - max_resident;
        let mut refused = 0usize;
        for id in self.registry.by_last_access() {
            if excess == 0 {
                break;
            }
            if Some(id) == keep {
                continue;
            }
            let Some(obj) = self.registry.try_get(id) else {
                continue;
            };
            let pinned = obj.is_dirty()
                || obj.is_insert_mode()
                || obj.is_marked_for_delete()
                || !obj.changed.is_empty()
                || obj.flags.contains(ObjectFlags::FORCE_POST_COMMIT)
                || obj.flags.contains(ObjectFlags::WRITTEN_INTO_DATABASE);
            if pinned {
                refused += 1;
                continue;
            }
            if self.registry.evict(id).is_ok() {
                excess -= 1;
            }
        }
        if excess > 0 {
            tracing::warn!(
                txn = self.id,
                refused,
                max_resident,
                "retention limit exceeded by objects with pending changes"
            );
        }
    }
}

fn creatable(info: &ClassInfo) -> Result<()> {
    if info.is_abstract {
        return Err(Error::schema(
            SchemaErrorKind::Invalid,
            format!("class '{}' is abstract and cannot be created", info.name),
        ));
    }
    Ok(())
}

fn not_a_reference(field: &FieldInfo) -> Error {
    Error::Type(TypeError {
        expected: "a reference field",
        actual: field.sql_type.sql_name(),
        field: Some(field.name.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlobject_core::{ClassDef, ErrorKind, SchemaBuilder, SqlType};

    fn schema() -> Arc<Schema> {
        Arc::new(
            SchemaBuilder::new()
                .class(
                    ClassDef::new("Person")
                        .field(FieldInfo::new("id", SqlType::BigInt).primary_key())
                        .field(FieldInfo::new("name", SqlType::Text))
                        .field(
                            FieldInfo::new("managerId", SqlType::BigInt)
                                .nullable()
                                .references("Person")
                                .navigation("manager"),
                        ),
                )
                .class(
                    ClassDef::new("Tag")
                        .field(FieldInfo::new("code", SqlType::Text).primary_key())
                        .field(FieldInfo::new("label", SqlType::Text).nullable()),
                )
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn create_fills_defaults_and_generates_keys() {
        let mut txn = Transaction::new(schema());
        let a = txn.create("Person").unwrap();
        let b = txn.create("Person").unwrap();
        assert_eq!(txn.key_of(a).unwrap(), Some(Tuple::from(1i64)));
        assert_eq!(txn.key_of(b).unwrap(), Some(Tuple::from(2i64)));
        assert_eq!(txn.value(a, "name").unwrap(), Value::Text(String::new()));
        assert_eq!(txn.value(a, "manager").unwrap(), Value::Null);
        assert!(txn.is_dirty(a).unwrap());
        assert_eq!(txn.dirty_objects(), vec![a, b]);
    }

    #[test]
    fn key_fields_are_set_once() {
        let mut txn = Transaction::new(schema());
        let tag = txn.create("Tag").unwrap();
        assert_eq!(txn.key_of(tag).unwrap(), None);
        txn.set_value(tag, "code", "red").unwrap();
        assert_eq!(txn.key_of(tag).unwrap(), Some(Tuple::from("red")));

        let err = txn.set_value(tag, "code", "blue").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentMutation);

        let other = txn.create("Tag").unwrap();
        let err = txn.set_value(other, "code", "red").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentMutation);
        assert_eq!(txn.key_of(other).unwrap(), None);
    }

    #[test]
    fn write_checks_nullability_and_type() {
        let mut txn = Transaction::new(schema());
        let p = txn.create("Person").unwrap();
        let err = txn.set_value(p, "name", Value::Null).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NullConstraint);
        let err = txn.set_value(p, "managerId", "not a number").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Type);
        let err = txn.set_value(p, "salary", 1i64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaResolution);
    }

    #[test]
    fn references_resolve_to_live_objects() {
        let mut txn = Transaction::new(schema());
        let boss = txn.create("Person").unwrap();
        let worker = txn.create("Person").unwrap();
        txn.set_reference(worker, "manager", Some(boss)).unwrap();
        assert_eq!(txn.value(worker, "managerId").unwrap(), Value::BigInt(1));
        assert_eq!(txn.reference(worker, "manager").unwrap(), Some(boss));

        txn.set_reference(worker, "manager", None).unwrap();
        assert_eq!(txn.reference(worker, "manager").unwrap(), None);

        let mut other = Transaction::new(schema());
        let stranger = other.create("Person").unwrap();
        let err = txn.set_reference(worker, "manager", Some(stranger)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentMutation);
    }

    #[test]
    fn duplicate_keys_conflict() {
        let mut txn = Transaction::new(schema());
        txn.create_with_key("Person", 10i64).unwrap();
        let err = txn.create_with_key("Person", 10i64).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrentMutation);
        // generated keys skip past keys chosen by the caller
        let next = txn.create("Person").unwrap();
        assert_eq!(txn.key_of(next).unwrap(), Some(Tuple::from(11i64)));
    }

    #[test]
    fn loading_without_source_fails() {
        let mut txn = Transaction::new(schema());
        let id = txn.get("Person", 5i64).unwrap();
        assert_eq!(txn.get("Person", 5i64).unwrap(), id);
        let err = txn.value(id, "name").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Custom);
    }
}
