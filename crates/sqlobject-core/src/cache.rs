//! Object cache contract and the bundled implementations.
//!
//! Entries are keyed by (hierarchy root class, primary key) and hold an
//! immutable field-value snapshot shared through an `Arc`. A transaction that
//! adopts a snapshot clones it before its first local write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::field_values::{FieldValues, TableMask};
use crate::schema::CacheSettings;
use crate::tuple::Tuple;

/// Why an entry is being invalidated.
///
/// Passed through opaquely; implementations decide whether the reason
/// matters for their eviction policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    Inserted,
    Updated,
    Deleted,
}

/// A cached snapshot of an object's loaded field values.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub load_mask: TableMask,
    pub values: Arc<FieldValues>,
}

/// Scoped exclusion held during the invalidation phase of a commit.
pub struct CacheGuard<'a> {
    _guard: Option<MutexGuard<'a, ()>>,
}

impl<'a> CacheGuard<'a> {
    pub fn new(guard: MutexGuard<'a, ()>) -> Self {
        Self {
            _guard: Some(guard),
        }
    }

    /// A guard that excludes nothing.
    pub fn unlocked() -> Self {
        Self { _guard: None }
    }
}

/// Cache collaborator used by transactions.
pub trait ObjectCache: Send + Sync {
    fn find(&self, class: &str, key: &Tuple) -> Option<CacheEntry>;

    fn add(&self, class: &str, key: &Tuple, entry: CacheEntry, settings: &CacheSettings);

    fn invalidate(&self, class: &str, key: &Tuple, reason: InvalidationReason);

    fn lock(&self) -> CacheGuard<'_>;

    /// Key list stored under a collection name.
    fn find_collection(&self, name: &str) -> Option<Arc<Vec<Tuple>>>;

    /// Store a key list tagged with the classes whose changes invalidate it.
    fn store_collection(
        &self,
        name: &str,
        keys: Vec<Tuple>,
        dependent_classes: &[String],
        settings: &CacheSettings,
    );

    /// Drop every collection tagged with `class`.
    fn invalidate_collections(&self, class: &str);
}

/// Cache that never stores anything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoCache;

impl ObjectCache for NoCache {
    fn find(&self, _class: &str, _key: &Tuple) -> Option<CacheEntry> {
        None
    }

    fn add(&self, _class: &str, _key: &Tuple, _entry: CacheEntry, _settings: &CacheSettings) {}

    fn invalidate(&self, _class: &str, _key: &Tuple, _reason: InvalidationReason) {}

    fn lock(&self) -> CacheGuard<'_> {
        CacheGuard::unlocked()
    }

    fn find_collection(&self, _name: &str) -> Option<Arc<Vec<Tuple>>> {
        None
    }

    fn store_collection(
        &self,
        _name: &str,
        _keys: Vec<Tuple>,
        _dependent_classes: &[String],
        _settings: &CacheSettings,
    ) {
    }

    fn invalidate_collections(&self, _class: &str) {}
}

#[derive(Debug)]
struct Expiry {
    at: Instant,
    ttl: Duration,
    sliding: bool,
}

impl Expiry {
    fn new(settings: &CacheSettings) -> Self {
        Self {
            at: Instant::now() + settings.expiration,
            ttl: settings.expiration,
            sliding: settings.sliding,
        }
    }

    /// Whether the entry is still alive, extending it when sliding.
    fn touch(&mut self, now: Instant) -> bool {
        if now >= self.at {
            return false;
        }
        if self.sliding {
            self.at = now + self.ttl;
        }
        true
    }
}

#[derive(Debug)]
struct StoredEntry {
    entry: CacheEntry,
    expiry: Expiry,
}

#[derive(Debug)]
struct StoredCollection {
    keys: Arc<Vec<Tuple>>,
    dependent_classes: Vec<String>,
    expiry: Expiry,
}

/// Process-local cache with per-entry expiration.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<(String, Tuple), StoredEntry>>,
    collections: Mutex<HashMap<String, StoredCollection>>,
    commit_lock: Mutex<()>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
        lock(&self.collections).clear();
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ObjectCache for MemoryCache {
    fn find(&self, class: &str, key: &Tuple) -> Option<CacheEntry> {
        let mut entries = lock(&self.entries);
        let id = (class.to_string(), key.clone());
        let alive = entries
            .get_mut(&id)
            .map(|stored| stored.expiry.touch(Instant::now()));
        let found = match alive {
            Some(true) => entries.get(&id).map(|stored| stored.entry.clone()),
            Some(false) => {
                entries.remove(&id);
                None
            }
            None => None,
        };
        if found.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        found
    }

    fn add(&self, class: &str, key: &Tuple, entry: CacheEntry, settings: &CacheSettings) {
        tracing::trace!(class, key = %key, mask = %entry.load_mask, "cache add");
        lock(&self.entries).insert(
            (class.to_string(), key.clone()),
            StoredEntry {
                entry,
                expiry: Expiry::new(settings),
            },
        );
    }

    fn invalidate(&self, class: &str, key: &Tuple, reason: InvalidationReason) {
        tracing::trace!(class, key = %key, ?reason, "cache invalidate");
        lock(&self.entries).remove(&(class.to_string(), key.clone()));
    }

    fn lock(&self) -> CacheGuard<'_> {
        CacheGuard::new(lock(&self.commit_lock))
    }

    fn find_collection(&self, name: &str) -> Option<Arc<Vec<Tuple>>> {
        let mut collections = lock(&self.collections);
        let alive = collections
            .get_mut(name)
            .map(|stored| stored.expiry.touch(Instant::now()));
        match alive {
            Some(true) => collections.get(name).map(|stored| Arc::clone(&stored.keys)),
            Some(false) => {
                collections.remove(name);
                None
            }
            None => None,
        }
    }

    fn store_collection(
        &self,
        name: &str,
        keys: Vec<Tuple>,
        dependent_classes: &[String],
        settings: &CacheSettings,
    ) {
        lock(&self.collections).insert(
            name.to_string(),
            StoredCollection {
                keys: Arc::new(keys),
                dependent_classes: dependent_classes.to_vec(),
                expiry: Expiry::new(settings),
            },
        );
    }

    fn invalidate_collections(&self, class: &str) {
        lock(&self.collections)
            .retain(|_, stored| !stored.dependent_classes.iter().any(|c| c == class));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    fn entry(v: i64) -> CacheEntry {
        CacheEntry {
            load_mask: TableMask::single(0),
            values: Arc::new(FieldValues::from_vec(vec![Value::BigInt(v)])),
        }
    }

    #[test]
    fn add_find_invalidate() {
        let cache = MemoryCache::new();
        let key = Tuple::scalar(1i64);
        assert!(cache.find("Person", &key).is_none());
        cache.add("Person", &key, entry(1), &CacheSettings::default());
        let hit = cache.find("Person", &key).unwrap();
        assert_eq!(hit.values.get(0), &Value::BigInt(1));
        assert_eq!((cache.hits(), cache.misses()), (1, 1));

        cache.invalidate("Person", &key, InvalidationReason::Updated);
        assert!(cache.find("Person", &key).is_none());
    }

    #[test]
    fn expired_entries_are_dropped() {
        let cache = MemoryCache::new();
        let key = Tuple::scalar(1i64);
        let settings = CacheSettings {
            expiration: Duration::ZERO,
            sliding: false,
        };
        cache.add("Person", &key, entry(1), &settings);
        assert!(cache.find("Person", &key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn sliding_entries_stay_alive_while_read() {
        let cache = MemoryCache::new();
        let key = Tuple::scalar(1i64);
        let settings = CacheSettings {
            expiration: Duration::from_secs(60),
            sliding: true,
        };
        cache.add("Person", &key, entry(7), &settings);
        let before = lock(&cache.entries)[&("Person".to_string(), key.clone())].expiry.at;
        assert!(cache.find("Person", &key).is_some());
        let after = lock(&cache.entries)[&("Person".to_string(), key.clone())].expiry.at;
        assert!(after >= before);
        assert_eq!(cache.hits(), 1);
    }

    #[test]
    fn expired_collections_are_dropped() {
        let cache = MemoryCache::new();
        let expired = CacheSettings {
            expiration: Duration::ZERO,
            sliding: false,
        };
        cache.store_collection("stale", vec![Tuple::scalar(1i64)], &[], &expired);
        assert!(cache.find_collection("stale").is_none());
        assert!(lock(&cache.collections).is_empty());

        cache.store_collection("fresh", vec![Tuple::scalar(2i64)], &[], &CacheSettings::default());
        let keys = cache.find_collection("fresh").unwrap();
        assert_eq!(keys.as_slice(), &[Tuple::scalar(2i64)]);
    }

    #[test]
    fn collections_invalidate_by_dependent_class() {
        let cache = MemoryCache::new();
        let settings = CacheSettings::default();
        cache.store_collection(
            "active",
            vec![Tuple::scalar(1i64)],
            &["Person".to_string()],
            &settings,
        );
        cache.store_collection("projects", vec![], &["Project".to_string()], &settings);
        cache.invalidate_collections("Person");
        assert!(cache.find_collection("active").is_none());
        assert!(cache.find_collection("projects").is_some());
    }

    #[test]
    fn lock_is_exclusive_for_its_scope() {
        let cache = MemoryCache::new();
        let guard = cache.lock();
        assert!(cache.commit_lock.try_lock().is_err());
        drop(guard);
        assert!(cache.commit_lock.try_lock().is_ok());
    }
}
