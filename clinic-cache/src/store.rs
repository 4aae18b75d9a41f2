//! Two-tier cache store.
//!
//! The memory tier is authoritative and bounded by `max_memory_entries`
//! with LRU eviction. Every write is mirrored into a [`PersistentMirror`] on
//! a best-effort basis, and memory misses fall back to the mirror, promoting
//! valid documents back into memory.
//!
//! # Serialization
//!
//! Every public operation runs inside the store's [`OperationQueue`]. The
//! queued bodies are synchronous `*_inner` functions that never re-enter the
//! queue, so composite operations like [`CacheStore::set_with_tags`] are
//! atomic with respect to each other.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use clinic_core::{
    duration_millis, CacheConfig, CacheError, CacheResult, ClinicResult, Clock, MirrorError,
    SystemClock,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::entry::CacheEntry;
use crate::lmdb_mirror::LmdbMirror;
use crate::mirror::{MemoryMirror, PersistentMirror};
use crate::queue::OperationQueue;
use crate::stats::CacheStoreStats;
use crate::sweeper::SweeperHandle;

/// Prefix of tag index keys.
pub const TAG_PREFIX: &str = "tag:";

/// Key of the index entry for `tag`.
pub fn tag_key(tag: &str) -> String {
    format!("{}{}", TAG_PREFIX, tag)
}

fn is_tag_key(key: &str) -> bool {
    key.starts_with(TAG_PREFIX)
}

#[derive(Debug, Default)]
struct MemoryTier {
    entries: HashMap<String, CacheEntry>,
    access_counter: u64,
}

impl MemoryTier {
    fn next_stamp(&mut self) -> u64 {
        self.access_counter += 1;
        self.access_counter
    }
}

/// Outcome of reading one persisted document.
enum Persisted {
    Valid(CacheEntry),
    Expired,
    Corrupt(String),
}

/// Tagged TTL/LRU cache with a memory tier and a persistent mirror.
pub struct CacheStore {
    config: CacheConfig,
    memory: Mutex<MemoryTier>,
    mirror: Arc<dyn PersistentMirror>,
    clock: Arc<dyn Clock>,
    queue: OperationQueue,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    pub(crate) sweeper: Mutex<Option<SweeperHandle>>,
}

impl CacheStore {
    /// Create a store over an explicit mirror and clock.
    pub fn new(
        config: CacheConfig,
        mirror: Arc<dyn PersistentMirror>,
        clock: Arc<dyn Clock>,
    ) -> ClinicResult<Self> {
        config.validate()?;
        Ok(Self {
            config,
            memory: Mutex::new(MemoryTier::default()),
            mirror,
            clock,
            queue: OperationQueue::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        })
    }

    /// Create a store mirrored into process memory, using the system clock.
    pub fn in_memory(config: CacheConfig) -> ClinicResult<Self> {
        let mirror = Arc::new(MemoryMirror::with_quota(config.persistent_budget_bytes));
        Self::new(config, mirror, Arc::new(SystemClock))
    }

    /// Create a store mirrored into an LMDB environment under `path`.
    pub fn with_lmdb<P: AsRef<Path>>(config: CacheConfig, path: P) -> ClinicResult<Self> {
        let mirror = Arc::new(LmdbMirror::open(path, config.persistent_budget_bytes)?);
        Self::new(config, mirror, Arc::new(SystemClock))
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Operations waiting in, or running on, the store's queue.
    pub fn pending_operations(&self) -> usize {
        self.queue.pending()
    }

    // ========================================================================
    // PUBLIC OPERATIONS
    // ========================================================================

    /// Read `key`, falling back to the persistent mirror on a memory miss.
    ///
    /// Mirror failures are logged and treated as a miss. The only error is
    /// [`CacheError::InvalidKey`].
    pub async fn get(&self, key: &str) -> CacheResult<Option<Value>> {
        self.queue.enqueue(move || async move { self.get_inner(key) }).await
    }

    /// Store `value` under `key` for `ttl`, or the configured default TTL.
    pub async fn set(&self, key: &str, value: Value, ttl: Option<Duration>) -> CacheResult<()> {
        self.queue
            .enqueue(move || async move { self.set_inner(key, value, ttl).map(|_| ()) })
            .await
    }

    /// Remove `key` from both tiers, returning whether either held it.
    pub async fn delete(&self, key: &str) -> CacheResult<bool> {
        self.queue.enqueue(move || async move { self.delete_inner(key) }).await
    }

    /// Store `value` and register `key` in the index of every tag.
    pub async fn set_with_tags(
        &self,
        key: &str,
        value: Value,
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        self.queue
            .enqueue(move || async move { self.set_with_tags_inner(key, value, tags, ttl) })
            .await
    }

    /// Delete every key registered under `tag`, then the tag index itself.
    ///
    /// Returns how many of the indexed keys were present.
    pub async fn invalidate_by_tag(&self, tag: &str) -> CacheResult<usize> {
        self.queue
            .enqueue(move || async move { self.invalidate_by_tag_inner(tag) })
            .await
    }

    /// Remove expired entries from both tiers, and corrupt mirror documents.
    pub async fn cleanup_expired(&self) -> usize {
        self.queue
            .enqueue(move || async move { self.cleanup_expired_inner() })
            .await
    }

    /// Evict least recently used memory entries down to the configured cap.
    pub async fn enforce_memory_limit(&self) -> usize {
        self.queue
            .enqueue(move || async move {
                let mut memory = self.lock_memory();
                self.evict_over_limit(&mut memory)
            })
            .await
    }

    /// Drop every entry in memory and every mirror item under the prefix.
    pub async fn clear(&self) -> CacheResult<()> {
        self.queue.enqueue(move || async move { self.clear_inner() }).await
    }

    /// Read `key` and deserialize it into `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, key: &str) -> CacheResult<Option<T>> {
        match self.get(key).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| CacheError::Serialization {
                    reason: e.to_string(),
                }),
            None => Ok(None),
        }
    }

    /// Serialize `value` and store it under `key`.
    pub async fn set_as<T: Serialize + ?Sized>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let value = serde_json::to_value(value).map_err(|e| CacheError::Serialization {
            reason: e.to_string(),
        })?;
        self.set(key, value, ttl).await
    }

    /// Snapshot of tier sizes and counters. Does not modify the store.
    pub fn get_stats(&self) -> CacheStoreStats {
        let now = self.clock.now_millis();
        let (total, expired) = {
            let memory = self.lock_memory();
            let expired = memory
                .entries
                .values()
                .filter(|entry| entry.is_expired(now))
                .count();
            (memory.entries.len(), expired)
        };
        let persisted_count = match self.mirror.keys() {
            Ok(keys) => keys
                .iter()
                .filter(|k| k.starts_with(&self.config.mirror_prefix))
                .count(),
            Err(e) => {
                warn!(error = %e, "Failed to enumerate persistent mirror");
                0
            }
        };

        CacheStoreStats {
            total,
            valid: total - expired,
            expired,
            persisted_count,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }

    /// Keys currently held in the memory tier, sorted.
    pub fn memory_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock_memory().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    // ========================================================================
    // QUEUED BODIES
    // ========================================================================

    fn get_inner(&self, key: &str) -> CacheResult<Option<Value>> {
        validate_key(key)?;
        let now = self.clock.now_millis();
        match self.lookup(key, now) {
            Some(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Cache hit");
                Ok(Some(entry.value))
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                debug!(key, "Cache miss");
                Ok(None)
            }
        }
    }

    /// Returns the new entry's absolute expiry.
    fn set_inner(&self, key: &str, value: Value, ttl: Option<Duration>) -> CacheResult<i64> {
        validate_key(key)?;
        let ttl = ttl.unwrap_or(self.config.default_ttl);
        let expires_at = self
            .clock
            .now_millis()
            .saturating_add(duration_millis(ttl));
        self.write_entry(key, value, expires_at)?;
        Ok(expires_at)
    }

    fn delete_inner(&self, key: &str) -> CacheResult<bool> {
        validate_key(key)?;
        let in_memory = self.lock_memory().entries.remove(key).is_some();
        let in_mirror = match self.mirror.remove_item(&self.mirror_key(key)) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(key, error = %e, "Failed to remove persisted cache entry");
                false
            }
        };
        Ok(in_memory || in_mirror)
    }

    fn set_with_tags_inner(
        &self,
        key: &str,
        value: Value,
        tags: &[&str],
        ttl: Option<Duration>,
    ) -> CacheResult<()> {
        let expires_at = self.set_inner(key, value, ttl)?;
        let now = self.clock.now_millis();

        for tag in tags {
            let index_key = tag_key(tag);
            let (mut keys, index_expiry) = match self.lookup(&index_key, now) {
                Some(entry) => {
                    let expiry = entry.expires_at;
                    (tag_members(&index_key, entry.value), expiry)
                }
                None => (Vec::new(), expires_at),
            };
            if !keys.iter().any(|k| k == key) {
                keys.push(key.to_string());
            }
            self.write_entry(&index_key, Value::from(keys), index_expiry.max(expires_at))?;
        }
        Ok(())
    }

    fn invalidate_by_tag_inner(&self, tag: &str) -> CacheResult<usize> {
        let index_key = tag_key(tag);
        let now = self.clock.now_millis();
        let keys = self
            .lookup(&index_key, now)
            .map(|entry| tag_members(&index_key, entry.value))
            .unwrap_or_default();

        let mut removed = 0;
        for key in &keys {
            // Stale or malformed members are skipped.
            if matches!(self.delete_inner(key), Ok(true)) {
                removed += 1;
            }
        }
        self.delete_inner(&index_key)?;

        debug!(tag, indexed = keys.len(), removed, "Invalidated cache tag");
        Ok(removed)
    }

    fn cleanup_expired_inner(&self) -> usize {
        let now = self.clock.now_millis();
        let mut removed: HashSet<String> = HashSet::new();

        {
            let mut memory = self.lock_memory();
            memory.entries.retain(|key, entry| {
                if entry.is_expired(now) {
                    removed.insert(key.clone());
                    false
                } else {
                    true
                }
            });
        }

        let prefix = &self.config.mirror_prefix;
        match self.mirror.keys() {
            Ok(keys) => {
                for mirror_key in keys.iter().filter(|k| k.starts_with(prefix.as_str())) {
                    let key = &mirror_key[prefix.len()..];
                    let stale = match self.mirror.get_item(mirror_key) {
                        Ok(Some(doc)) => !matches!(parse_document(key, &doc, now), Persisted::Valid(_)),
                        Ok(None) => false,
                        Err(e) => {
                            warn!(key, error = %e, "Failed to read persisted cache entry");
                            false
                        }
                    };
                    if stale {
                        match self.mirror.remove_item(mirror_key) {
                            Ok(_) => {
                                removed.insert(key.to_string());
                            }
                            Err(e) => {
                                warn!(key, error = %e, "Failed to remove stale persisted entry");
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to enumerate persistent mirror during cleanup");
            }
        }

        if !removed.is_empty() {
            debug!(removed = removed.len(), "Removed expired cache entries");
        }
        removed.len()
    }

    fn clear_inner(&self) -> CacheResult<()> {
        self.lock_memory().entries.clear();
        let prefix = &self.config.mirror_prefix;
        for mirror_key in self.mirror.keys()? {
            if mirror_key.starts_with(prefix.as_str()) {
                self.mirror.remove_item(&mirror_key)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // TIER HELPERS
    // ========================================================================

    /// Resolve `key` through both tiers without touching hit/miss counters.
    ///
    /// Expired memory entries are purged from both tiers. Valid mirror
    /// documents are promoted; expired or corrupt ones are removed.
    fn lookup(&self, key: &str, now: i64) -> Option<CacheEntry> {
        {
            let mut memory = self.lock_memory();
            let tier = &mut *memory;
            tier.access_counter += 1;
            let stamp = tier.access_counter;
            let expired = match tier.entries.get_mut(key) {
                Some(entry) if !entry.is_expired(now) => {
                    entry.last_accessed = stamp;
                    return Some(entry.clone());
                }
                Some(_) => true,
                None => false,
            };
            if expired {
                tier.entries.remove(key);
                drop(memory);
                self.remove_persisted(key);
                return None;
            }
        }

        let mirror_key = self.mirror_key(key);
        let doc = match self.mirror.get_item(&mirror_key) {
            Ok(Some(doc)) => doc,
            Ok(None) => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read persistent mirror");
                return None;
            }
        };

        match parse_document(key, &doc, now) {
            Persisted::Valid(mut entry) => {
                let mut memory = self.lock_memory();
                entry.last_accessed = memory.next_stamp();
                memory.entries.insert(key.to_string(), entry.clone());
                self.evict_over_limit(&mut memory);
                debug!(key, "Promoted persisted cache entry");
                Some(entry)
            }
            Persisted::Expired => {
                self.remove_persisted(key);
                None
            }
            Persisted::Corrupt(reason) => {
                debug!(key, reason = %reason, "Removing corrupt persisted cache entry");
                self.remove_persisted(key);
                None
            }
        }
    }

    /// Write an entry to memory, enforce the cap, then mirror it.
    fn write_entry(&self, key: &str, value: Value, expires_at: i64) -> CacheResult<()> {
        let (entry, doc) = {
            let mut memory = self.lock_memory();
            let entry = CacheEntry::new(key, value, expires_at, memory.next_stamp());
            let doc = serde_json::to_string(&entry).map_err(|e| CacheError::Serialization {
                reason: e.to_string(),
            })?;
            memory.entries.insert(key.to_string(), entry.clone());
            self.evict_over_limit(&mut memory);
            (entry, doc)
        };
        self.persist(&entry.key, &doc);
        Ok(())
    }

    /// Best-effort mirror write with one expiry sweep on quota failure.
    ///
    /// A write that cannot be stored removes any older persisted copy so the
    /// mirror never serves a stale value for `key`.
    fn persist(&self, key: &str, doc: &str) {
        let mirror_key = self.mirror_key(key);
        let bytes = mirror_key.len() + doc.len();
        if bytes > self.config.persistent_budget_bytes {
            debug!(key, bytes, "Entry exceeds persistent budget, keeping it in memory only");
            self.remove_persisted(key);
            return;
        }

        match self.mirror.set_item(&mirror_key, doc) {
            Ok(()) => {}
            Err(MirrorError::QuotaExceeded { .. }) => {
                let reclaimed = self.cleanup_expired_inner();
                match self.mirror.set_item(&mirror_key, doc) {
                    Ok(()) => {
                        debug!(key, reclaimed, "Persisted cache entry after expiry sweep");
                    }
                    Err(e) => {
                        warn!(key, reclaimed, error = %e, "Dropping persistent write");
                        self.remove_persisted(key);
                    }
                }
            }
            Err(e) => {
                warn!(key, error = %e, "Persistent mirror write failed");
                self.remove_persisted(key);
            }
        }
    }

    fn remove_persisted(&self, key: &str) {
        if let Err(e) = self.mirror.remove_item(&self.mirror_key(key)) {
            warn!(key, error = %e, "Failed to remove persisted cache entry");
        }
    }

    /// Evict the least recently accessed data entries above the cap.
    ///
    /// Tag indexes are neither counted nor evicted: the mirror may be unable
    /// to hold them, and a lost index would leave its members uninvalidatable.
    /// Access stamps are unique, so the `excess`-th smallest stamp is an
    /// exact cut-off and selection replaces a full sort.
    fn evict_over_limit(&self, memory: &mut MemoryTier) -> usize {
        let mut stamps: Vec<u64> = memory
            .entries
            .iter()
            .filter(|(key, _)| !is_tag_key(key))
            .map(|(_, entry)| entry.last_accessed)
            .collect();
        let max = self.config.max_memory_entries;
        if stamps.len() <= max {
            return 0;
        }
        let excess = stamps.len() - max;

        let (_, cutoff, _) = stamps.select_nth_unstable(excess - 1);
        let cutoff = *cutoff;
        let len = memory.entries.len();
        memory
            .entries
            .retain(|key, entry| is_tag_key(key) || entry.last_accessed > cutoff);

        let evicted = len - memory.entries.len();
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        debug!(evicted, remaining = memory.entries.len(), "Evicted LRU cache entries");
        evicted
    }

    fn mirror_key(&self, key: &str) -> String {
        format!("{}{}", self.config.mirror_prefix, key)
    }

    fn lock_memory(&self) -> MutexGuard<'_, MemoryTier> {
        self.memory.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for CacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheStore")
            .field("config", &self.config)
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

fn validate_key(key: &str) -> CacheResult<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidKey {
            key: key.to_string(),
        });
    }
    Ok(())
}

fn parse_document(key: &str, doc: &str, now: i64) -> Persisted {
    match serde_json::from_str::<CacheEntry>(doc) {
        Ok(entry) if entry.key != key => {
            Persisted::Corrupt(format!("stored under {} but keyed {}", key, entry.key))
        }
        Ok(entry) if entry.is_expired(now) => Persisted::Expired,
        Ok(entry) => Persisted::Valid(entry),
        Err(e) => Persisted::Corrupt(e.to_string()),
    }
}

/// Decode a tag index value; a malformed index reads as empty.
fn tag_members(index_key: &str, value: Value) -> Vec<String> {
    match serde_json::from_value(value) {
        Ok(keys) => keys,
        Err(e) => {
            debug!(key = index_key, error = %e, "Ignoring malformed tag index");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clinic_core::ManualClock;
    use serde_json::json;

    const START: i64 = 1_700_000_000_000;

    fn test_store(config: CacheConfig) -> (CacheStore, Arc<MemoryMirror>, Arc<ManualClock>) {
        let mirror = Arc::new(MemoryMirror::with_quota(config.persistent_budget_bytes));
        let clock = Arc::new(ManualClock::new(START));
        let store = CacheStore::new(config, mirror.clone(), clock.clone())
            .expect("store creation should succeed");
        (store, mirror, clock)
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let (store, _, _) = test_store(CacheConfig::default());
        store
            .set("patients:findAll:{}", json!([{"id": "p-1"}]), None)
            .await
            .expect("set should succeed");

        let value = store.get("patients:findAll:{}").await.expect("get");
        assert_eq!(value, Some(json!([{"id": "p-1"}])));
        assert_eq!(store.get_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let (store, _, _) = test_store(CacheConfig::default());
        let err = store.get("").await.expect_err("empty key must be rejected");
        assert!(matches!(err, CacheError::InvalidKey { .. }));
    }

    #[tokio::test]
    async fn test_expiry_boundary() {
        let (store, _, clock) = test_store(CacheConfig::default());
        store
            .set("k", json!(1), Some(Duration::from_secs(10)))
            .await
            .expect("set");

        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.expect("get"), Some(json!(1)));

        clock.advance(Duration::from_millis(1));
        assert_eq!(store.get("k").await.expect("get"), None);
        // The expired hit was purged from both tiers.
        assert_eq!(store.get_stats().total, 0);
        assert_eq!(store.get_stats().persisted_count, 0);
    }

    #[tokio::test]
    async fn test_memory_miss_promotes_from_mirror() {
        let config = CacheConfig::default();
        let mirror = Arc::new(MemoryMirror::with_quota(config.persistent_budget_bytes));
        let clock = Arc::new(ManualClock::new(START));

        let first = CacheStore::new(config.clone(), mirror.clone(), clock.clone()).expect("store");
        first.set("k", json!({"a": 1}), None).await.expect("set");
        drop(first);

        // A fresh store over the same mirror starts with an empty memory tier.
        let second = CacheStore::new(config, mirror, clock).expect("store");
        assert_eq!(second.get_stats().total, 0);
        assert_eq!(second.get("k").await.expect("get"), Some(json!({"a": 1})));
        assert_eq!(second.get_stats().total, 1);
    }

    #[tokio::test]
    async fn test_corrupt_persisted_document_is_removed() {
        let (store, mirror, _) = test_store(CacheConfig::default());
        mirror
            .set_item("clinic-cache:broken", "{not json")
            .expect("seed corrupt doc");

        assert_eq!(store.get("broken").await.expect("get"), None);
        assert_eq!(mirror.get_item("clinic-cache:broken").expect("read"), None);
    }

    #[tokio::test]
    async fn test_document_under_wrong_key_is_corrupt() {
        let (store, mirror, _) = test_store(CacheConfig::default());
        let doc = serde_json::to_string(&CacheEntry::new("other", json!(1), START + 60_000, 1))
            .expect("serialize");
        mirror.set_item("clinic-cache:mine", &doc).expect("seed");

        assert_eq!(store.get("mine").await.expect("get"), None);
        assert_eq!(mirror.len().expect("len"), 0);
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (store, _, _) = test_store(CacheConfig::default());
        store.set("k", json!(1), None).await.expect("set");
        assert!(store.delete("k").await.expect("delete"));
        assert!(!store.delete("k").await.expect("delete"));
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_lru_eviction_keeps_recently_read() {
        let (store, _, _) = test_store(CacheConfig::default().with_max_entries(2));
        store.set("a", json!(1), None).await.expect("set");
        store.set("b", json!(2), None).await.expect("set");
        store.get("a").await.expect("get");
        store.set("c", json!(3), None).await.expect("set");

        assert_eq!(store.memory_keys(), vec!["a", "c"]);
        assert_eq!(store.get_stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_eviction_leaves_mirror_copy() {
        let (store, _, _) = test_store(CacheConfig::default().with_max_entries(1));
        store.set("a", json!(1), None).await.expect("set");
        store.set("b", json!(2), None).await.expect("set");

        assert_eq!(store.memory_keys(), vec!["b"]);
        // Evicted from memory, still recoverable from the mirror.
        assert_eq!(store.get("a").await.expect("get"), Some(json!(1)));
        assert_eq!(store.memory_keys(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_tag_index_survives_eviction_without_mirror_room() {
        // Nothing fits the mirror, so memory holds the only copy of the index.
        let config = CacheConfig::default()
            .with_max_entries(3)
            .with_budget_bytes(16);
        let (store, mirror, _) = test_store(config);
        store
            .set_with_tags("k1", json!(1), &["t"], None)
            .await
            .expect("set_with_tags");
        store.set("a", json!(2), None).await.expect("set");
        store.get("k1").await.expect("get");
        store.set("b", json!(3), None).await.expect("set");

        assert_eq!(mirror.len().expect("len"), 0);
        assert_eq!(store.memory_keys(), vec!["a", "b", "k1", "tag:t"]);
        assert_eq!(store.get_stats().evictions, 0);

        assert_eq!(store.invalidate_by_tag("t").await.expect("invalidate"), 1);
        assert_eq!(store.get("k1").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_tag_indexes_do_not_count_against_cap() {
        let (store, _, _) = test_store(CacheConfig::default().with_max_entries(2));
        store
            .set_with_tags("a", json!(1), &["t1", "t2"], None)
            .await
            .expect("set_with_tags");
        store
            .set_with_tags("b", json!(2), &["t1"], None)
            .await
            .expect("set_with_tags");
        store.set("c", json!(3), None).await.expect("set");

        assert_eq!(store.memory_keys(), vec!["b", "c", "tag:t1", "tag:t2"]);
        assert_eq!(store.get_stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_tag_index_has_no_duplicates() {
        let (store, _, _) = test_store(CacheConfig::default());
        store
            .set_with_tags("k", json!(1), &["patients"], None)
            .await
            .expect("set");
        store
            .set_with_tags("k", json!(2), &["patients"], None)
            .await
            .expect("set");

        let index = store.get(&tag_key("patients")).await.expect("get");
        assert_eq!(index, Some(json!(["k"])));
    }

    #[tokio::test]
    async fn test_tag_expiry_extends_to_latest_member() {
        let (store, _, clock) = test_store(CacheConfig::default());
        store
            .set_with_tags("long", json!(1), &["t"], Some(Duration::from_secs(100)))
            .await
            .expect("set");
        store
            .set_with_tags("short", json!(2), &["t"], Some(Duration::from_secs(1)))
            .await
            .expect("set");

        // The index outlives its shortest member.
        clock.advance(Duration::from_secs(50));
        assert_eq!(store.invalidate_by_tag("t").await.expect("invalidate"), 2);
        assert_eq!(store.get("long").await.expect("get"), None);
    }

    #[tokio::test]
    async fn test_invalidate_tolerates_stale_members() {
        let (store, _, _) = test_store(CacheConfig::default());
        store
            .set_with_tags("a", json!(1), &["t"], None)
            .await
            .expect("set");
        store
            .set_with_tags("b", json!(2), &["t"], None)
            .await
            .expect("set");
        store.delete("a").await.expect("delete");

        assert_eq!(store.invalidate_by_tag("t").await.expect("invalidate"), 1);
        assert_eq!(store.get(&tag_key("t")).await.expect("get"), None);
        assert_eq!(store.invalidate_by_tag("t").await.expect("invalidate"), 0);
    }

    #[tokio::test]
    async fn test_cleanup_counts_each_key_once() {
        let (store, mirror, clock) = test_store(CacheConfig::default());
        store
            .set("short", json!(1), Some(Duration::from_secs(1)))
            .await
            .expect("set");
        store
            .set("long", json!(2), Some(Duration::from_secs(60)))
            .await
            .expect("set");
        mirror
            .set_item("clinic-cache:junk", "][")
            .expect("seed corrupt doc");
        mirror
            .set_item("other-app:junk", "][")
            .expect("seed foreign doc");

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.cleanup_expired().await, 2);

        let stats = store.get_stats();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.persisted_count, 1);
        // Items outside the prefix are never touched.
        assert!(mirror.get_item("other-app:junk").expect("read").is_some());
    }

    #[tokio::test]
    async fn test_quota_exhaustion_retries_after_sweep() {
        let config = CacheConfig::default().with_budget_bytes(400);
        let (store, mirror, clock) = test_store(config);

        store
            .set("old", json!("x".repeat(150)), Some(Duration::from_secs(1)))
            .await
            .expect("set");
        clock.advance(Duration::from_secs(2));

        store
            .set("new", json!("y".repeat(150)), None)
            .await
            .expect("set");
        assert!(mirror.get_item("clinic-cache:new").expect("read").is_some());
        assert!(mirror.get_item("clinic-cache:old").expect("read").is_none());
    }

    #[tokio::test]
    async fn test_quota_failure_keeps_memory_copy() {
        let config = CacheConfig::default().with_budget_bytes(400);
        let (store, mirror, _) = test_store(config);

        store
            .set("first", json!("x".repeat(150)), None)
            .await
            .expect("set");
        store
            .set("second", json!("y".repeat(150)), None)
            .await
            .expect("set must not fail when the mirror is full");

        assert!(mirror.get_item("clinic-cache:second").expect("read").is_none());
        assert_eq!(
            store.get("second").await.expect("get"),
            Some(json!("y".repeat(150)))
        );
    }

    #[tokio::test]
    async fn test_oversized_write_replaces_stale_mirror_copy() {
        let config = CacheConfig::default().with_budget_bytes(200);
        let (store, mirror, _) = test_store(config);

        store.set("k", json!("small"), None).await.expect("set");
        assert!(mirror.get_item("clinic-cache:k").expect("read").is_some());

        store
            .set("k", json!("z".repeat(500)), None)
            .await
            .expect("set");
        assert!(mirror.get_item("clinic-cache:k").expect("read").is_none());
    }

    #[tokio::test]
    async fn test_typed_helpers() {
        #[derive(Debug, PartialEq, serde::Serialize, serde::Deserialize)]
        struct Slot {
            id: String,
            minutes: u32,
        }

        let (store, _, _) = test_store(CacheConfig::default());
        let slot = Slot {
            id: "s-1".to_string(),
            minutes: 30,
        };
        store.set_as("slot", &slot, None).await.expect("set_as");
        let read: Option<Slot> = store.get_as("slot").await.expect("get_as");
        assert_eq!(read, Some(slot));
    }

    #[tokio::test]
    async fn test_clear_only_touches_prefix() {
        let (store, mirror, _) = test_store(CacheConfig::default());
        store.set("a", json!(1), None).await.expect("set");
        mirror.set_item("elsewhere", "keep").expect("seed");

        store.clear().await.expect("clear");
        assert_eq!(store.get_stats().total, 0);
        assert_eq!(store.get_stats().persisted_count, 0);
        assert_eq!(mirror.get_item("elsewhere").expect("read"), Some("keep".into()));
    }

    #[tokio::test]
    async fn test_get_stats_has_no_side_effects() {
        let (store, _, clock) = test_store(CacheConfig::default());
        store
            .set("k", json!(1), Some(Duration::from_secs(1)))
            .await
            .expect("set");
        clock.advance(Duration::from_secs(5));

        let first = store.get_stats();
        let second = store.get_stats();
        assert_eq!(first, second);
        assert_eq!(first.total, 1);
        assert_eq!(first.expired, 1);
        assert_eq!(first.valid, 0);
    }
}
