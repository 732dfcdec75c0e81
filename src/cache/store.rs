//! Keyed registry of query entries with deferred eviction
//!
//! The registry is the single owner of every [`QueryEntry`]. Entries without
//! subscribers, either new or after the last one left, are removed once their
//! `cache_time` elapses, unless a subscriber arrives or the key is reinserted
//! first.

use crate::cache::config::QueryOptions;
use crate::cache::entry::{QueryEntry, QueryFn};
use crate::cache::invalidation::{RemovalEvent, RemovalReason};
use crate::cache::types::CacheStats;
use crate::key::{match_key, QueryKey, SerializedKey};
use crate::logger::{QueryLogger, TracingLogger};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Registry of query entries keyed by their serialized key
///
/// Cloning is cheap; clones share the same entries.
#[derive(Clone)]
pub struct CacheRegistry {
    shared: Arc<RegistryShared>,
}

/// State shared between the registry handle, its entries and eviction tasks
pub(crate) struct RegistryShared {
    entries: RwLock<HashMap<SerializedKey, Arc<QueryEntry>>>,
    evictions: Mutex<HashMap<SerializedKey, (u64, JoinHandle<()>)>>,
    next_eviction: AtomicU64,
    stats: Mutex<CacheStats>,
    max_entries_warning: Option<usize>,
    logger: Arc<dyn QueryLogger>,
}

impl RegistryShared {
    fn entries(&self) -> RwLockReadGuard<'_, HashMap<SerializedKey, Arc<QueryEntry>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, HashMap<SerializedKey, Arc<QueryEntry>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn evictions(&self) -> MutexGuard<'_, HashMap<SerializedKey, (u64, JoinHandle<()>)>> {
        self.evictions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn stats(&self) -> MutexGuard<'_, CacheStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn record_hit(&self) {
        self.stats().hits += 1;
    }

    pub(crate) fn record_miss(&self) {
        self.stats().misses += 1;
    }

    /// Remove `key` after `delay` unless cancelled or superseded first
    pub(crate) fn schedule_eviction(self: &Arc<Self>, key: SerializedKey, delay: Duration) {
        if delay == Duration::MAX {
            debug!(key = %key, "Entry retained indefinitely, no eviction scheduled");
            return;
        }

        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                self.logger.warn(
                    "No async runtime available, eviction not scheduled",
                    &json!({ "key": key.as_str() }),
                );
                return;
            }
        };

        let id = self.next_eviction.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::downgrade(self);
        let task_key = key.clone();
        let task = handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = shared.upgrade() {
                shared.evict(&task_key, id);
            }
        });

        debug!(key = %key, ?delay, "Scheduled eviction");
        if let Some((_, previous)) = self.evictions().insert(key, (id, task)) {
            previous.abort();
        }
    }

    /// Whether `entry` is the one stored under `key`
    pub(crate) fn is_current(&self, key: &SerializedKey, entry: &QueryEntry) -> bool {
        self.entries()
            .get(key)
            .map_or(false, |stored| std::ptr::eq(Arc::as_ptr(stored), entry))
    }

    pub(crate) fn cancel_eviction(&self, key: &SerializedKey) {
        if let Some((_, task)) = self.evictions().remove(key) {
            debug!(key = %key, "Cancelled pending eviction");
            task.abort();
        }
    }

    fn evict(&self, key: &SerializedKey, id: u64) {
        {
            let mut evictions = self.evictions();
            match evictions.get(key) {
                Some((current, _)) if *current == id => {
                    evictions.remove(key);
                }
                _ => return,
            }
        }

        let removed = {
            let mut entries = self.entries_mut();
            match entries.get(key) {
                Some(entry) if entry.subscriber_count() == 0 => entries.remove(key),
                _ => None,
            }
        };

        if let Some(entry) = removed {
            entry.stop_polling();
            let mut stats = self.stats();
            stats.evictions += 1;
            stats.entries = stats.entries.saturating_sub(1);
            debug!(key = %key, reason = %RemovalReason::Evicted, "Evicted query entry");
        }
    }

    fn warn_if_oversized(&self, len: usize) {
        if let Some(limit) = self.max_entries_warning {
            if len > limit {
                self.logger.warn(
                    "Query cache exceeds its soft size limit",
                    &json!({ "entries": len, "limit": limit }),
                );
            }
        }
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new(Arc::new(TracingLogger), None)
    }
}

impl CacheRegistry {
    /// Create an empty registry
    pub fn new(logger: Arc<dyn QueryLogger>, max_entries_warning: Option<usize>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                entries: RwLock::new(HashMap::new()),
                evictions: Mutex::new(HashMap::new()),
                next_eviction: AtomicU64::new(0),
                stats: Mutex::new(CacheStats::default()),
                max_entries_warning,
                logger,
            }),
        }
    }

    /// Create an entry bound to this registry without inserting it
    pub fn create_entry(
        &self,
        key: SerializedKey,
        query_fn: Option<QueryFn>,
        options: QueryOptions,
    ) -> Arc<QueryEntry> {
        QueryEntry::new(
            key,
            query_fn,
            options,
            self.shared.logger.clone(),
            Arc::downgrade(&self.shared),
        )
    }

    /// Look up an entry
    pub fn get(&self, key: &SerializedKey) -> Option<Arc<QueryEntry>> {
        self.shared.entries().get(key).cloned()
    }

    /// Insert an entry, cancelling any pending eviction for its key
    pub fn set(&self, key: SerializedKey, entry: Arc<QueryEntry>) {
        self.shared.cancel_eviction(&key);
        let (replaced, len) = {
            let mut entries = self.shared.entries_mut();
            let replaced = entries.insert(key.clone(), entry.clone());
            (replaced, entries.len())
        };

        if let Some(previous) = replaced {
            if !Arc::ptr_eq(&previous, &entry) {
                previous.stop_polling();
            }
        }

        self.shared.stats().entries = len;
        self.shared.warn_if_oversized(len);
        debug!(key = %key, "Stored query entry");
    }

    /// Return the entry for `key`, creating it with `create` if absent
    ///
    /// The boolean is true when the entry was created by this call. A new
    /// entry starts its eviction timer right away; subscribing stops it.
    pub fn get_or_insert_with<F>(&self, key: &SerializedKey, create: F) -> (Arc<QueryEntry>, bool)
    where
        F: FnOnce() -> Arc<QueryEntry>,
    {
        if let Some(entry) = self.get(key) {
            return (entry, false);
        }

        let (entry, created, len) = {
            let mut entries = self.shared.entries_mut();
            match entries.get(key) {
                Some(existing) => (existing.clone(), false, entries.len()),
                None => {
                    let entry = create();
                    entries.insert(key.clone(), entry.clone());
                    (entry, true, entries.len())
                }
            }
        };

        if created {
            self.shared.cancel_eviction(key);
            self.shared.stats().entries = len;
            self.shared.warn_if_oversized(len);
            debug!(key = %key, "Created query entry");
            if entry.subscriber_count() == 0 {
                self.shared.schedule_eviction(key.clone(), entry.options().cache_time);
            }
        }
        (entry, created)
    }

    /// Remove an entry and any pending eviction for it
    pub fn remove(&self, key: &SerializedKey) -> Option<Arc<QueryEntry>> {
        self.shared.cancel_eviction(key);
        let (removed, len) = {
            let mut entries = self.shared.entries_mut();
            let removed = entries.remove(key);
            (removed, entries.len())
        };

        if let Some(entry) = &removed {
            entry.stop_polling();
            let mut stats = self.shared.stats();
            stats.removals += 1;
            stats.entries = len;
            debug!(key = %key, reason = %RemovalReason::Removed, "Removed query entry");
        }
        removed
    }

    /// Snapshot of all key/entry pairs
    pub fn entries(&self) -> Vec<(SerializedKey, Arc<QueryEntry>)> {
        self.shared
            .entries()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Snapshot of entries whose key matches `partial` (all when `None`)
    pub fn find(&self, partial: Option<&QueryKey>) -> Vec<(SerializedKey, Arc<QueryEntry>)> {
        self.shared
            .entries()
            .iter()
            .filter(|(key, _)| partial.map_or(true, |p| match_key(key, p)))
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect()
    }

    /// Remove every entry whose key matches `partial` (all when `None`)
    pub fn remove_matching(&self, partial: Option<&QueryKey>) -> RemovalEvent {
        let keys: Vec<SerializedKey> = self.find(partial).into_iter().map(|(key, _)| key).collect();
        let removed: Vec<SerializedKey> = keys
            .into_iter()
            .filter(|key| self.remove(key).is_some())
            .collect();
        RemovalEvent::new(RemovalReason::Removed, removed)
    }

    /// Remove all entries and cancel all pending evictions
    pub fn clear(&self) -> RemovalEvent {
        for (_, (_, task)) in self.shared.evictions().drain() {
            task.abort();
        }

        let drained: Vec<(SerializedKey, Arc<QueryEntry>)> = self.shared.entries_mut().drain().collect();
        let mut keys = Vec::with_capacity(drained.len());
        for (key, entry) in drained {
            entry.stop_polling();
            keys.push(key);
        }

        {
            let mut stats = self.shared.stats();
            stats.removals += keys.len() as u64;
            stats.entries = 0;
        }

        info!("Cleared {} entries from query cache", keys.len());
        RemovalEvent::new(RemovalReason::Cleared, keys)
    }

    /// Schedule removal of `key` after `delay`
    pub fn schedule_eviction(&self, key: SerializedKey, delay: Duration) {
        self.shared.schedule_eviction(key, delay);
    }

    /// Cancel a pending eviction
    pub fn cancel_eviction(&self, key: &SerializedKey) {
        self.shared.cancel_eviction(key);
    }

    /// Whether an eviction is pending for `key`
    pub fn has_pending_eviction(&self, key: &SerializedKey) -> bool {
        self.shared.evictions().contains_key(key)
    }

    pub fn contains_key(&self, key: &SerializedKey) -> bool {
        self.shared.entries().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shared.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.entries().is_empty()
    }

    pub(crate) fn record_invalidations(&self, count: usize) {
        self.shared.stats().invalidations += count as u64;
    }

    /// Get cache statistics
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.shared.stats().clone();
        stats.entries = self.len();
        stats
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("entries", &self.len())
            .field("pending_evictions", &self.shared.evictions().len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::query_fn;
    use crate::logger::testing::RecordingLogger;
    use crate::query_key;

    fn key(name: &str) -> SerializedKey {
        query_key![name].serialize()
    }

    fn registry() -> CacheRegistry {
        CacheRegistry::default()
    }

    fn short_lived() -> QueryOptions {
        QueryOptions::builder()
            .retry(0)
            .cache_time(Duration::from_millis(50))
            .build()
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let registry = registry();
        let entry = registry.create_entry(key("todos"), None, QueryOptions::default());
        registry.set(key("todos"), entry.clone());

        let found = registry.get(&key("todos")).unwrap();
        assert!(Arc::ptr_eq(&found, &entry));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&key("posts")).is_none());
    }

    #[tokio::test]
    async fn test_get_or_insert_with_creates_once() {
        let registry = registry();
        let (first, created) = registry.get_or_insert_with(&key("a"), || {
            registry.create_entry(key("a"), None, QueryOptions::default())
        });
        assert!(created);

        let (second, created) = registry.get_or_insert_with(&key("a"), || unreachable!());
        assert!(!created);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_unsubscribed_entry_is_evicted() {
        let registry = registry();
        let entry = registry.create_entry(key("todos"), None, short_lived());
        registry.set(key("todos"), entry.clone());

        let id = entry.subscribe(|| {});
        assert!(entry.unsubscribe(id));
        assert!(registry.has_pending_eviction(&key("todos")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.contains_key(&key("todos")));
        assert_eq!(registry.stats().evictions, 1);
    }

    #[tokio::test]
    async fn test_new_entry_without_subscribers_is_evicted() {
        let registry = registry();
        let (entry, _) = registry.get_or_insert_with(&key("draft"), || {
            registry.create_entry(key("draft"), None, short_lived())
        });
        assert!(registry.has_pending_eviction(&key("draft")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.contains_key(&key("draft")));
        assert_eq!(entry.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribing_new_entry_stops_eviction() {
        let registry = registry();
        let (entry, _) = registry.get_or_insert_with(&key("live"), || {
            registry.create_entry(key("live"), None, short_lived())
        });
        entry.subscribe(|| {});
        assert!(!registry.has_pending_eviction(&key("live")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.contains_key(&key("live")));
    }

    #[tokio::test]
    async fn test_orphaned_entry_leaves_replacement_eviction_alone() {
        let registry = registry();
        let (orphan, _) = registry.get_or_insert_with(&key("todos"), || {
            registry.create_entry(key("todos"), None, short_lived())
        });
        registry.remove(&key("todos"));

        let (replacement, created) = registry.get_or_insert_with(&key("todos"), || {
            registry.create_entry(key("todos"), None, short_lived())
        });
        assert!(created);
        assert!(!Arc::ptr_eq(&orphan, &replacement));
        assert!(registry.has_pending_eviction(&key("todos")));

        let id = orphan.subscribe(|| {});
        assert!(registry.has_pending_eviction(&key("todos")));
        orphan.unsubscribe(id);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!registry.contains_key(&key("todos")));
    }

    #[tokio::test]
    async fn test_resubscribe_cancels_eviction() {
        let registry = registry();
        let entry = registry.create_entry(key("todos"), None, short_lived());
        registry.set(key("todos"), entry.clone());

        let id = entry.subscribe(|| {});
        entry.unsubscribe(id);
        tokio::time::sleep(Duration::from_millis(10)).await;
        entry.subscribe(|| {});
        assert!(!registry.has_pending_eviction(&key("todos")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(registry.contains_key(&key("todos")));
    }

    #[tokio::test]
    async fn test_reinsert_cancels_eviction() {
        let registry = registry();
        let entry = registry.create_entry(key("todos"), None, short_lived());
        registry.set(key("todos"), entry.clone());

        registry.schedule_eviction(key("todos"), Duration::from_millis(30));
        registry.set(key("todos"), entry.clone());
        assert!(!registry.has_pending_eviction(&key("todos")));

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(registry.contains_key(&key("todos")));
    }

    #[tokio::test]
    async fn test_infinite_cache_time_never_evicts() {
        let registry = registry();
        let options = QueryOptions::builder().cache_time(Duration::MAX).build();
        let entry = registry.create_entry(key("forever"), None, options);
        registry.set(key("forever"), entry.clone());

        let id = entry.subscribe(|| {});
        entry.unsubscribe(id);
        assert!(!registry.has_pending_eviction(&key("forever")));
    }

    #[tokio::test]
    async fn test_find_by_prefix() {
        let registry = registry();
        for k in [
            query_key!["todos", {"page": 1}],
            query_key!["todos", {"page": 2}],
            query_key!["posts"],
        ] {
            let serialized = k.serialize();
            let entry = registry.create_entry(serialized.clone(), None, QueryOptions::default());
            registry.set(serialized, entry);
        }

        assert_eq!(registry.find(Some(&query_key!["todos"])).len(), 2);
        assert_eq!(registry.find(Some(&query_key!["posts"])).len(), 1);
        assert_eq!(registry.find(None).len(), 3);
    }

    #[tokio::test]
    async fn test_remove_matching_and_clear() {
        let registry = registry();
        for name in ["a", "b", "c"] {
            let entry = registry.create_entry(key(name), None, QueryOptions::default());
            registry.set(key(name), entry);
        }

        let event = registry.remove_matching(Some(&query_key!["a"]));
        assert_eq!(event.keys, vec![key("a")]);
        assert_eq!(registry.len(), 2);

        registry.schedule_eviction(key("b"), Duration::from_secs(60));
        let event = registry.clear();
        assert_eq!(event.len(), 2);
        assert_eq!(event.reason, RemovalReason::Cleared);
        assert!(registry.is_empty());
        assert!(!registry.has_pending_eviction(&key("b")));
        assert_eq!(registry.stats().removals, 3);
    }

    #[tokio::test]
    async fn test_soft_limit_only_warns() {
        let logger = Arc::new(RecordingLogger::default());
        let registry = CacheRegistry::new(logger.clone(), Some(1));

        for name in ["a", "b"] {
            let entry = registry.create_entry(key(name), None, QueryOptions::default());
            registry.set(key(name), entry);
        }

        assert_eq!(registry.len(), 2);
        assert_eq!(logger.warnings.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stats_track_hits_and_misses() {
        let registry = registry();
        let options = QueryOptions::builder()
            .retry(0)
            .stale_time(Duration::from_secs(60))
            .build();
        let entry = registry.create_entry(
            key("stats"),
            Some(query_fn(|_token| async { Ok(1) })),
            options,
        );
        registry.set(key("stats"), entry.clone());

        entry.fetch().await.unwrap();
        entry.fetch().await.unwrap();

        let stats = registry.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }
}
