//! Generic time-to-live cache
//!
//! Reads evict lazily: an expired entry is removed by the `get` that finds
//! it. A sweeper task calls [`TtlCache::invalidate_expired`] on an interval
//! so keys that are never read again do not pile up.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

/// Smallest TTL accepted, keeps `expires_at > created_at`
const MIN_TTL: Duration = Duration::from_millis(1);

/// A cached value with its timestamps
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.expires_at
    }
}

/// Hit/miss counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

struct Inner<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    stats: CacheStats,
}

/// Key/value store where every entry expires
pub struct TtlCache<K, V> {
    inner: Mutex<Inner<K, V>>,
    snapshot_tx: watch::Sender<Arc<HashMap<K, V>>>,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        let (snapshot_tx, _) = watch::channel(Arc::new(HashMap::new()));
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                stats: CacheStats::default(),
            }),
            snapshot_tx,
        }
    }

    /// Store `value` until `now + ttl`, replacing any existing entry
    pub fn set(&self, key: K, value: V, ttl: Duration) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        inner.entries.insert(
            key,
            CacheEntry {
                value,
                created_at: now,
                expires_at: now + ttl.max(MIN_TTL),
            },
        );
        self.publish(&inner);
    }

    /// Live value for `key`. Evicts the entry if it has expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let expired = match inner.entries.get(key) {
            None => {
                inner.stats.misses += 1;
                return None;
            }
            Some(entry) => entry.is_expired(now),
        };

        if expired {
            inner.entries.remove(key);
            inner.stats.misses += 1;
            inner.stats.evictions += 1;
            self.publish(&inner);
            return None;
        }

        inner.stats.hits += 1;
        inner.entries.get(key).map(|entry| entry.value.clone())
    }

    pub fn has(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Entry with timestamps, without touching stats or evicting
    pub fn entry(&self, key: &K) -> Option<CacheEntry<V>> {
        let now = Instant::now();
        self.inner
            .lock()
            .entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .cloned()
    }

    /// Replace the value in place under a fresh TTL.
    ///
    /// `update` sees the current live value, if any. The read and the write
    /// happen under one lock so concurrent writers cannot interleave.
    /// Returning `None` leaves the key absent.
    pub fn upsert<F>(&self, key: K, ttl: Duration, update: F)
    where
        F: FnOnce(Option<V>) -> Option<V>,
    {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let current = inner
            .entries
            .remove(&key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value);
        if let Some(value) = update(current) {
            inner.entries.insert(
                key,
                CacheEntry {
                    value,
                    created_at: now,
                    expires_at: now + ttl.max(MIN_TTL),
                },
            );
        }
        self.publish(&inner);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock();
        let removed = inner.entries.remove(key).map(|entry| entry.value);
        if removed.is_some() {
            self.publish(&inner);
        }
        removed
    }

    /// Drop every entry whose expiry is in the past. Returns how many went.
    pub fn invalidate_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| entry.expires_at >= now);
        let removed = before - inner.entries.len();

        if removed > 0 {
            inner.stats.evictions += removed as u64;
            self.publish(&inner);
        }
        removed
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        self.publish(&inner);
    }

    /// Number of stored entries, expired ones included until swept
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.lock().stats
    }

    /// Observe the key/value snapshot published after every mutation
    pub fn watch(&self) -> watch::Receiver<Arc<HashMap<K, V>>> {
        self.snapshot_tx.subscribe()
    }

    fn publish(&self, inner: &Inner<K, V>) {
        let snapshot: HashMap<K, V> = inner
            .entries
            .iter()
            .map(|(k, entry)| (k.clone(), entry.value.clone()))
            .collect();
        self.snapshot_tx.send_replace(Arc::new(snapshot));
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Run `invalidate_expired` every `period` until the cache is dropped or
    /// the returned handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                timer.tick().await;
                let Some(cache) = cache.upgrade() else {
                    break;
                };
                let removed = cache.invalidate_expired();
                if removed > 0 {
                    debug!(removed, "swept expired cache entries");
                }
            }
        })
    }
}

impl<K, V> Default for TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test(start_paused = true)]
    async fn test_get_returns_value_before_expiry() {
        let cache = TtlCache::new();
        cache.set("web", 1, TTL);

        assert_eq!(cache.get(&"web"), Some(1));
        assert!(cache.has(&"web"));

        advance(TTL).await;
        // expires_at == now is still live
        assert_eq!(cache.get(&"web"), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_evicts_after_expiry() {
        let cache = TtlCache::new();
        cache.set("web", 1, TTL);

        advance(TTL + Duration::from_millis(1)).await;
        assert_eq!(cache.get(&"web"), None);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.stats().evictions, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_overwrites_and_refreshes_ttl() {
        let cache = TtlCache::new();
        cache.set("db", "old", TTL);
        advance(Duration::from_secs(20)).await;
        cache.set("db", "new", TTL);
        advance(Duration::from_secs(20)).await;

        assert_eq!(cache.get(&"db"), Some("new"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidate_expired_sweeps_unread_keys() {
        let cache = TtlCache::new();
        cache.set("short", 1, Duration::from_secs(1));
        cache.set("long", 2, Duration::from_secs(60));

        advance(Duration::from_secs(2)).await;
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.invalidate_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"long"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_is_clamped() {
        let cache = TtlCache::new();
        cache.set("k", 1, Duration::ZERO);

        let entry = cache.entry(&"k").unwrap();
        assert!(entry.expires_at > entry.created_at);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_sees_every_mutation() {
        let cache = TtlCache::new();
        let rx = cache.watch();

        cache.set("a", 1, TTL);
        assert_eq!(rx.borrow().get("a"), Some(&1));

        cache.set("b", 2, TTL);
        assert_eq!(rx.borrow().len(), 2);

        cache.remove(&"a");
        assert!(rx.borrow().get("a").is_none());

        cache.clear();
        assert!(rx.borrow().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_sees_current_value() {
        let cache = TtlCache::new();
        cache.upsert("count", TTL, |current: Option<u32>| Some(current.unwrap_or(0) + 1));
        cache.upsert("count", TTL, |current| Some(current.unwrap_or(0) + 1));
        assert_eq!(cache.get(&"count"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_upsert_can_decline_to_write() {
        let cache = TtlCache::new();
        cache.upsert("count", TTL, |_: Option<u32>| None);
        assert!(!cache.has(&"count"));

        cache.set("count", 7, TTL);
        cache.upsert("count", TTL, |_| None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let cache = Arc::new(TtlCache::new());
        cache.set("stale", 1, Duration::from_secs(5));
        let handle = cache.spawn_sweeper(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(cache.len(), 0);

        handle.abort();
    }
}
