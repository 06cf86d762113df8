//! TTL caches with background sweep and release hooks
//!
//! Rotor keeps three short-lived caches (connections, function definitions,
//! compiled UDF wrappers). All of them are instances of [`TtlCache`], a
//! string-keyed map with per-entry expiry. Entries that own external
//! resources register a release hook which fires exactly once per eviction,
//! always outside the map shard lock.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Hook invoked when an entry leaves the cache for any reason.
pub type ReleaseHook<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

/// String-keyed cache with per-entry TTL.
///
/// Values are cloned out on access; callers treat them as shared read-only
/// state. For heavyweight values (sandbox handles) `V` is an `Arc`.
pub struct TtlCache<V> {
    name: &'static str,
    entries: DashMap<String, CacheEntry<V>>,
    release_hook: Option<ReleaseHook<V>>,
}

impl<V: Clone + Send + Sync + 'static> TtlCache<V> {
    /// Create a cache without a release hook.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            release_hook: None,
        }
    }

    /// Create a cache whose evicted entries are handed to `hook`.
    pub fn with_release_hook(name: &'static str, hook: ReleaseHook<V>) -> Self {
        Self {
            name,
            entries: DashMap::new(),
            release_hook: Some(hook),
        }
    }

    /// Look up a live entry. Expired entries are evicted on the spot and
    /// reported as absent.
    pub fn get(&self, key: &str) -> Option<V> {
        let expired = {
            match self.entries.get(key) {
                Some(entry) if entry.expires_at > Instant::now() => {
                    return Some(entry.value.clone());
                }
                Some(_) => true,
                None => false,
            }
        };
        if expired {
            // Re-check under the removal so a concurrent set is not lost.
            if let Some((k, entry)) = self
                .entries
                .remove_if(key, |_, e| e.expires_at <= Instant::now())
            {
                self.release(&k, &entry.value);
            }
        }
        None
    }

    /// Insert a value with the given TTL. A live value under the same key
    /// is released.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let old = self.entries.insert(
            key.clone(),
            CacheEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        if let Some(old) = old {
            self.release(&key, &old.value);
        }
    }

    /// Extend a live entry's expiry. Returns false when the key is absent
    /// or already expired.
    pub fn touch(&self, key: &str, ttl: Duration) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) if entry.expires_at > Instant::now() => {
                entry.expires_at = Instant::now() + ttl;
                true
            }
            _ => false,
        }
    }

    /// Remove an entry, releasing it if present. Returns the removed value.
    pub fn delete(&self, key: &str) -> Option<V> {
        let (key, entry) = self.entries.remove(key)?;
        self.release(&key, &entry.value);
        Some(entry.value)
    }

    /// Remove every expired entry, invoking release hooks outside the map
    /// locks. Returns the number of entries swept.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.expires_at <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut removed = 0;
        for key in expired {
            if let Some((key, entry)) = self
                .entries
                .remove_if(&key, |_, e| e.expires_at <= now)
            {
                self.release(&key, &entry.value);
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(cache = self.name, removed, "swept expired cache entries");
        }
        removed
    }

    /// Drop every entry, expired or not, releasing each one. Used on
    /// shutdown so sandbox handles are closed deterministically.
    pub fn evict_all(&self) -> usize {
        let keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let mut removed = 0;
        for key in keys {
            if let Some((key, entry)) = self.entries.remove(&key) {
                self.release(&key, &entry.value);
                removed += 1;
            }
        }
        removed
    }

    /// Number of entries currently held, including not-yet-swept expired
    /// ones.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn release(&self, key: &str, value: &V) {
        trace!(cache = self.name, key, "releasing cache entry");
        if let Some(hook) = &self.release_hook {
            hook(key, value);
        }
    }
}

/// Anything the background sweeper can drive.
pub trait Sweep: Send + Sync {
    /// Remove expired entries; returns how many were removed.
    fn sweep(&self) -> usize;
}

impl<V: Clone + Send + Sync + 'static> Sweep for TtlCache<V> {
    fn sweep(&self) -> usize {
        TtlCache::sweep(self)
    }
}

/// Background task sweeping a set of caches on a fixed interval.
pub struct CacheSweeper {
    shutdown: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl CacheSweeper {
    /// Spawn the sweeper. It runs until [`CacheSweeper::stop`] is called.
    pub fn spawn(caches: Vec<Arc<dyn Sweep>>, interval: Duration) -> Self {
        let shutdown = Arc::new(Notify::new());
        let stop = shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for cache in &caches {
                            cache.sweep();
                        }
                    }
                    _ = stop.notified() => break,
                }
            }
        });
        Self { shutdown, handle }
    }

    /// Stop the sweeper and wait for the task to finish.
    pub async fn stop(self) {
        self.shutdown.notify_one();
        let _ = self.handle.await;
    }
}
