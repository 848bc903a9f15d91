//! In-process cache with per-entry TTL and a background sweeper.
//!
//! Entries live in a sharded map: a write locks one shard, so a reader never
//! sees a half-written entry and a sweep only blocks the shard it is visiting.
//! Expired entries are hidden from `get` immediately and physically removed by
//! the sweeper (or an explicit `evict_expired`).

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};

use captcha_common::CacheError;

use super::CacheStore;

struct Entry {
    value: String,
    /// None means the entry never expires
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

struct Inner {
    entries: DashMap<String, Entry>,
    prefix: String,
    default_ttl: Duration,
    shutdown: broadcast::Sender<()>,
}

impl Inner {
    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, entry| {
            let keep = !entry.is_expired(now);
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }
}

/// In-memory cache handle. Clones share the same store.
#[derive(Clone)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl MemoryCache {
    /// Create a cache and, when `cleanup_interval` is non-zero, spawn its
    /// sweeper on the current Tokio runtime.
    pub fn new(prefix: impl Into<String>, default_ttl: Duration, cleanup_interval: Duration) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        let inner = Arc::new(Inner {
            entries: DashMap::new(),
            prefix: prefix.into(),
            default_ttl,
            shutdown,
        });

        if cleanup_interval.is_zero() {
            tracing::debug!("Memory cache sweeper disabled (interval 0)");
        } else if let Some(first_tick) = Instant::now().checked_add(cleanup_interval) {
            let receiver = inner.shutdown.subscribe();
            tokio::spawn(sweeper(Arc::downgrade(&inner), first_tick, cleanup_interval, receiver));
        } else {
            tracing::warn!(
                interval_secs = cleanup_interval.as_secs(),
                "Cleanup interval out of range, memory cache sweeper disabled"
            );
        }

        Self { inner }
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.inner.prefix, key)
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let now = Instant::now();
        Ok(self
            .inner
            .entries
            .get(&self.key(key))
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let ttl = ttl.unwrap_or(self.inner.default_ttl);
        // A deadline past the clock's range is treated like no deadline
        let expires_at = if ttl.is_zero() {
            None
        } else {
            Instant::now().checked_add(ttl)
        };
        self.inner.entries.insert(
            self.key(key),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.inner.entries.remove(&self.key(key));
        Ok(())
    }

    async fn evict_expired(&self) -> Result<usize, CacheError> {
        Ok(self.inner.sweep())
    }

    async fn close(&self) -> Result<(), CacheError> {
        // No receiver when the sweeper is disabled or already gone
        let _ = self.inner.shutdown.send(());
        Ok(())
    }
}

/// Periodic sweep loop. Exits on `close()` or once every handle is dropped.
async fn sweeper(
    inner: Weak<Inner>,
    first_tick: Instant,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    tracing::debug!(interval_secs = period.as_secs(), "Memory cache sweeper started");

    let mut ticker = tokio::time::interval_at(first_tick, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                let removed = inner.sweep();
                if removed > 0 {
                    tracing::debug!(removed = removed, "Swept expired cache entries");
                }
            }
            _ = shutdown.recv() => break,
        }
    }

    tracing::debug!("Memory cache sweeper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::assert_ok;

    const MINUTE: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_set_then_get() {
        let cache = MemoryCache::new("T:", MINUTE, Duration::ZERO);

        assert_ok!(cache.set("captcha-1", "answer", Some(MINUTE)).await);
        assert_eq!(cache.get("captcha-1").await.unwrap().as_deref(), Some("answer"));
        assert_eq!(cache.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_and_delete() {
        let cache = MemoryCache::new("T:", MINUTE, Duration::ZERO);

        cache.set("k", "v1", None).await.unwrap();
        cache.set("k", "v2", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v2"));
        assert_eq!(cache.len(), 1);

        cache.delete("k").await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), None);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_hidden_before_sweep() {
        let cache = MemoryCache::new("T:", MINUTE, Duration::ZERO);

        cache.set("k", "v", Some(Duration::from_secs(1))).await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(cache.get("k").await.unwrap(), None);
        // Still physically present until swept
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.evict_expired().await.unwrap(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_removes_expired_entries() {
        let cache = MemoryCache::new("T:", MINUTE, Duration::from_secs(1));

        cache.set("short", "v", Some(Duration::from_secs(1))).await.unwrap();
        cache.set("long", "v", Some(MINUTE)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("short").await.unwrap(), None);
        assert_eq!(cache.get("long").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_evict_expired_is_idempotent() {
        let cache = MemoryCache::new("T:", MINUTE, Duration::ZERO);
        cache.set("a", "1", None).await.unwrap();
        cache.set("b", "2", None).await.unwrap();

        assert_eq!(cache.evict_expired().await.unwrap(), 0);
        assert_eq!(cache.evict_expired().await.unwrap(), 0);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));
        assert_eq!(cache.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_ttl_never_expires() {
        let cache = MemoryCache::new("T:", Duration::ZERO, Duration::from_secs(1));
        cache.set("k", "v", None).await.unwrap();

        tokio::time::sleep(Duration::from_secs(3600)).await;

        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_prefix_is_applied() {
        let cache = MemoryCache::new("A:", MINUTE, Duration::ZERO);
        cache.set("k", "v", None).await.unwrap();

        assert!(cache.inner.entries.contains_key("A:k"));
        assert!(!cache.inner.entries.contains_key("k"));
    }

    #[tokio::test]
    async fn test_sweeper_stops_after_close() {
        let cache = MemoryCache::new("T:", MINUTE, Duration::from_secs(1));
        assert_eq!(cache.inner.shutdown.receiver_count(), 1);

        cache.close().await.unwrap();
        // Give the sweeper a chance to observe the shutdown signal
        for _ in 0..10 {
            if cache.inner.shutdown.receiver_count() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(cache.inner.shutdown.receiver_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_range_ttl_never_expires() {
        let huge = Duration::from_secs(u64::MAX);
        let cache = MemoryCache::new("T:", huge, Duration::ZERO);

        assert_ok!(cache.set("default", "v", None).await);
        assert_ok!(cache.set("explicit", "v", Some(huge)).await);
        tokio::time::advance(Duration::from_secs(3600)).await;

        assert_eq!(cache.get("default").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.get("explicit").await.unwrap().as_deref(), Some("v"));
        assert_eq!(cache.evict_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_out_of_range_interval_disables_sweeper() {
        let cache = MemoryCache::new("T:", MINUTE, Duration::from_secs(u64::MAX));
        assert_eq!(cache.inner.shutdown.receiver_count(), 0);

        cache.set("k", "v", None).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert_ok!(cache.close().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers() {
        let cache = MemoryCache::new("T:", MINUTE, Duration::from_millis(10));

        let tasks: Vec<_> = (0..8)
            .map(|worker| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    for i in 0..100 {
                        let key = format!("{worker}-{i}");
                        cache.set(&key, &key, None).await.unwrap();
                        assert_eq!(cache.get(&key).await.unwrap().as_deref(), Some(key.as_str()));
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(cache.len(), 800);
    }
}
