//! Cache backends and the factory that selects one at startup.
//!
//! Every backend implements [`CacheStore`]. The factory wraps the chosen
//! backend in a [`CacheHandle`], a closed set of variants picked once from
//! `ResolvedConfig::cache_type`.

mod etcd_cache;
mod memory_cache;
mod redis_cache;

pub use etcd_cache::EtcdCache;
pub use memory_cache::MemoryCache;
pub use redis_cache::RedisCache;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use captcha_common::{CacheError, CacheType, FactoryError};

use crate::config::ResolvedConfig;

/// Key-value capability shared by every cache backend.
///
/// Implementations must be safe to call from many tasks at once.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Fetch a live value; expired or missing keys return `None`
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Store a value. `None` uses the configured default TTL, zero never expires.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;

    /// Remove expired entries, returning how many were dropped.
    /// Backends with server-side expiry return 0.
    async fn evict_expired(&self) -> Result<usize, CacheError>;

    /// Release background tasks and connections
    async fn close(&self) -> Result<(), CacheError>;
}

/// The process-wide cache selected at startup. Clones share one backend.
#[derive(Clone)]
pub enum CacheHandle {
    Memory(MemoryCache),
    Redis(RedisCache),
    Etcd(EtcdCache),
}

impl CacheHandle {
    pub fn cache_type(&self) -> CacheType {
        match self {
            Self::Memory(_) => CacheType::Memory,
            Self::Redis(_) => CacheType::Redis,
            Self::Etcd(_) => CacheType::Etcd,
        }
    }

    fn store(&self) -> &dyn CacheStore {
        match self {
            Self::Memory(cache) => cache,
            Self::Redis(cache) => cache,
            Self::Etcd(cache) => cache,
        }
    }
}

impl fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CacheHandle").field(&self.cache_type()).finish()
    }
}

#[async_trait]
impl CacheStore for CacheHandle {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        self.store().get(key).await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        self.store().set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.store().delete(key).await
    }

    async fn evict_expired(&self) -> Result<usize, CacheError> {
        self.store().evict_expired().await
    }

    async fn close(&self) -> Result<(), CacheError> {
        self.store().close().await
    }
}

/// Build the cache backend named by `config.cache_type`.
///
/// Network-backed variants require at least one address and must answer an
/// initial connectivity check; failures are returned, never retried here.
pub async fn create(config: &ResolvedConfig) -> Result<CacheHandle, FactoryError> {
    if config.cache_type.requires_endpoints() && config.cache_addrs.is_empty() {
        return Err(FactoryError::MissingEndpoints(config.cache_type.to_string()));
    }

    let handle = match config.cache_type {
        CacheType::Memory => {
            if !config.cache_addrs.is_empty() {
                tracing::debug!(addrs = ?config.cache_addrs, "Memory cache ignores CACHE_ADDRS");
            }
            CacheHandle::Memory(MemoryCache::new(
                config.cache_key_prefix.clone(),
                config.cache_ttl(),
                config.cleanup_interval(),
            ))
        }
        CacheType::Redis => CacheHandle::Redis(RedisCache::connect(config).await?),
        CacheType::Etcd => CacheHandle::Etcd(EtcdCache::connect(config).await?),
    };

    tracing::info!(
        cache_type = %config.cache_type,
        addrs = ?config.cache_addrs,
        ttl_secs = config.cache_ttl_secs,
        interval_secs = config.cache_cleanup_interval_secs,
        "Cache backend ready"
    );

    Ok(handle)
}
