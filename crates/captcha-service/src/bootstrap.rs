//! Startup orchestration: resolve configuration, then build the cache.

use std::path::Path;
use std::sync::Arc;

use captcha_common::{CacheError, StartupError};

use crate::cache::{self, CacheHandle, CacheStore};
use crate::config::{Environment, ResolvedConfig};

/// Resolve configuration and construct the cache backend, in that order.
///
/// Either both steps succeed and a usable cache is returned, or the first
/// failure is returned tagged with its stage and nothing is kept.
pub async fn start(
    base_path: Option<&Path>,
    env: &Environment,
) -> Result<(CacheHandle, ResolvedConfig), StartupError> {
    let config = ResolvedConfig::resolve(base_path, env)?;

    tracing::info!(
        service_name = %config.service_name,
        cache_type = %config.cache_type,
        config_file = ?config.config_file_path,
        "Configuration resolved"
    );

    let cache = cache::create(&config).await?;

    Ok((cache, config))
}

/// Resources handed to the captcha service once startup succeeds
#[derive(Clone, Debug)]
pub struct ServiceContext {
    /// Immutable configuration snapshot
    pub config: Arc<ResolvedConfig>,

    /// Process-wide cache
    pub cache: CacheHandle,
}

impl ServiceContext {
    /// Run [`start`] and wrap the result for sharing
    pub async fn start(base_path: Option<&Path>, env: &Environment) -> Result<Self, StartupError> {
        let (cache, config) = start(base_path, env).await?;
        Ok(Self {
            config: Arc::new(config),
            cache,
        })
    }

    /// Build the cache for an already resolved configuration
    pub async fn from_config(config: ResolvedConfig) -> Result<Self, StartupError> {
        let cache = cache::create(&config).await?;
        Ok(Self {
            config: Arc::new(config),
            cache,
        })
    }

    /// Stop background work owned by the cache
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        self.cache.close().await
    }
}
