//! Redis-backed cache using an auto-reconnecting connection manager.

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

use captcha_common::constants::CACHE_CONNECT_TIMEOUT_SECS;
use captcha_common::{CacheError, FactoryError};

use super::CacheStore;
use crate::config::ResolvedConfig;

/// Redis cache client. Expiry is enforced by the server.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    prefix: String,
    default_ttl: Duration,
}

impl RedisCache {
    /// Connect to the first configured address and verify it with `PING`
    pub async fn connect(config: &ResolvedConfig) -> Result<Self, FactoryError> {
        let Some(addr) = config.cache_addrs.first() else {
            return Err(FactoryError::MissingEndpoints("redis".to_string()));
        };
        if config.cache_addrs.len() > 1 {
            tracing::warn!(
                addrs = ?config.cache_addrs,
                "Redis cluster mode is not supported, using the first address only"
            );
        }

        let failed = |e: redis::RedisError| FactoryError::ConnectionFailed {
            backend: "redis".to_string(),
            addr: addr.clone(),
            reason: e.to_string(),
        };

        let url = connection_url(
            addr,
            config.cache_username.as_deref(),
            config.cache_password.as_ref(),
            config.cache_db,
        );
        let client = redis::Client::open(url.as_str()).map_err(failed)?;

        // Startup connectivity is checked once; the supervisor owns retries
        let manager_config = ConnectionManagerConfig::new()
            .set_number_of_retries(0)
            .set_connection_timeout(Duration::from_secs(CACHE_CONNECT_TIMEOUT_SECS));
        let mut conn = ConnectionManager::new_with_config(client, manager_config)
            .await
            .map_err(failed)?;

        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(failed)?;

        tracing::info!(addr = %addr, db = config.cache_db, "Redis cache connected");

        Ok(Self {
            conn,
            prefix: config.cache_key_prefix.clone(),
            default_ttl: config.cache_ttl(),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

fn backend_error(e: redis::RedisError) -> CacheError {
    CacheError::Backend(e.to_string())
}

/// Build a `redis://` URL with percent-encoded credentials
fn connection_url(
    addr: &str,
    username: Option<&str>,
    password: Option<&SecretString>,
    db: u32,
) -> String {
    let auth = match (username, password) {
        (Some(user), Some(pass)) => format!(
            "{}:{}@",
            urlencoding::encode(user),
            urlencoding::encode(pass.expose_secret())
        ),
        (None, Some(pass)) => format!(":{}@", urlencoding::encode(pass.expose_secret())),
        (Some(user), None) => format!("{}@", urlencoding::encode(user)),
        (None, None) => String::new(),
    };
    format!("redis://{auth}{addr}/{db}")
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.conn.clone();
        conn.get(self.key(key)).await.map_err(backend_error)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        let ttl = ttl.unwrap_or(self.default_ttl);

        if ttl.is_zero() {
            conn.set::<_, _, ()>(self.key(key), value)
                .await
                .map_err(backend_error)
        } else {
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
            conn.pset_ex::<_, _, ()>(self.key(key), value, millis)
                .await
                .map_err(backend_error)
        }
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(self.key(key)).await.map_err(backend_error)
    }

    async fn evict_expired(&self) -> Result<usize, CacheError> {
        Ok(0)
    }

    async fn close(&self) -> Result<(), CacheError> {
        Ok(())
    }
}
