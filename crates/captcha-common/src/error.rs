//! Error taxonomy for the captcha service bootstrap.
//!
//! Startup errors (`ConfigError`, `FactoryError`, wrapped in `StartupError`)
//! are fatal and end the process. `CacheError` is the steady-state failure
//! returned by cache operations once the service is running.

use std::path::PathBuf;
use thiserror::Error;

/// Configuration resolution errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// CACHE_TYPE (or the file's cache_type) names an unsupported backend
    #[error("Invalid cache type: {0:?} (expected redis, etcd, or memory)")]
    InvalidCacheType(String),

    /// Config file was given but could not be read or parsed
    #[error("Config file {path} unreadable: {reason}")]
    FileUnreadable { path: PathBuf, reason: String },

    /// Option value could not be parsed
    #[error("Invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    /// Cache address is not host:port
    #[error("Invalid cache address: {0:?} (expected host:port)")]
    InvalidAddress(String),
}

/// Cache backend construction errors
#[derive(Debug, Error)]
pub enum FactoryError {
    /// Network-backed cache selected without any endpoint
    #[error("Cache type {0} requires at least one address in CACHE_ADDRS")]
    MissingEndpoints(String),

    /// Initial connectivity check failed
    #[error("Failed to connect to {backend} at {addr}: {reason}")]
    ConnectionFailed {
        backend: String,
        addr: String,
        reason: String,
    },
}

/// Steady-state cache operation errors
#[derive(Debug, Error)]
pub enum CacheError {
    /// Backend I/O or protocol error
    #[error("Cache backend error: {0}")]
    Backend(String),

    /// Response payload could not be decoded
    #[error("Cache serialization error: {0}")]
    Serialization(String),
}

impl CacheError {
    /// Returns true if this error should be retried
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Backend(_))
    }
}

/// Fatal startup error, tagged with the stage that failed
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Cache initialization error: {0}")]
    Factory(#[from] FactoryError),
}

impl StartupError {
    /// Name of the startup stage that produced this error
    pub fn origin(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Factory(_) => "cache",
        }
    }

    /// Startup errors are never retried in-process; the supervisor restarts us
    pub fn is_retryable(&self) -> bool {
        false
    }
}
