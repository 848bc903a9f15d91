//! Core types shared across captcha service components.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ConfigError;

/// Cache backend selector.
///
/// - `Redis`: single Redis server, server-side expiry
/// - `Etcd`: etcd v3 cluster, lease-based expiry
/// - `Memory`: in-process map with a background sweeper (dev default)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheType {
    Redis,
    Etcd,
    #[default]
    Memory,
}

impl CacheType {
    pub const ALL: [CacheType; 3] = [CacheType::Redis, CacheType::Etcd, CacheType::Memory];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::Etcd => "etcd",
            Self::Memory => "memory",
        }
    }

    /// Returns true if this backend talks to remote endpoints
    pub fn requires_endpoints(&self) -> bool {
        matches!(self, Self::Redis | Self::Etcd)
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CacheType {
    type Err = ConfigError;

    /// Parses a backend name, ignoring ASCII case and surrounding whitespace
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s.trim();
        CacheType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| ConfigError::InvalidCacheType(value.to_string()))
    }
}
