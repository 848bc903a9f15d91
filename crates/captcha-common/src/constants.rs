//! Shared constants for the captcha service.

/// Default logical service name
pub const DEFAULT_SERVICE_NAME: &str = "captcha-service";

/// Default entry time-to-live (1 minute)
pub const DEFAULT_CACHE_TTL_SECS: u64 = 60;

/// Default in-memory sweep period
pub const DEFAULT_CACHE_CLEANUP_INTERVAL_SECS: u64 = 10;

/// Default prefix prepended to every cache key
pub const DEFAULT_CACHE_KEY_PREFIX: &str = "GO_CAPTCHA_DATA:";

/// Default Redis logical database
pub const DEFAULT_CACHE_DB: u32 = 0;

/// Connect timeout for network-backed caches (seconds)
pub const CACHE_CONNECT_TIMEOUT_SECS: u64 = 5;

/// Environment variable names recognized by the config resolver
pub mod env_vars {
    /// Path to the structured config file
    pub const CONFIG: &str = "CONFIG";

    /// Backend selector: redis, etcd, memory
    pub const CACHE_TYPE: &str = "CACHE_TYPE";

    /// Default entry TTL in seconds
    pub const CACHE_TTL: &str = "CACHE_TTL";

    /// In-memory sweep period in seconds
    pub const CACHE_CLEANUP_INTERVAL: &str = "CACHE_CLEANUP_INTERVAL";

    /// Comma-separated host:port list
    pub const CACHE_ADDRS: &str = "CACHE_ADDRS";

    /// Key prefix for every stored entry
    pub const CACHE_KEY_PREFIX: &str = "CACHE_KEY_PREFIX";

    /// Backend username
    pub const CACHE_USERNAME: &str = "CACHE_USERNAME";

    /// Backend password
    pub const CACHE_PASSWORD: &str = "CACHE_PASSWORD";

    /// Redis logical database number
    pub const CACHE_DB: &str = "CACHE_DB";

    /// Logical service identifier
    pub const SERVICE_NAME: &str = "SERVICE_NAME";

    /// Captcha generator config path (passed through)
    pub const GO_CAPTCHA_CONFIG: &str = "GO_CAPTCHA_CONFIG";

    /// Log level (trace, debug, info, warn, error)
    pub const LOG_LEVEL: &str = "LOG_LEVEL";
}
