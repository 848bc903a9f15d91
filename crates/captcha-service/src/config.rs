//! Configuration resolution for the captcha service.
//!
//! Settings come from three layers, highest precedence first:
//! 1. Environment variables (passed in as a map, never read implicitly)
//! 2. The structured config file named by `CONFIG` or the caller
//! 3. Hard-coded defaults
//!
//! Empty or whitespace-only variables are treated as unset.

use secrecy::SecretString;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use captcha_common::constants::{
    DEFAULT_CACHE_CLEANUP_INTERVAL_SECS, DEFAULT_CACHE_DB, DEFAULT_CACHE_KEY_PREFIX,
    DEFAULT_CACHE_TTL_SECS, DEFAULT_SERVICE_NAME, env_vars,
};
use captcha_common::{CacheType, ConfigError};

/// Environment variable snapshot handed to the resolver
pub type Environment = HashMap<String, String>;

/// Immutable runtime configuration, built once at startup
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Config file the settings were read from (None when defaults applied)
    pub config_file_path: Option<PathBuf>,

    /// Selected cache backend
    pub cache_type: CacheType,

    /// Ordered host:port endpoints for network-backed caches
    pub cache_addrs: Vec<String>,

    /// Default entry TTL; 0 disables expiry
    pub cache_ttl_secs: u64,

    /// In-memory sweep period; 0 disables the sweeper
    pub cache_cleanup_interval_secs: u64,

    /// Logical service identifier
    pub service_name: String,

    /// Captcha generator config, passed through untouched
    pub go_captcha_config_path: Option<PathBuf>,

    /// Prefix prepended to every cache key
    pub cache_key_prefix: String,

    pub cache_username: Option<String>,

    pub cache_password: Option<SecretString>,

    /// Redis logical database
    pub cache_db: u32,

    /// Log level requested through config (CLI and RUST_LOG still win)
    pub log_level: Option<String>,
}

/// Partial settings read from the config file
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    service_name: Option<String>,
    cache_type: Option<String>,
    cache_addrs: Option<String>,
    cache_ttl: Option<u64>,
    cache_cleanup_interval: Option<u64>,
    cache_key_prefix: Option<String>,
    cache_username: Option<String>,
    cache_password: Option<String>,
    cache_db: Option<u32>,
    log_level: Option<String>,
    go_captcha_config: Option<PathBuf>,
}

impl ResolvedConfig {
    /// Resolve configuration from an optional base config path and an
    /// environment snapshot. `CONFIG` in the environment overrides `base_path`.
    pub fn resolve(base_path: Option<&Path>, env: &Environment) -> Result<Self, ConfigError> {
        let config_file_path = env_var_or_none(env, env_vars::CONFIG)
            .map(PathBuf::from)
            .or_else(|| base_path.map(Path::to_path_buf));

        let file = match &config_file_path {
            Some(path) => {
                let file = load_file(path)?;
                tracing::debug!(path = %path.display(), "Config file loaded");
                file
            }
            None => {
                tracing::debug!("No config file given, using defaults");
                FileConfig::default()
            }
        };

        let cache_type = match env_var_or_none(env, env_vars::CACHE_TYPE)
            .or_else(|| non_empty(file.cache_type))
        {
            Some(raw) => raw.parse::<CacheType>()?,
            None => CacheType::default(),
        };

        let cache_addrs = match env_var_or_none(env, env_vars::CACHE_ADDRS)
            .or_else(|| non_empty(file.cache_addrs))
        {
            Some(raw) => parse_addrs(&raw)?,
            None => Vec::new(),
        };

        let cache_ttl_secs = match env_var_or_none(env, env_vars::CACHE_TTL) {
            Some(raw) => parse_secs(env_vars::CACHE_TTL, &raw)?,
            None => file.cache_ttl.unwrap_or(DEFAULT_CACHE_TTL_SECS),
        };

        let cache_cleanup_interval_secs =
            match env_var_or_none(env, env_vars::CACHE_CLEANUP_INTERVAL) {
                Some(raw) => parse_secs(env_vars::CACHE_CLEANUP_INTERVAL, &raw)?,
                None => file
                    .cache_cleanup_interval
                    .unwrap_or(DEFAULT_CACHE_CLEANUP_INTERVAL_SECS),
            };

        let cache_db = match env_var_or_none(env, env_vars::CACHE_DB) {
            Some(raw) => raw.parse::<u32>().map_err(|_| ConfigError::InvalidValue {
                var: env_vars::CACHE_DB.to_string(),
                message: "must be a non-negative integer".to_string(),
            })?,
            None => file.cache_db.unwrap_or(DEFAULT_CACHE_DB),
        };

        Ok(Self {
            config_file_path,
            cache_type,
            cache_addrs,
            cache_ttl_secs,
            cache_cleanup_interval_secs,
            service_name: env_var_or_none(env, env_vars::SERVICE_NAME)
                .or_else(|| non_empty(file.service_name))
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_string()),
            go_captcha_config_path: env_var_or_none(env, env_vars::GO_CAPTCHA_CONFIG)
                .map(PathBuf::from)
                .or(file.go_captcha_config),
            cache_key_prefix: env_var_or_none(env, env_vars::CACHE_KEY_PREFIX)
                .or_else(|| non_empty(file.cache_key_prefix))
                .unwrap_or_else(|| DEFAULT_CACHE_KEY_PREFIX.to_string()),
            cache_username: env_var_or_none(env, env_vars::CACHE_USERNAME)
                .or_else(|| non_empty(file.cache_username)),
            cache_password: env_var_or_none(env, env_vars::CACHE_PASSWORD)
                .or_else(|| non_empty(file.cache_password))
                .map(|p| SecretString::new(p.into())),
            cache_db,
            log_level: env_var_or_none(env, env_vars::LOG_LEVEL)
                .or_else(|| non_empty(file.log_level)),
        })
    }

    /// Default entry TTL
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    /// In-memory sweep period
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cache_cleanup_interval_secs)
    }
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            config_file_path: None,
            cache_type: CacheType::default(),
            cache_addrs: Vec::new(),
            cache_ttl_secs: DEFAULT_CACHE_TTL_SECS,
            cache_cleanup_interval_secs: DEFAULT_CACHE_CLEANUP_INTERVAL_SECS,
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            go_captcha_config_path: None,
            cache_key_prefix: DEFAULT_CACHE_KEY_PREFIX.to_string(),
            cache_username: None,
            cache_password: None,
            cache_db: DEFAULT_CACHE_DB,
            log_level: None,
        }
    }
}

/// Snapshot the process environment for [`ResolvedConfig::resolve`]
pub fn from_process_env() -> Environment {
    std::env::vars().collect()
}

fn load_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let unreadable = |e: config::ConfigError| ConfigError::FileUnreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .map_err(unreadable)?
        .try_deserialize()
        .map_err(unreadable)
}

fn env_var_or_none(env: &Environment, key: &str) -> Option<String> {
    env.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_secs(var: &str, raw: &str) -> Result<u64, ConfigError> {
    raw.parse::<u64>().map_err(|_| ConfigError::InvalidValue {
        var: var.to_string(),
        message: format!("{raw:?} is not a non-negative number of seconds"),
    })
}

/// Split a comma-separated endpoint list, dropping blanks
fn parse_addrs(raw: &str) -> Result<Vec<String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(|a| {
            if is_valid_addr(a) {
                Ok(a.to_string())
            } else {
                Err(ConfigError::InvalidAddress(a.to_string()))
            }
        })
        .collect()
}

fn is_valid_addr(addr: &str) -> bool {
    let Some((host, port)) = addr.rsplit_once(':') else {
        return false;
    };
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '[' | ']' | ':'));
    host_ok && port.parse::<u16>().is_ok_and(|p| p > 0)
}
