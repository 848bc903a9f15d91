//! # Captcha Service Bootstrap
//!
//! Turns environment variables and an optional config file into an
//! immutable [`ResolvedConfig`], then builds the cache backend the captcha
//! service runs on.
//!
//! ## Flow
//! ```text
//! env + CONFIG file → config::ResolvedConfig::resolve
//!                          ↓
//!                   cache::create → CacheHandle (memory | redis | etcd)
//!                          ↓
//!                   bootstrap::ServiceContext → captcha service
//! ```

pub mod bootstrap;
pub mod cache;
pub mod config;

pub use bootstrap::{ServiceContext, start};
pub use cache::{CacheHandle, CacheStore};
pub use config::{Environment, ResolvedConfig};
