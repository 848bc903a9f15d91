//! # Captcha Common
//!
//! Shared types, constants, and error types used by the captcha service
//! bootstrap and the components it hands its cache to.
//!
//! ## Modules
//! - `types` - Core data structures (CacheType)
//! - `error` - Startup and steady-state error taxonomy
//! - `constants` - Environment variable names and defaults

pub mod constants;
pub mod error;
pub mod types;

pub use error::{CacheError, ConfigError, FactoryError, StartupError};
pub use types::*;
