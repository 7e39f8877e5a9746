//! Configuration management for dagcargo
//!
//! Settings are layered, lowest priority first:
//! 1. Default values (embedded in structs)
//! 2. TOML configuration file
//! 3. Environment variables
//!
//! # Environment Variables
//!
//! Any setting can be overridden with `DAGCARGO__<section>__<key>`:
//! - `DAGCARGO__CONTENT_STORE__MAX_WORKERS=64`
//! - `DAGCARGO__DATABASE__URL=postgres://cargo@db/cargo`
//! - `DAGCARGO__EXPORT__MAX_BATCH_BYTES=50MiB`
//!
//! Secrets are read from `CF_API_TOKEN` and `PROM_PUSH_PASSWORD` only.
//!
//! # Configuration File
//!
//! The file defaults to `dagcargo.toml` in the working directory and can be
//! moved with `DAGCARGO_CONFIG` or `--config`.

mod models;
mod sources;
mod validation;

pub use crate::humanize::ByteSize;
pub use models::{
    Config, ContentStoreConfig, DatabaseConfig, ExportConfig, KvConfig, LockConfig,
    MetricsConfig, PinConfig,
};
pub use sources::default_path;
pub use validation::{ValidationError, validate_kv};

use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("configuration validation failed: {0}")]
    ValidationError(#[from] ValidationError),
}

impl Config {
    /// Load from `DAGCARGO_CONFIG` (or `dagcargo.toml`) plus environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path(&default_path())
    }

    /// Load from a specific file plus environment
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let config = sources::load(path)?;
        validation::validate(&config)?;
        Ok(config)
    }
}
