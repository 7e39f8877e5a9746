use super::models::Config;
use crate::humanize::ByteSize;
use crate::kv::{BULK_WRITE_MAX_BYTES, BULK_WRITE_MAX_PAIRS};
use thiserror::Error;

/// The export scan holds one connection for its cursor while marks go
/// through another
pub const MIN_DB_CONNECTIONS: u32 = 2;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("content_store.max_workers must be positive")]
    NoWorkers,

    #[error("{field} must be positive")]
    ZeroTimeout { field: &'static str },

    #[error("content_store.stat_timeout_multiplier must be at least 1")]
    InvalidTimeoutMultiplier,

    #[error("invalid content_store.api_url '{url}': {reason}")]
    InvalidApiUrl { url: String, reason: String },

    #[error("export.max_batch_keys ({actual}) must be between 1 and {limit}")]
    BatchKeysOutOfRange { actual: usize, limit: usize },

    #[error("export.max_batch_bytes ({actual}) must be positive and below {limit}")]
    BatchBytesOutOfRange { actual: ByteSize, limit: ByteSize },

    #[error("database.max_connections ({actual}) must be at least {min}")]
    TooFewConnections { actual: u32, min: u32 },

    #[error("database.export_fetch_size must be positive")]
    ZeroFetchSize,

    #[error("config `{0}` is not set")]
    MissingSetting(&'static str),
}

/// Validate settings shared by every command
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_content_store(config)?;
    validate_database(config)?;
    validate_export(config)?;
    Ok(())
}

/// Settings only export-status needs
pub fn validate_kv(config: &Config) -> Result<(), ValidationError> {
    if config.kv.account_id.as_deref().is_none_or(str::is_empty) {
        return Err(ValidationError::MissingSetting("kv.account_id"));
    }
    if config.kv.namespace_id.as_deref().is_none_or(str::is_empty) {
        return Err(ValidationError::MissingSetting("kv.namespace_id"));
    }
    if config.kv.api_token.as_deref().is_none_or(str::is_empty) {
        return Err(ValidationError::MissingSetting("CF_API_TOKEN"));
    }
    if config.kv.timeout_secs == 0 {
        return Err(ValidationError::ZeroTimeout {
            field: "kv.timeout_secs",
        });
    }
    Ok(())
}

fn validate_content_store(config: &Config) -> Result<(), ValidationError> {
    let cs = &config.content_store;

    if cs.max_workers == 0 {
        return Err(ValidationError::NoWorkers);
    }
    if cs.timeout_secs == 0 {
        return Err(ValidationError::ZeroTimeout {
            field: "content_store.timeout_secs",
        });
    }
    if cs.stat_timeout_multiplier == 0 {
        return Err(ValidationError::InvalidTimeoutMultiplier);
    }
    if let Err(e) = reqwest::Url::parse(&cs.api_url) {
        return Err(ValidationError::InvalidApiUrl {
            url: cs.api_url.clone(),
            reason: e.to_string(),
        });
    }

    Ok(())
}

fn validate_database(config: &Config) -> Result<(), ValidationError> {
    if config.database.max_connections < MIN_DB_CONNECTIONS {
        return Err(ValidationError::TooFewConnections {
            actual: config.database.max_connections,
            min: MIN_DB_CONNECTIONS,
        });
    }
    Ok(())
}

fn validate_export(config: &Config) -> Result<(), ValidationError> {
    let export = &config.export;

    if export.max_batch_keys == 0 || export.max_batch_keys > BULK_WRITE_MAX_PAIRS {
        return Err(ValidationError::BatchKeysOutOfRange {
            actual: export.max_batch_keys,
            limit: BULK_WRITE_MAX_PAIRS,
        });
    }
    if export.max_batch_bytes.as_u64() == 0 || export.max_batch_bytes >= BULK_WRITE_MAX_BYTES {
        return Err(ValidationError::BatchBytesOutOfRange {
            actual: export.max_batch_bytes,
            limit: BULK_WRITE_MAX_BYTES,
        });
    }
    if config.database.export_fetch_size == 0 {
        return Err(ValidationError::ZeroFetchSize);
    }

    Ok(())
}
