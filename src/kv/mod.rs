//! External key-value cache
//!
//! Only the bulk write is needed: up to [`BULK_WRITE_MAX_PAIRS`] key/value/
//! metadata triples per call, under [`BULK_WRITE_MAX_BYTES`] of request body.

pub mod cloudflare;
pub mod memory;

pub use cloudflare::CloudflareKv;
pub use memory::MemoryKv;

use crate::humanize::ByteSize;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const BULK_WRITE_MAX_PAIRS: usize = 10_000;
pub const BULK_WRITE_MAX_BYTES: ByteSize = ByteSize::mib(100);

#[derive(Debug, Error)]
pub enum KvError {
    #[error("bulk write of {pairs} pairs exceeds the {limit} pair limit")]
    TooManyPairs { pairs: usize, limit: usize },

    #[error("bulk write body of {bytes} bytes exceeds the {limit} limit")]
    TooLarge { bytes: usize, limit: ByteSize },

    #[error("bulk write request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("bulk write returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to encode bulk write: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("invalid KV settings: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, KvError>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KvPair {
    pub key: String,
    pub value: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiMessage {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

/// Bulk write envelope; an absent `success` reads as `false`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkWriteResponse {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub errors: Vec<ApiMessage>,
    #[serde(default)]
    pub messages: Vec<ApiMessage>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
}

impl BulkWriteResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }
}

#[async_trait]
pub trait KvStore: Send + Sync {
    /// One bulk call. Transport failures are `Err`; an API-level refusal
    /// comes back as `Ok` with `success == false` for the caller to judge.
    async fn write_bulk(&self, pairs: &[KvPair]) -> Result<BulkWriteResponse>;
}

pub(crate) fn check_pair_limit(pairs: &[KvPair]) -> Result<()> {
    if pairs.len() > BULK_WRITE_MAX_PAIRS {
        return Err(KvError::TooManyPairs {
            pairs: pairs.len(),
            limit: BULK_WRITE_MAX_PAIRS,
        });
    }
    Ok(())
}

/// Encode `pairs` as a bulk request body no larger than `limit`
pub(crate) fn encode_bulk_body(pairs: &[KvPair], limit: ByteSize) -> Result<Vec<u8>> {
    check_pair_limit(pairs)?;
    let body = serde_json::to_vec(pairs)?;
    if body.len() > limit.as_usize() {
        return Err(KvError::TooLarge {
            bytes: body.len(),
            limit,
        });
    }
    Ok(body)
}
