//! Relational store access
//!
//! Two narrow traits, one per pipeline:
//! - [`DagStore`]: working set for pin-dags and the size/refs write
//! - [`ExportStore`]: rollup refresh, the key-ordered scan, export marks
//!
//! [`PgStore`] implements both against the `cargo` schema;
//! [`MemoryStore`] mirrors the same filters in process.

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, SeedDag};
pub use postgres::PgStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cid::Cid;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store holds invalid CID '{value}': {source}")]
    InvalidCid {
        value: String,
        #[source]
        source: cid::Error,
    },

    #[error("{field} value {value} out of range")]
    OutOfRange { field: &'static str, value: String },

    #[error("unknown DAG {0}")]
    UnknownDag(String),

    #[error("store rejected write: {0}")]
    Rejected(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Counters carried alongside every rollup row of a key
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct StatusCounters {
    pub queued: u64,
    pub proposing: u64,
    pub accepted: u64,
    pub failed: u64,
    pub published: u64,
    pub active: u64,
    pub terminated: u64,
}

/// Identity of one `dag_sources` row: the same DAG under another source is
/// a different row with its own export mark
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceRef {
    pub srcid: i64,
    pub cid: String,
}

impl SourceRef {
    pub fn new(srcid: i64, cid: impl Into<String>) -> Self {
        Self {
            srcid,
            cid: cid.into(),
        }
    }
}

/// One row of the export scan: a DAG under an export key, optionally joined
/// to the deal of the aggregate containing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollupRow {
    pub source_key: String,
    pub srcid: i64,
    pub cid: String,
    pub counters: StatusCounters,
    /// Raw deal status; `None` when no deal exists yet
    pub deal_status: Option<String>,
    pub last_changed: DateTime<Utc>,
    pub aggregate_cid: Option<String>,
    pub piece_cid: Option<String>,
    pub provider: Option<String>,
    pub deal_id: Option<u64>,
    pub datamodel_selector: Option<String>,
    pub deal_start: Option<DateTime<Utc>>,
    pub deal_end: Option<DateTime<Utc>>,
}

impl RollupRow {
    pub fn source(&self) -> SourceRef {
        SourceRef::new(self.srcid, self.cid.clone())
    }
}

#[async_trait]
pub trait DagStore: Send + Sync {
    /// Unmeasured, not-removed DAGs updated within `max_age`, newest first
    async fn pending_dags(&self, max_age: Duration) -> Result<Vec<Cid>>;

    /// Record a measured DAG. With `refs` present, the edges and the size
    /// land in one transaction; without, the size is updated directly.
    async fn record_analysis(&self, root: &Cid, size: u64, refs: &[Cid]) -> Result<()>;
}

/// Server-side cursor over rollup rows, ordered by `source_key`
#[async_trait]
pub trait RollupCursor: Send {
    async fn next_row(&mut self) -> Result<Option<RollupRow>>;
}

#[async_trait]
pub trait ExportStore: Send + Sync {
    async fn refresh_rollup(&self) -> Result<()>;

    /// Rows the refreshed rollup still considers unexported
    async fn count_pending(&self) -> Result<u64>;

    /// Read-only repeatable-read scan ordered bytewise by export key
    async fn open_rollup_cursor(&self) -> Result<Box<dyn RollupCursor>>;

    /// Stamp exactly the given dag_sources rows as exported at `at`
    async fn mark_exported(&self, sources: &[SourceRef], at: DateTime<Utc>) -> Result<u64>;
}

pub(crate) fn cid_from_store(value: &str) -> Result<Cid> {
    value
        .parse::<Cid>()
        .map_err(|source| StoreError::InvalidCid {
            value: value.to_string(),
            source,
        })
}
