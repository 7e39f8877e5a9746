//! export-status: fold the deal-status rollup into one KV entry per export
//! key and bulk-write it

pub mod aggregator;
pub mod model;
pub mod sink;

pub use aggregator::BatchAggregator;
pub use model::{DealEntry, DealStatus, ExportGroup, PendingBatch};
pub use sink::BulkSink;

use crate::humanize::ByteSize;
use crate::kv::{BulkWriteResponse, KvError, KvStore};
use crate::observability::{ExportStats, Progress};
use crate::store::{ExportStore, StoreError};
use bon::Builder;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error("failed to encode export value: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("bulk write was not acknowledged: {response:?}")]
    ProtocolViolation { response: Box<BulkWriteResponse> },

    #[error("export key '{key}' arrived after '{previous}'")]
    UnorderedInput { previous: String, key: String },

    #[error("unknown deal status '{status}' for {cid} under key '{key}'")]
    UnknownStatus {
        status: String,
        key: String,
        cid: String,
    },

    #[error("run cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ExportError>;

#[derive(Debug, Clone, Builder)]
pub struct ExportSettings {
    #[builder(default = crate::kv::BULK_WRITE_MAX_PAIRS)]
    pub max_batch_keys: usize,
    #[builder(default = ByteSize::mib(85))]
    pub max_batch_bytes: ByteSize,
    #[builder(default = "mainnet".to_string(), into)]
    pub network: String,
    #[builder(default)]
    pub show_progress: bool,
}

pub async fn run(
    settings: &ExportSettings,
    store: Arc<dyn ExportStore>,
    kv: Arc<dyn KvStore>,
    stats: Arc<ExportStats>,
    cancel: CancellationToken,
    started_at: DateTime<Utc>,
) -> Result<()> {
    store.refresh_rollup().await?;
    let pending = store.count_pending().await?;
    stats.set_pending(pending);
    if pending == 0 {
        info!("No status changes to export");
        return Ok(());
    }
    info!(pending, "updating status of {pending} entries");

    let progress = Arc::new(Progress::new(pending, settings.show_progress));
    let sink = BulkSink::new(kv, store.clone(), stats.clone(), progress.clone(), started_at);
    let mut aggregator = BatchAggregator::new(
        settings.max_batch_keys,
        settings.max_batch_bytes.as_usize(),
        settings.network.clone(),
    );

    let result = drain(store.as_ref(), &mut aggregator, &sink, &cancel).await;

    if result.is_ok() {
        progress.finish();
    }
    let summary = stats.snapshot();
    info!(updated = summary.updated, batches = summary.batches, "export-status summary");
    result
}

/// Feed every cursor row through the aggregator, flushing as batches fill
async fn drain(
    store: &dyn ExportStore,
    aggregator: &mut BatchAggregator,
    sink: &BulkSink,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut cursor = store.open_rollup_cursor().await?;
    loop {
        let row = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ExportError::Cancelled),
            row = cursor.next_row() => row?,
        };
        let Some(row) = row else {
            break;
        };
        if let Some(batch) = aggregator.push_row(row)? {
            sink.flush(batch).await?;
        }
    }
    if let Some(batch) = aggregator.finish()? {
        sink.flush(batch).await?;
    }
    Ok(())
}
