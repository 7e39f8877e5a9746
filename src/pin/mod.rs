//! pin-dags: pin every pending DAG on the content store, measure it, and
//! persist its size and reference graph

pub mod analyzer;
pub mod pool;

pub use analyzer::ContentAnalyzer;
pub use pool::{FirstError, WorkerPool};

use crate::content::{ContentApi, ContentError};
use crate::observability::{PinStats, Progress};
use crate::store::{DagStore, StoreError};
use bon::Builder;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum PinError {
    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("run cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Worker(String),
}

impl PinError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PinError::Content(e) if e.is_timeout())
    }
}

#[derive(Debug, Clone, Builder)]
pub struct PinSettings {
    pub max_workers: usize,
    /// DAGs not updated within this window are left alone
    pub skip_dags_aged: Duration,
    #[builder(default)]
    pub show_progress: bool,
    #[builder(default = Duration::from_millis(250))]
    pub progress_interval: Duration,
}

pub async fn run(
    settings: &PinSettings,
    store: Arc<dyn DagStore>,
    content: Arc<dyn ContentApi>,
    stats: Arc<PinStats>,
    cancel: CancellationToken,
) -> Result<(), PinError> {
    let pending = store.pending_dags(settings.skip_dags_aged).await?;
    if pending.is_empty() {
        info!("No DAGs pending analysis");
        return Ok(());
    }

    let total = pending.len() as u64;
    info!(total, "about to pin and analyze {total} dags");

    let progress = Arc::new(Progress::new(total, settings.show_progress));
    let stop_ticker = CancellationToken::new();
    let ticker = {
        let stats = stats.clone();
        progress.clone().spawn_ticker(
            settings.progress_interval,
            move || stats.pinned(),
            stop_ticker.clone(),
        )
    };

    let analyzer = Arc::new(ContentAnalyzer::new(
        content,
        store,
        stats.clone(),
        cancel.clone(),
    ));
    let pool = WorkerPool::new(settings.max_workers, pending.len(), cancel);
    let result = pool
        .run(pending, move |root| {
            let analyzer = analyzer.clone();
            async move { analyzer.analyze(root).await }
        })
        .await;

    stop_progress(&stop_ticker, ticker).await;
    if result.is_ok() {
        progress.finish();
    }

    let summary = stats.snapshot();
    info!(
        pinned = summary.pinned,
        failed = summary.failed,
        referencedBlocks = summary.referenced_blocks,
        bytes = summary.bytes,
        "pin-dags summary"
    );

    result
}

/// Stop the progress ticker; returns whether it ended cleanly. A failed
/// ticker only loses progress lines, so the run result stands.
async fn stop_progress(stop: &CancellationToken, ticker: JoinHandle<()>) -> bool {
    stop.cancel();
    match ticker.await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Progress ticker ended abnormally");
            false
        }
    }
}
