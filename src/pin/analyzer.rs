//! Per-DAG job: pin, stat, collect references, persist

use super::PinError;
use crate::content::ContentApi;
use crate::observability::PinStats;
use crate::store::DagStore;
use cid::Cid;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

#[derive(Clone)]
pub struct ContentAnalyzer {
    content: Arc<dyn ContentApi>,
    store: Arc<dyn DagStore>,
    stats: Arc<PinStats>,
    cancel: CancellationToken,
}

impl ContentAnalyzer {
    pub fn new(
        content: Arc<dyn ContentApi>,
        store: Arc<dyn DagStore>,
        stats: Arc<PinStats>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            content,
            store,
            stats,
            cancel,
        }
    }

    /// Process one DAG. Pin failures and content-store timeouts are counted
    /// and swallowed; any other failure is returned.
    pub async fn analyze(&self, root: Cid) -> Result<(), PinError> {
        // dropping the in-flight future rolls back an open transaction
        let outcome = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(PinError::Cancelled),
            r = self.pin_and_measure(&root) => r,
        };

        let Err(e) = outcome else {
            return Ok(());
        };
        self.stats.dag_failed();

        if e.is_timeout() {
            error!(cid = %root, error = %e, "Aborting DAG analysis due to timeout");
            return Ok(());
        }
        Err(e)
    }

    async fn pin_and_measure(&self, root: &Cid) -> Result<(), PinError> {
        // nothing is written yet, so a refused pin is not worth aborting for
        if let Err(e) = self.content.pin(root).await {
            warn!(cid = %root, error = %e, "Failure to pin");
            self.stats.dag_failed();
            return Ok(());
        }

        let stat = self.content.dag_stat(root).await?;

        let refs = if stat.num_blocks > 1 {
            self.collect_refs(root).await?
        } else {
            Vec::new()
        };

        if self.cancel.is_cancelled() {
            return Err(PinError::Cancelled);
        }
        self.store.record_analysis(root, stat.size, &refs).await?;

        debug!(cid = %root, size = stat.size, blocks = stat.num_blocks, refs = refs.len(), "DAG analyzed");
        self.stats.refs_written(refs.len() as u64);
        self.stats.dag_pinned(stat.size);
        Ok(())
    }

    async fn collect_refs(&self, root: &Cid) -> Result<Vec<Cid>, PinError> {
        let mut stream = self.content.refs(root).await?;
        let mut refs = Vec::with_capacity(256);
        while let Some(entry) = stream.next_entry().await? {
            refs.push(entry.into_cid()?);
        }
        Ok(refs)
    }
}
