//! Bulk write of a finished batch, then the export marks

use super::model::ExportGroup;
use super::{ExportError, Result};
use crate::kv::KvStore;
use crate::observability::{ExportStats, Progress};
use crate::store::ExportStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error};

pub struct BulkSink {
    kv: Arc<dyn KvStore>,
    store: Arc<dyn ExportStore>,
    stats: Arc<ExportStats>,
    progress: Arc<Progress>,
    run_started: DateTime<Utc>,
}

impl BulkSink {
    pub fn new(
        kv: Arc<dyn KvStore>,
        store: Arc<dyn ExportStore>,
        stats: Arc<ExportStats>,
        progress: Arc<Progress>,
        run_started: DateTime<Utc>,
    ) -> Self {
        Self {
            kv,
            store,
            stats,
            progress,
            run_started,
        }
    }

    /// One bulk write for `groups`, then mark every contributing DAG.
    /// Rows stay unmarked unless the KV store acknowledged the write.
    pub async fn flush(&self, groups: Vec<ExportGroup>) -> Result<u64> {
        if groups.is_empty() {
            return Ok(0);
        }

        let mut sources = Vec::with_capacity(groups.len());
        let mut pairs = Vec::with_capacity(groups.len());
        for group in groups {
            sources.extend(group.sources.iter().cloned());
            pairs.push(group.into_pair()?);
        }
        sources.sort_unstable();
        sources.dedup();

        let response = self.kv.write_bulk(&pairs).await?;
        if !response.success {
            error!(pairs = pairs.len(), response = ?response, "Unexpected bulk update response");
            return Err(ExportError::ProtocolViolation {
                response: Box::new(response),
            });
        }

        let marked = self.store.mark_exported(&sources, self.run_started).await?;
        debug!(keys = pairs.len(), rows = sources.len(), marked, "Batch exported");

        let updated = self.stats.batch_exported(sources.len() as u64);
        self.progress.report(updated);
        Ok(sources.len() as u64)
    }
}
