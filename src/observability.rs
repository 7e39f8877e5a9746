//! Run counters, progress reporting and log setup

use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Install the stderr log subscriber (`RUST_LOG`, default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Counters shared by all pin workers
#[derive(Debug, Default)]
pub struct PinStats {
    pinned: AtomicU64,
    failed: AtomicU64,
    refs: AtomicU64,
    bytes: AtomicU64,
}

impl PinStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dag_pinned(&self, size: u64) {
        self.pinned.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(size, Ordering::Relaxed);
    }

    pub fn dag_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "failed", "Metric incremented");
    }

    pub fn refs_written(&self, count: u64) {
        self.refs.fetch_add(count, Ordering::Relaxed);
    }

    pub fn pinned(&self) -> u64 {
        self.pinned.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> PinSummary {
        PinSummary {
            pinned: self.pinned.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            referenced_blocks: self.refs.load(Ordering::Relaxed),
            bytes: self.bytes.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinSummary {
    pub pinned: u64,
    pub failed: u64,
    pub referenced_blocks: u64,
    pub bytes: u64,
}

/// export-status counters; only the export task writes them
#[derive(Debug, Default)]
pub struct ExportStats {
    pending: AtomicU64,
    updated: AtomicU64,
    batches: AtomicU64,
}

impl ExportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_pending(&self, pending: u64) {
        self.pending.store(pending, Ordering::Relaxed);
    }

    /// Returns the new `updated` total
    pub fn batch_exported(&self, rows: u64) -> u64 {
        self.batches.fetch_add(1, Ordering::Relaxed);
        self.updated.fetch_add(rows, Ordering::Relaxed) + rows
    }

    pub fn snapshot(&self) -> ExportSummary {
        ExportSummary {
            pending: self.pending.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub pending: u64,
    pub updated: u64,
    pub batches: u64,
}

/// Percentage printer on stderr; silent unless enabled
#[derive(Debug)]
pub struct Progress {
    total: u64,
    enabled: bool,
    last_pct: AtomicU64,
}

impl Progress {
    pub fn new(total: u64, enabled: bool) -> Self {
        Self {
            total,
            enabled,
            last_pct: AtomicU64::new(u64::MAX),
        }
    }

    pub fn percent(&self, done: u64) -> u64 {
        if self.total == 0 {
            return 100;
        }
        (done.saturating_mul(100) / self.total).min(100)
    }

    /// Prints only when the percentage moved
    pub fn report(&self, done: u64) {
        let pct = self.percent(done);
        if self.last_pct.swap(pct, Ordering::Relaxed) == pct || !self.enabled {
            return;
        }
        let mut stderr = std::io::stderr().lock();
        let _ = write!(stderr, "{pct}%\r");
        let _ = stderr.flush();
    }

    pub fn finish(&self) {
        if self.enabled {
            eprintln!("100%");
        }
    }

    /// Sample `done()` every `every` until `stop` fires
    pub fn spawn_ticker<F>(
        self: Arc<Self>,
        every: Duration,
        done: F,
        stop: CancellationToken,
    ) -> JoinHandle<()>
    where
        F: Fn() -> u64 + Send + 'static,
    {
        tokio::spawn(async move {
            self.report(done());
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tick.tick() => self.report(done()),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_stats_snapshot() {
        let stats = PinStats::new();
        stats.dag_pinned(100);
        stats.dag_pinned(50);
        stats.dag_failed();
        stats.refs_written(7);

        let summary = stats.snapshot();
        assert_eq!(summary.pinned, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.referenced_blocks, 7);
        assert_eq!(summary.bytes, 150);
    }

    #[test]
    fn test_export_stats_accumulate() {
        let stats = ExportStats::new();
        stats.set_pending(30);
        assert_eq!(stats.batch_exported(10), 10);
        assert_eq!(stats.batch_exported(5), 15);

        let summary = stats.snapshot();
        assert_eq!(summary.pending, 30);
        assert_eq!(summary.updated, 15);
        assert_eq!(summary.batches, 2);
    }

    #[test]
    fn test_progress_percent() {
        let progress = Progress::new(200, false);
        assert_eq!(progress.percent(0), 0);
        assert_eq!(progress.percent(50), 25);
        assert_eq!(progress.percent(500), 100);
        assert_eq!(Progress::new(0, false).percent(0), 100);
    }

    #[tokio::test]
    async fn test_ticker_stops_on_cancel() {
        let progress = Arc::new(Progress::new(10, false));
        let stop = CancellationToken::new();
        let handle = progress.spawn_ticker(Duration::from_millis(5), || 3, stop.clone());

        tokio::time::sleep(Duration::from_millis(20)).await;
        stop.cancel();
        handle.await.unwrap();
    }
}
