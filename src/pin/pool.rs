//! Bounded worker pool with a single feeder
//!
//! ```text
//! feeder ──► [ bounded queue, 2N ] ──► N workers
//!    ▲                                    │
//!    └──────── halt ◄──── first error ◄───┘
//! ```
//!
//! The first error a worker reports wins the result slot and halts the
//! feeder. Jobs already queued still drain through the remaining workers;
//! the erroring worker itself exits.

use super::PinError;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Set-once result slot; later errors are dropped
#[derive(Debug)]
pub struct FirstError<E> {
    cell: OnceLock<E>,
}

impl<E> Default for FirstError<E> {
    fn default() -> Self {
        Self {
            cell: OnceLock::new(),
        }
    }
}

impl<E> FirstError<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` when this call claimed the slot
    pub fn record(&self, err: E) -> bool {
        self.cell.set(err).is_ok()
    }

    pub fn get(&self) -> Option<&E> {
        self.cell.get()
    }

    pub fn into_inner(self) -> Option<E> {
        self.cell.into_inner()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
    workers: usize,
    cancel: CancellationToken,
}

impl WorkerPool {
    /// `max_workers` capped at the number of jobs
    pub fn new(max_workers: usize, jobs: usize, cancel: CancellationToken) -> Self {
        Self {
            workers: max_workers.min(jobs),
            cancel,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn queue_capacity(&self) -> usize {
        2 * self.workers
    }

    /// Feed `jobs` through `work` and return the first recorded error
    pub async fn run<J, F, Fut>(&self, jobs: Vec<J>, work: F) -> Result<(), PinError>
    where
        J: Send + 'static,
        F: Fn(J) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), PinError>> + Send + 'static,
    {
        if self.workers == 0 || jobs.is_empty() {
            return Ok(());
        }

        let (tx, rx) = mpsc::channel::<J>(self.queue_capacity());
        let rx = Arc::new(Mutex::new(rx));
        let slot = Arc::new(FirstError::new());
        let halt = self.cancel.child_token();
        let work = Arc::new(work);

        let feeder = {
            let cancel = self.cancel.clone();
            let halt = halt.clone();
            let slot = slot.clone();
            tokio::spawn(async move {
                for job in jobs {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            slot.record(PinError::Cancelled);
                            return;
                        }
                        _ = halt.cancelled() => return,
                        sent = tx.send(job) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
                // dropping tx closes the queue, workers exit once it drains
            })
        };

        let mut workers = JoinSet::new();
        for worker_id in 0..self.workers {
            let rx = rx.clone();
            let slot = slot.clone();
            let halt = halt.clone();
            let work = work.clone();
            workers.spawn(async move {
                loop {
                    let job = rx.lock().await.recv().await;
                    let Some(job) = job else {
                        return;
                    };
                    if let Err(e) = (*work)(job).await {
                        if slot.record(e) {
                            debug!(worker_id, "Worker recorded the run's first error");
                        }
                        halt.cancel();
                        return;
                    }
                }
            });
        }
        drop(rx);

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Pin worker did not finish cleanly");
                slot.record(PinError::Worker(e.to_string()));
                halt.cancel();
            }
        }
        if let Err(e) = feeder.await {
            slot.record(PinError::Worker(e.to_string()));
        }

        // every task holding a clone has been joined
        match Arc::into_inner(slot).and_then(FirstError::into_inner) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
