//! Run wrapper shared by every command: lock, BEGIN/FINISH bookkeeping,
//! signal handling, backend wiring, metrics push

use crate::config::{Config, ValidationError, validate_kv};
use crate::content::{ContentError, KuboClient};
use crate::export::{self, ExportError, ExportSettings};
use crate::kv::{CloudflareKv, KvError};
use crate::lock::{LockError, RunLock};
use crate::metrics::PushGateway;
use crate::observability::{ExportStats, PinStats};
use crate::pin::{self, PinError, PinSettings};
use crate::store::{PgStore, StoreError};
use chrono::Utc;
use std::io::IsTerminal;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum CronError {
    #[error(transparent)]
    Config(#[from] ValidationError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Content(#[from] ContentError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Pin(#[from] PinError),

    #[error(transparent)]
    Export(#[from] ExportError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    PinDags {
        skip_dags_aged_days: Option<u32>,
        max_workers: Option<usize>,
    },
    ExportStatus,
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::PinDags { .. } => "pin-dags",
            Command::ExportStatus => "export-status",
        }
    }
}

/// Run `command` to completion and report how it went
pub async fn run(config: &Config, command: Command) -> ExitCode {
    let name = command.name();

    let _lock = match RunLock::acquire(&config.lock.dir, name) {
        Ok(lock) => lock,
        // overlapping cron invocations are expected, stay quiet
        Err(LockError::AlreadyLocked { .. }) if !std::io::stderr().is_terminal() => {
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "Unable to start run");
            return ExitCode::FAILURE;
        }
    };

    let run_id = Uuid::now_v7();
    let t0 = Instant::now();
    info!(%run_id, "=== BEGIN '{name}' run");

    let cancel = CancellationToken::new();
    let watcher = tokio::spawn(cancel_on_signal(cancel.clone()));

    let result = execute(config, command, cancel).await;
    watcher.abort();

    if let Err(e) = &result {
        error!(error = %e, "Run failed");
    }

    let success = result.is_ok();
    let took = truncate_to_millis(t0.elapsed());
    if success {
        info!(%run_id, success, took = ?took, "=== FINISH '{name}' run");
    } else {
        warn!(%run_id, success, took = ?took, "=== FINISH '{name}' run");
    }

    push_metrics(config, name, took, success).await;

    if success {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn execute(
    config: &Config,
    command: Command,
    cancel: CancellationToken,
) -> Result<(), CronError> {
    let show_progress = std::io::stderr().is_terminal();

    match command {
        Command::PinDags {
            skip_dags_aged_days,
            max_workers,
        } => {
            let max_workers = max_workers.unwrap_or(config.content_store.max_workers);
            if max_workers == 0 {
                return Err(ValidationError::NoWorkers.into());
            }
            let days = skip_dags_aged_days.unwrap_or(config.pin.skip_dags_aged_days);
            let settings = PinSettings::builder()
                .max_workers(max_workers)
                .skip_dags_aged(Duration::from_secs(u64::from(days) * SECS_PER_DAY))
                .show_progress(show_progress)
                .build();

            let content = KuboClient::new(&config.content_store)?;
            let store = PgStore::connect(&config.database, config.export.source_project).await?;
            let result = pin::run(
                &settings,
                Arc::new(store.clone()),
                Arc::new(content),
                Arc::new(PinStats::new()),
                cancel,
            )
            .await;
            store.close().await;
            result?;
        }
        Command::ExportStatus => {
            validate_kv(config)?;
            let settings = ExportSettings::builder()
                .max_batch_keys(config.export.max_batch_keys)
                .max_batch_bytes(config.export.max_batch_bytes)
                .network(config.export.network.clone())
                .show_progress(show_progress)
                .build();

            let kv = CloudflareKv::new(&config.kv)?;
            let store = PgStore::connect(&config.database, config.export.source_project).await?;
            let result = export::run(
                &settings,
                Arc::new(store.clone()),
                Arc::new(kv),
                Arc::new(ExportStats::new()),
                cancel,
                Utc::now(),
            )
            .await;
            store.close().await;
            result?;
        }
    }
    Ok(())
}

async fn push_metrics(config: &Config, name: &str, took: Duration, success: bool) {
    let gateway = match PushGateway::from_config(&config.metrics) {
        Ok(Some(gateway)) => gateway,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "Metrics push is misconfigured");
            return;
        }
    };
    if let Err(e) = gateway.push(name, took, success).await {
        warn!(error = %e, "push of prometheus metrics failed");
    }
}

async fn cancel_on_signal(cancel: CancellationToken) {
    shutdown_signal().await;
    warn!("early termination signal received, cleaning up...");
    cancel.cancel();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn truncate_to_millis(d: Duration) -> Duration {
    Duration::from_millis(u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_names() {
        let pin = Command::PinDags {
            skip_dags_aged_days: None,
            max_workers: None,
        };
        assert_eq!(pin.name(), "pin-dags");
        assert_eq!(Command::ExportStatus.name(), "export-status");
    }

    #[test]
    fn test_truncate_to_millis() {
        assert_eq!(
            truncate_to_millis(Duration::from_micros(1_234_567)),
            Duration::from_millis(1234)
        );
    }

    #[tokio::test]
    async fn test_contended_lock_fails_run() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            lock: crate::config::LockConfig {
                dir: dir.path().to_path_buf(),
            },
            ..Config::default()
        };
        let _held = RunLock::acquire(dir.path(), "export-status").unwrap();

        assert_eq!(run(&config, Command::ExportStatus).await, ExitCode::FAILURE);
    }

    #[tokio::test]
    async fn test_export_without_kv_settings_fails_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            lock: crate::config::LockConfig {
                dir: dir.path().to_path_buf(),
            },
            ..Config::default()
        };

        let err = execute(&config, Command::ExportStatus, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CronError::Config(ValidationError::MissingSetting("kv.account_id"))
        ));
    }
}
