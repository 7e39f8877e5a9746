use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub content_store: ContentStoreConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub pin: PinConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub kv: KvConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub lock: LockConfig,
}

/// IPFS node HTTP API
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ContentStoreConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Per-call timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Upper bound on concurrent pin/analyze jobs
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// stat/refs calls get `timeout_secs * stat_timeout_multiplier`
    #[serde(default = "default_stat_timeout_multiplier")]
    pub stat_timeout_multiplier: u32,
}

impl ContentStoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn extended_timeout(&self) -> Duration {
        self.timeout() * self.stat_timeout_multiplier
    }
}

impl Default for ContentStoreConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            timeout_secs: default_timeout_secs(),
            max_workers: default_max_workers(),
            stat_timeout_multiplier: default_stat_timeout_multiplier(),
        }
    }
}

fn default_api_url() -> String {
    "http://localhost:5001".to_string()
}

fn default_timeout_secs() -> u64 {
    240
}

fn default_max_workers() -> usize {
    128
}

fn default_stat_timeout_multiplier() -> u32 {
    15
}

/// PostgreSQL connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_url")]
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Statement timeout for the long export scan
    #[serde(default = "default_export_statement_timeout_secs")]
    pub export_statement_timeout_secs: u64,
    /// Rows pulled per FETCH from the export cursor
    #[serde(default = "default_export_fetch_size")]
    pub export_fetch_size: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            export_statement_timeout_secs: default_export_statement_timeout_secs(),
            export_fetch_size: default_export_fetch_size(),
        }
    }
}

fn default_database_url() -> String {
    "postgres:///postgres?user=cargo&host=/var/run/postgresql".to_string()
}

fn default_max_connections() -> u32 {
    // one per pin worker plus the feeder's working-set query
    129
}

fn default_export_statement_timeout_secs() -> u64 {
    3 * 60 * 60
}

fn default_export_fetch_size() -> u32 {
    5_000
}

/// pin-dags defaults (CLI flags override)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PinConfig {
    /// DAGs not updated within this many days are ignored
    #[serde(default = "default_skip_dags_aged_days")]
    pub skip_dags_aged_days: u32,
}

impl Default for PinConfig {
    fn default() -> Self {
        Self {
            skip_dags_aged_days: default_skip_dags_aged_days(),
        }
    }
}

fn default_skip_dags_aged_days() -> u32 {
    5
}

/// export-status batching and labelling
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    #[serde(default = "default_max_batch_keys")]
    pub max_batch_keys: usize,
    #[serde(default = "default_max_batch_bytes")]
    pub max_batch_bytes: ByteSize,
    /// Label attached to every entry backed by an actual deal
    #[serde(default = "default_network")]
    pub network: String,
    /// `sources.project` whose dag_sources rows get marked exported
    #[serde(default = "default_source_project")]
    pub source_project: i32,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            max_batch_keys: default_max_batch_keys(),
            max_batch_bytes: default_max_batch_bytes(),
            network: default_network(),
            source_project: default_source_project(),
        }
    }
}

fn default_max_batch_keys() -> usize {
    10_000
}

fn default_max_batch_bytes() -> ByteSize {
    // the bulk endpoint takes 100MiB, request overhead eats into that
    ByteSize::mib(85)
}

fn default_network() -> String {
    "mainnet".to_string()
}

fn default_source_project() -> i32 {
    2
}

/// Cloudflare Workers KV
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KvConfig {
    #[serde(default = "default_kv_api_base")]
    pub api_base: String,
    pub account_id: Option<String>,
    /// Namespace holding per-key deal status
    pub namespace_id: Option<String>,
    /// Loaded from `CF_API_TOKEN`, never from the file
    #[serde(skip)]
    pub api_token: Option<String>,
    #[serde(default = "default_kv_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            api_base: default_kv_api_base(),
            account_id: None,
            namespace_id: None,
            api_token: None,
            timeout_secs: default_kv_timeout_secs(),
        }
    }
}

fn default_kv_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_kv_timeout_secs() -> u64 {
    600
}

/// Prometheus push gateway; pushing is skipped without `push_url`
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    pub push_url: Option<String>,
    pub push_user: Option<String>,
    /// Loaded from `PROM_PUSH_PASSWORD`
    #[serde(skip)]
    pub push_password: Option<String>,
    #[serde(default = "default_instance")]
    pub instance: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            push_url: None,
            push_user: None,
            push_password: None,
            instance: default_instance(),
        }
    }
}

fn default_instance() -> String {
    "dagcargo".to_string()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_dir")]
    pub dir: PathBuf,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            dir: default_lock_dir(),
        }
    }
}

fn default_lock_dir() -> PathBuf {
    std::env::temp_dir()
}
