pub mod config;
pub mod content;
pub mod cron;
pub mod export;
pub mod humanize;
pub mod kv;
pub mod lock;
pub mod metrics;
pub mod observability;
pub mod pin;
pub mod store;
