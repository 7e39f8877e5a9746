//! End-of-run gauges pushed to a Prometheus push gateway

use crate::config::MetricsConfig;
use prometheus_client::encoding::text::{encode_eof, encode_registry};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use reqwest::{Client, Url};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to encode metrics: {0}")]
    Encode(#[from] std::fmt::Error),

    #[error("invalid push gateway url '{0}'")]
    InvalidUrl(String),

    #[error("metrics push failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("push gateway returned HTTP {status}: {body}")]
    Status { status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, MetricsError>;

/// Replace every run of non-alphanumeric characters with a single `_`
pub fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_run = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Text exposition of `<prefix>_run_time` (ms) and `<prefix>_success`
pub fn encode_run(command: &str, took: Duration, success: bool) -> Result<String> {
    let prefix = sanitize(&format!("dagcargo_{command}"));
    let mut registry = Registry::default();

    let run_time = Gauge::<i64>::default();
    run_time.set(i64::try_from(took.as_millis()).unwrap_or(i64::MAX));
    registry.register(
        format!("{prefix}_run_time"),
        "How long did the job take (in milliseconds)",
        run_time,
    );

    let succeeded = Gauge::<i64>::default();
    succeeded.set(i64::from(success));
    registry.register(
        format!("{prefix}_success"),
        "Whether the job completed with success(1) or failure(0)",
        succeeded,
    );

    let mut body = String::new();
    encode_registry(&mut body, &registry)?;
    encode_eof(&mut body)?;
    Ok(body)
}

pub struct PushGateway {
    client: Client,
    base: Url,
    instance: String,
    user: Option<String>,
    password: Option<String>,
}

impl PushGateway {
    /// `None` when no push url is configured
    pub fn from_config(config: &MetricsConfig) -> Result<Option<Self>> {
        let Some(raw) = config.push_url.as_deref().filter(|u| !u.is_empty()) else {
            return Ok(None);
        };
        let base = Url::parse(raw).map_err(|_| MetricsError::InvalidUrl(raw.to_string()))?;
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Some(Self {
            client,
            base,
            instance: config.instance.clone(),
            user: config.push_user.clone(),
            password: config.push_password.clone(),
        }))
    }

    pub fn push_url(&self, command: &str) -> Result<Url> {
        let path = format!(
            "{}/metrics/job/{}/instance/{}",
            self.base.as_str().trim_end_matches('/'),
            sanitize(command),
            self.instance
        );
        Url::parse(&path).map_err(|_| MetricsError::InvalidUrl(path))
    }

    pub async fn push(&self, command: &str, took: Duration, success: bool) -> Result<()> {
        let url = self.push_url(command)?;
        let body = encode_run(command, took, success)?;

        let mut request = self
            .client
            .put(url.clone())
            .header(reqwest::header::CONTENT_TYPE, "text/plain; version=0.0.4")
            .body(body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_deref());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(MetricsError::Status {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        debug!(%url, "Pushed run metrics");
        Ok(())
    }
}
