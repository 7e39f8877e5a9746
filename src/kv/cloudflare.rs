//! Cloudflare Workers KV bulk endpoint

use super::{BULK_WRITE_MAX_BYTES, BulkWriteResponse, KvError, KvPair, KvStore, Result, encode_bulk_body};
use crate::config::KvConfig;
use async_trait::async_trait;
use reqwest::{Client, Url};
use std::time::Duration;
use tracing::debug;

pub struct CloudflareKv {
    client: Client,
    bulk_url: Url,
    token: String,
}

impl CloudflareKv {
    pub fn new(config: &KvConfig) -> Result<Self> {
        let account = required(config.account_id.as_deref(), "kv.account_id")?;
        let namespace = required(config.namespace_id.as_deref(), "kv.namespace_id")?;
        let token = required(config.api_token.as_deref(), "CF_API_TOKEN")?;

        let bulk_url = bulk_url(&config.api_base, account, namespace)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            bulk_url,
            token: token.to_string(),
        })
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| KvError::Config(format!("`{name}` is not set")))
}

fn bulk_url(api_base: &str, account: &str, namespace: &str) -> Result<Url> {
    let raw = format!(
        "{}/accounts/{account}/storage/kv/namespaces/{namespace}/bulk",
        api_base.trim_end_matches('/')
    );
    Url::parse(&raw).map_err(|e| KvError::Config(format!("invalid bulk url '{raw}': {e}")))
}

#[async_trait]
impl KvStore for CloudflareKv {
    async fn write_bulk(&self, pairs: &[KvPair]) -> Result<BulkWriteResponse> {
        let body = encode_bulk_body(pairs, BULK_WRITE_MAX_BYTES)?;
        debug!(pairs = pairs.len(), bytes = body.len(), "Issuing KV bulk write");

        let response = self
            .client
            .put(self.bulk_url.clone())
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;

        // refusals still carry the JSON envelope, hand them back whole
        match serde_json::from_str::<BulkWriteResponse>(&text) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(KvError::Status {
                status: status.as_u16(),
                body: text,
            }),
            Err(e) => Err(KvError::Encode(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bulk_url() {
        let url = bulk_url("https://api.cloudflare.com/client/v4/", "acct", "ns").unwrap();
        assert_eq!(
            url.as_str(),
            "https://api.cloudflare.com/client/v4/accounts/acct/storage/kv/namespaces/ns/bulk"
        );
    }

    #[test]
    fn test_missing_settings() {
        let config = KvConfig {
            account_id: Some("acct".to_string()),
            ..KvConfig::default()
        };
        let err = CloudflareKv::new(&config).err().unwrap();
        assert!(matches!(err, KvError::Config(msg) if msg.contains("kv.namespace_id")));
    }

    #[test]
    fn test_pair_serialization() {
        let pair = KvPair {
            key: "source-1".to_string(),
            value: "[]".to_string(),
            metadata: serde_json::json!({"queued": 1}),
        };
        let json = serde_json::to_value(&pair).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"key": "source-1", "value": "[]", "metadata": {"queued": 1}})
        );
    }
}
