//! Kubo HTTP RPC client

use super::{ContentApi, ContentError, DagStat, RefEntry, RefStream, Result};
use crate::config::ContentStoreConfig;
use async_trait::async_trait;
use bytes::BytesMut;
use cid::Cid;
use reqwest::{Client, Response, Url};
use std::time::Duration;
use tracing::debug;

const USER_AGENT: &str = concat!("dagcargo/", env!("CARGO_PKG_VERSION"));

/// Client for the `/api/v0` endpoints of an IPFS node
#[derive(Debug, Clone)]
pub struct KuboClient {
    client: Client,
    base: Url,
    timeout: Duration,
    extended_timeout: Duration,
}

impl KuboClient {
    pub fn new(config: &ContentStoreConfig) -> Result<Self> {
        let mut raw = config.api_url.clone();
        if !raw.ends_with('/') {
            raw.push('/');
        }
        let base = Url::parse(&raw)
            .and_then(|u| u.join("api/v0/"))
            .map_err(|e| ContentError::Status {
                op: "configure",
                status: 0,
                body: format!("invalid api url '{}': {e}", config.api_url),
            })?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| ContentError::Request {
                op: "configure",
                source,
            })?;

        Ok(Self {
            client,
            base,
            timeout: config.timeout(),
            extended_timeout: config.extended_timeout(),
        })
    }

    /// Issue one RPC call, mapping transport timeouts and non-2xx statuses
    async fn call(
        &self,
        op: &'static str,
        root: &Cid,
        options: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<Response> {
        let url = self.base.join(op).map_err(|e| ContentError::Status {
            op,
            status: 0,
            body: e.to_string(),
        })?;
        let arg = root.to_string();

        debug!(op, cid = %arg, timeout_secs = timeout.as_secs(), "Content store request");

        let response = self
            .client
            .post(url)
            .query(&[("arg", arg.as_str())])
            .query(options)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| request_error(op, root, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ContentError::Status {
                op,
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

fn request_error(op: &'static str, root: &Cid, source: reqwest::Error) -> ContentError {
    if source.is_timeout() {
        ContentError::Timeout {
            op,
            cid: root.to_string(),
        }
    } else {
        ContentError::Request { op, source }
    }
}

#[async_trait]
impl ContentApi for KuboClient {
    async fn pin(&self, root: &Cid) -> Result<()> {
        self.call("pin/add", root, &[], self.timeout).await?;
        Ok(())
    }

    async fn dag_stat(&self, root: &Cid) -> Result<DagStat> {
        let response = self
            .call("dag/stat", root, &[("progress", "false")], self.extended_timeout)
            .await?;
        let body = response
            .bytes()
            .await
            .map_err(|e| request_error("dag/stat", root, e))?;

        serde_json::from_slice(&body).map_err(|source| ContentError::Decode {
            op: "dag/stat",
            source,
        })
    }

    async fn refs(&self, root: &Cid) -> Result<Box<dyn RefStream>> {
        let response = self
            .call(
                "refs",
                root,
                &[("unique", "true"), ("recursive", "true")],
                self.extended_timeout,
            )
            .await?;

        Ok(Box::new(NdjsonRefStream::new(*root, response)))
    }
}

/// Newline-delimited JSON decoder over a chunked response body
struct NdjsonRefStream {
    root: Cid,
    response: Response,
    buf: BytesMut,
    eof: bool,
}

impl NdjsonRefStream {
    fn new(root: Cid, response: Response) -> Self {
        Self {
            root,
            response,
            buf: BytesMut::with_capacity(8 * 1024),
            eof: false,
        }
    }

    fn next_line(&mut self) -> Option<BytesMut> {
        if let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            return Some(self.buf.split_to(pos + 1));
        }
        if self.eof && !self.buf.is_empty() {
            return Some(self.buf.split());
        }
        None
    }
}

fn decode_line(line: &[u8]) -> Result<Option<RefEntry>> {
    let line = line.trim_ascii();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_slice(line)
        .map(Some)
        .map_err(|source| ContentError::Decode { op: "refs", source })
}

#[async_trait]
impl RefStream for NdjsonRefStream {
    async fn next_entry(&mut self) -> Result<Option<RefEntry>> {
        loop {
            while let Some(line) = self.next_line() {
                if let Some(entry) = decode_line(&line)? {
                    return Ok(Some(entry));
                }
            }
            if self.eof {
                return Ok(None);
            }
            match self.response.chunk().await {
                Ok(Some(chunk)) => self.buf.extend_from_slice(&chunk),
                Ok(None) => self.eof = true,
                Err(e) => return Err(request_error("refs", &self.root, e)),
            }
        }
    }
}
