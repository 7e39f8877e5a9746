//! Content-store (IPFS node) access
//!
//! [`ContentApi`] is the seam the pin pipeline talks through. [`KuboClient`]
//! speaks the Kubo HTTP RPC; [`MemoryContentApi`] is an in-process double
//! with injectable faults.

pub mod http;
pub mod memory;

pub use http::KuboClient;
pub use memory::{Fault, MemoryContentApi};

use async_trait::async_trait;
use cid::Cid;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("{op} of {cid} timed out")]
    Timeout { op: &'static str, cid: String },

    #[error("{op} request failed: {source}")]
    Request {
        op: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{op} returned HTTP {status}: {body}")]
    Status {
        op: &'static str,
        status: u16,
        body: String,
    },

    #[error("malformed {op} response: {source}")]
    Decode {
        op: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("reference stream reported: {0}")]
    Inline(String),

    #[error("invalid CID '{value}': {source}")]
    InvalidCid {
        value: String,
        #[source]
        source: cid::Error,
    },
}

impl ContentError {
    /// Network timeouts are the only content errors a run survives
    pub fn is_timeout(&self) -> bool {
        match self {
            ContentError::Timeout { .. } => true,
            ContentError::Request { source, .. } => source.is_timeout(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ContentError>;

/// Output of `dag/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DagStat {
    #[serde(rename = "Size")]
    pub size: u64,
    #[serde(rename = "NumBlocks")]
    pub num_blocks: u64,
}

/// One record of the `refs` stream; exactly one field is meaningful
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RefEntry {
    #[serde(rename = "Ref", default)]
    pub reference: String,
    #[serde(rename = "Err", default)]
    pub err: String,
}

impl RefEntry {
    pub fn ok(cid: &Cid) -> Self {
        Self {
            reference: cid.to_string(),
            err: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            reference: String::new(),
            err: message.into(),
        }
    }

    /// Inline errors and unparsable references are both fatal
    pub fn into_cid(self) -> Result<Cid> {
        if !self.err.is_empty() {
            return Err(ContentError::Inline(self.err));
        }
        parse_cid(&self.reference)
    }
}

/// Incrementally decoded reference listing
#[async_trait]
pub trait RefStream: Send {
    /// `None` once the node closed the stream
    async fn next_entry(&mut self) -> Result<Option<RefEntry>>;
}

#[async_trait]
pub trait ContentApi: Send + Sync {
    /// Pin the DAG rooted at `root` (base timeout)
    async fn pin(&self, root: &Cid) -> Result<()>;

    /// Size and block count (extended timeout)
    async fn dag_stat(&self, root: &Cid) -> Result<DagStat>;

    /// Recursive, de-duplicated references below `root` (extended timeout)
    async fn refs(&self, root: &Cid) -> Result<Box<dyn RefStream>>;
}

/// Parse any CID and normalise it to v1, the form the store keys on
pub fn parse_cid(value: &str) -> Result<Cid> {
    value
        .parse::<Cid>()
        .and_then(Cid::into_v1)
        .map_err(|source| ContentError::InvalidCid {
            value: value.to_string(),
            source,
        })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cid_upgrades_v0() {
        let v0 = "QmPZ9gcCEpqKTo6aq61g2nXGUhM4iCL3ewB6LDXZCtioEB";
        let cid = parse_cid(v0).unwrap();

        assert_eq!(cid.version(), cid::Version::V1);
        assert_eq!(parse_cid(&cid.to_string()).unwrap(), cid);
    }

    #[test]
    fn test_parse_cid_rejects_garbage() {
        assert!(matches!(
            parse_cid("not-a-cid"),
            Err(ContentError::InvalidCid { .. })
        ));
    }

    #[test]
    fn test_ref_entry_decode() {
        let entry: RefEntry =
            serde_json::from_str(r#"{"Ref":"bafybeigdyrzt5sfp7udm7hu76uh7y26nf3efuylqabf3oclgtqy55fbzdi","Err":""}"#)
                .unwrap();
        assert!(entry.into_cid().is_ok());

        let entry: RefEntry = serde_json::from_str(r#"{"Ref":"","Err":"block not found"}"#).unwrap();
        assert!(matches!(entry.into_cid(), Err(ContentError::Inline(msg)) if msg == "block not found"));
    }

    #[test]
    fn test_timeout_classification() {
        let timeout = ContentError::Timeout {
            op: "dag/stat",
            cid: "x".to_string(),
        };
        assert!(timeout.is_timeout());
        assert!(!ContentError::Inline("boom".to_string()).is_timeout());
    }
}
