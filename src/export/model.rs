//! Export value types: what one KV entry holds and how rows fold into it

use super::{ExportError, Result};
use crate::kv::KvPair;
use crate::store::{RollupRow, SourceRef, StatusCounters};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DealStatus {
    Queued,
    Proposing,
    Accepted,
    Failed,
    Published,
    Active,
    Terminated,
}

/// Raw status outside the known set
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl FromStr for DealStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> std::result::Result<Self, UnknownStatus> {
        match s {
            "queued" => Ok(DealStatus::Queued),
            "proposing" => Ok(DealStatus::Proposing),
            "accepted" => Ok(DealStatus::Accepted),
            "failed" => Ok(DealStatus::Failed),
            "published" => Ok(DealStatus::Published),
            "active" => Ok(DealStatus::Active),
            "terminated" => Ok(DealStatus::Terminated),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// One element of a KV value
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DealEntry {
    pub status: DealStatus,
    pub last_changed: DateTime<Utc>,
    pub last_changed_unix: i64,
    #[serde(rename = "batchRootCid", skip_serializing_if = "Option::is_none")]
    pub aggregate_cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub piece_cid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    #[serde(rename = "miner", skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(rename = "chainDealID", skip_serializing_if = "Option::is_none")]
    pub chain_deal_id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datamodel_selector: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_activation: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_activation_unix: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_expiration: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deal_expiration_unix: Option<i64>,
}

impl DealEntry {
    /// `None` when the row has no deal and nothing queued (a failed pin,
    /// for instance): the DAG is still marked but contributes no entry.
    pub fn from_row(row: &RollupRow, network: &str) -> Result<Option<Self>> {
        let status = match row.deal_status.as_deref() {
            None if row.counters.queued == 0 => return Ok(None),
            None => DealStatus::Queued,
            Some(raw) => raw.parse().map_err(|UnknownStatus(status)| {
                error!(key = %row.source_key, cid = %row.cid, status = %status, "Deal carries an unknown status");
                ExportError::UnknownStatus {
                    status,
                    key: row.source_key.clone(),
                    cid: row.cid.clone(),
                }
            })?,
        };
        let has_deal = row.deal_status.is_some();

        let mut entry = DealEntry {
            status,
            last_changed: row.last_changed,
            last_changed_unix: row.last_changed.timestamp(),
            aggregate_cid: row.aggregate_cid.clone(),
            piece_cid: row.piece_cid.clone(),
            network: None,
            provider: row.provider.clone(),
            chain_deal_id: row.deal_id,
            datamodel_selector: row.datamodel_selector.clone(),
            deal_activation: None,
            deal_activation_unix: None,
            deal_expiration: None,
            deal_expiration_unix: None,
        };

        if has_deal {
            entry.network = Some(network.to_string());
            entry.deal_activation = row.deal_start;
            entry.deal_activation_unix = row.deal_start.map(|t| t.timestamp());
            entry.deal_expiration = row.deal_end;
            entry.deal_expiration_unix = row.deal_end.map(|t| t.timestamp());
        }
        Ok(Some(entry))
    }
}

/// Everything exported under one key
#[derive(Debug, Clone)]
pub struct ExportGroup {
    pub key: String,
    /// Taken from the first row of the key
    pub counters: StatusCounters,
    pub deals: Vec<DealEntry>,
    /// dag_sources rows that fed this group, in scan order, possibly repeated
    pub sources: Vec<SourceRef>,
    encoded: Option<String>,
}

impl ExportGroup {
    pub fn open(first: &RollupRow) -> Self {
        Self {
            key: first.source_key.clone(),
            counters: first.counters,
            deals: Vec::new(),
            sources: Vec::new(),
            encoded: None,
        }
    }

    pub fn absorb(&mut self, row: &RollupRow, network: &str) -> Result<()> {
        self.sources.push(row.source());
        if let Some(entry) = DealEntry::from_row(row, network)? {
            self.deals.push(entry);
        }
        Ok(())
    }

    /// Encode the value once; returns its length in bytes
    pub fn finalize(&mut self) -> Result<usize> {
        if let Some(encoded) = &self.encoded {
            return Ok(encoded.len());
        }
        let encoded = serde_json::to_string(&self.deals)?;
        let len = encoded.len();
        self.encoded = Some(encoded);
        Ok(len)
    }

    pub fn into_pair(mut self) -> Result<KvPair> {
        self.finalize()?;
        Ok(KvPair {
            key: self.key,
            value: self.encoded.unwrap_or_default(),
            metadata: serde_json::to_value(self.counters)?,
        })
    }
}

/// Finalized groups awaiting the next bulk write
#[derive(Debug, Default)]
pub struct PendingBatch {
    groups: Vec<ExportGroup>,
    approx_bytes: usize,
}

impl PendingBatch {
    pub fn push(&mut self, mut group: ExportGroup) -> Result<()> {
        self.approx_bytes += group.finalize()?;
        self.groups.push(group);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn approx_bytes(&self) -> usize {
        self.approx_bytes
    }

    pub fn take(&mut self) -> Vec<ExportGroup> {
        self.approx_bytes = 0;
        std::mem::take(&mut self.groups)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::TimeZone;

    pub fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().unwrap()
    }

    /// A DAG still waiting for a deal
    pub fn queued_row(key: &str, cid: &str) -> RollupRow {
        RollupRow {
            source_key: key.to_string(),
            srcid: 1,
            cid: cid.to_string(),
            counters: StatusCounters {
                queued: 1,
                ..StatusCounters::default()
            },
            deal_status: None,
            last_changed: at(1_650_000_000),
            aggregate_cid: None,
            piece_cid: None,
            provider: None,
            deal_id: None,
            datamodel_selector: None,
            deal_start: None,
            deal_end: None,
        }
    }

    pub fn active_row(key: &str, cid: &str) -> RollupRow {
        RollupRow {
            counters: StatusCounters {
                active: 1,
                ..StatusCounters::default()
            },
            deal_status: Some("active".to_string()),
            aggregate_cid: Some("bafyaggregate".to_string()),
            piece_cid: Some("baga6ea4seaq".to_string()),
            provider: Some("f01234".to_string()),
            deal_id: Some(42),
            datamodel_selector: Some("Links/0/Hash".to_string()),
            deal_start: Some(at(1_650_100_000)),
            deal_end: Some(at(1_665_000_000)),
            ..queued_row(key, cid)
        }
    }
}
