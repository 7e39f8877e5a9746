use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use dagcargo::config::ByteSize;
use dagcargo::export::{self, ExportError, ExportSettings};
use dagcargo::kv::{BulkWriteResponse, MemoryKv};
use dagcargo::observability::ExportStats;
use dagcargo::store::{MemoryStore, RollupRow, StatusCounters};

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

fn queued(key: &str, cid: &str) -> RollupRow {
    RollupRow {
        source_key: key.to_string(),
        srcid: 1,
        cid: cid.to_string(),
        counters: StatusCounters {
            queued: 1,
            ..StatusCounters::default()
        },
        deal_status: None,
        last_changed: at(1_660_000_000),
        aggregate_cid: None,
        piece_cid: None,
        provider: None,
        deal_id: None,
        datamodel_selector: None,
        deal_start: None,
        deal_end: None,
    }
}

fn published(key: &str, cid: &str, deal_id: u64) -> RollupRow {
    RollupRow {
        counters: StatusCounters {
            published: 1,
            ..StatusCounters::default()
        },
        deal_status: Some("published".to_string()),
        aggregate_cid: Some("bafybeiaggregate".to_string()),
        piece_cid: Some("baga6ea4seaqpiece".to_string()),
        provider: Some("f0127896".to_string()),
        deal_id: Some(deal_id),
        datamodel_selector: Some(format!("Links/{deal_id}/Hash")),
        deal_start: Some(at(1_661_000_000)),
        deal_end: Some(at(1_676_000_000)),
        ..queued(key, cid)
    }
}

struct Harness {
    store: Arc<MemoryStore>,
    kv: Arc<MemoryKv>,
    stats: Arc<ExportStats>,
}

impl Harness {
    async fn with_rows(rows: Vec<RollupRow>) -> Self {
        let store = Arc::new(MemoryStore::new());
        store.seed_rollup(rows).await;
        Self {
            store,
            kv: Arc::new(MemoryKv::new()),
            stats: Arc::new(ExportStats::new()),
        }
    }

    async fn run(&self, settings: &ExportSettings) -> Result<(), ExportError> {
        export::run(
            settings,
            self.store.clone(),
            self.kv.clone(),
            self.stats.clone(),
            CancellationToken::new(),
            at(1_700_000_000),
        )
        .await
    }

    async fn value(&self, key: &str) -> Vec<Value> {
        let pair = self.kv.entry(key).await.unwrap();
        serde_json::from_str(&pair.value).unwrap()
    }
}

fn group_rows() -> Vec<RollupRow> {
    let mut rows = vec![queued("key-a", "bafy-a"), published("key-b", "bafy-b", 7)];
    rows.extend((0..5000).map(|i| queued("key-c", &format!("bafy-c{i}"))));
    rows
}

#[tokio::test]
async fn test_groups_become_one_entry_per_key() {
    for max_keys in [1, 2, 10_000] {
        let h = Harness::with_rows(group_rows()).await;
        let settings = ExportSettings::builder().max_batch_keys(max_keys).build();

        h.run(&settings).await.unwrap();

        assert_eq!(h.kv.len().await, 3, "max_batch_keys = {max_keys}");
        assert_eq!(h.value("key-a").await.len(), 1);
        assert_eq!(h.value("key-b").await.len(), 1);
        assert_eq!(h.value("key-c").await.len(), 5000);
    }
}

#[tokio::test]
async fn test_key_limit_produces_two_bulk_writes() {
    let rows = (0..10_001)
        .map(|i| queued(&format!("key-{i:05}"), &format!("bafy-{i}")))
        .collect();
    let h = Harness::with_rows(rows).await;

    h.run(&ExportSettings::builder().build()).await.unwrap();

    assert_eq!(h.kv.call_sizes().await, vec![10_000, 1]);
    let summary = h.stats.snapshot();
    assert_eq!(summary.pending, 10_001);
    assert_eq!(summary.updated, 10_001);
    assert_eq!(summary.batches, 2);
}

#[tokio::test]
async fn test_exactly_max_keys_is_written_and_marked() {
    let rows = (0..10_000)
        .map(|i| queued(&format!("key-{i:05}"), &format!("bafy-{i}")))
        .collect();
    let h = Harness::with_rows(rows).await;

    h.run(&ExportSettings::builder().build()).await.unwrap();

    assert_eq!(h.kv.call_sizes().await, vec![10_000]);
    assert_eq!(h.kv.len().await, 10_000);
    assert!(h.store.exported_at(1, "bafy-9999").await.is_some());
    assert_eq!(h.stats.snapshot().updated, 10_000);
}

#[tokio::test]
async fn test_single_key_with_one_key_batches() {
    let h = Harness::with_rows(vec![queued("key-a", "bafy-a")]).await;
    let settings = ExportSettings::builder().max_batch_keys(1).build();

    h.run(&settings).await.unwrap();

    assert_eq!(h.kv.len().await, 1);
    assert!(h.store.exported_at(1, "bafy-a").await.is_some());
}

#[tokio::test]
async fn test_byte_limit_splits_batches() {
    let h = Harness::with_rows(group_rows()).await;
    let settings = ExportSettings::builder()
        .max_batch_bytes(ByteSize::b(1))
        .build();

    h.run(&settings).await.unwrap();

    assert_eq!(h.kv.call_sizes().await, vec![1, 1, 1]);
}

#[tokio::test]
async fn test_queued_key_has_no_deal_fields() {
    let h = Harness::with_rows(vec![queued("key-a", "bafy-a")]).await;

    h.run(&ExportSettings::builder().build()).await.unwrap();

    let entries = h.value("key-a").await;
    assert_eq!(entries.len(), 1);
    let entry = entries[0].as_object().unwrap();
    assert_eq!(entry["status"], "queued");
    assert_eq!(entry["lastChangedUnix"], 1_660_000_000);
    for absent in ["network", "miner", "chainDealID", "dealActivation", "dealExpiration"] {
        assert!(!entry.contains_key(absent), "{absent} present");
    }

    let metadata = h.kv.entry("key-a").await.unwrap().metadata;
    assert_eq!(metadata["queued"], 1);
    assert_eq!(metadata["published"], 0);
}

#[tokio::test]
async fn test_deal_entry_carries_network_and_times() {
    let h = Harness::with_rows(vec![published("key-b", "bafy-b", 7)]).await;
    let settings = ExportSettings::builder().network("calibnet").build();

    h.run(&settings).await.unwrap();

    let entry = &h.value("key-b").await[0];
    assert_eq!(entry["status"], "published");
    assert_eq!(entry["network"], "calibnet");
    assert_eq!(entry["miner"], "f0127896");
    assert_eq!(entry["chainDealID"], 7);
    assert_eq!(entry["batchRootCid"], "bafybeiaggregate");
    assert_eq!(entry["pieceCid"], "baga6ea4seaqpiece");
    assert_eq!(entry["datamodelSelector"], "Links/7/Hash");
    assert_eq!(entry["dealActivationUnix"], 1_661_000_000);
    assert_eq!(entry["dealExpirationUnix"], 1_676_000_000);
}

#[tokio::test]
async fn test_exported_rows_are_marked_and_skipped_next_run() {
    let h = Harness::with_rows(group_rows()).await;
    h.run(&ExportSettings::builder().build()).await.unwrap();

    assert_eq!(h.store.exported_at(1, "bafy-c4999").await, Some(at(1_700_000_000)));

    let calls = h.kv.call_sizes().await.len();
    h.run(&ExportSettings::builder().build()).await.unwrap();
    assert_eq!(h.kv.call_sizes().await.len(), calls);
    assert_eq!(h.store.refresh_count().await, 2);
}

#[tokio::test]
async fn test_unacknowledged_write_fails_run_without_marking() {
    let h = Harness::with_rows(vec![queued("key-a", "bafy-a")]).await;
    h.kv.respond_next(BulkWriteResponse::default()).await;

    let err = h.run(&ExportSettings::builder().build()).await.unwrap_err();

    assert!(matches!(err, ExportError::ProtocolViolation { .. }));
    assert_eq!(h.store.exported_at(1, "bafy-a").await, None);
    assert_eq!(h.stats.snapshot().updated, 0);
}

#[tokio::test]
async fn test_shared_dag_stays_pending_under_unwritten_key() {
    let mut under_b = queued("key-b", "bafy-shared");
    under_b.srcid = 2;
    let h = Harness::with_rows(vec![queued("key-a", "bafy-shared"), under_b]).await;
    let settings = ExportSettings::builder().max_batch_keys(1).build();
    h.kv.respond_next(BulkWriteResponse::ok()).await;
    h.kv.respond_next(BulkWriteResponse::default()).await;

    let err = h.run(&settings).await.unwrap_err();

    assert!(matches!(err, ExportError::ProtocolViolation { .. }));
    assert!(h.store.exported_at(1, "bafy-shared").await.is_some());
    assert_eq!(h.store.exported_at(2, "bafy-shared").await, None);
    assert!(h.kv.entry("key-b").await.is_none());

    h.run(&settings).await.unwrap();
    assert!(h.kv.entry("key-b").await.is_some());
    assert!(h.store.exported_at(2, "bafy-shared").await.is_some());
}

#[tokio::test]
async fn test_row_without_deal_or_queue_is_marked_but_not_listed() {
    let mut failed_pin = queued("key-a", "bafy-failed");
    failed_pin.counters.queued = 0;
    let h = Harness::with_rows(vec![failed_pin, queued("key-b", "bafy-b")]).await;

    h.run(&ExportSettings::builder().build()).await.unwrap();

    assert!(h.value("key-a").await.is_empty());
    assert!(h.store.exported_at(1, "bafy-failed").await.is_some());
    assert_eq!(h.value("key-b").await.len(), 1);
}

#[tokio::test]
async fn test_nothing_pending_writes_nothing() {
    let h = Harness::with_rows(vec![]).await;
    h.run(&ExportSettings::builder().build()).await.unwrap();
    assert!(h.kv.call_sizes().await.is_empty());
}
