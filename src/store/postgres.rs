//! PostgreSQL-backed store over the `cargo` schema

use super::{
    DagStore, ExportStore, Result, RollupCursor, RollupRow, SourceRef, StatusCounters,
    StoreError, cid_from_store,
};
use crate::config::DatabaseConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cid::Cid;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{PgPool, Postgres, Transaction};
use std::collections::{HashSet, VecDeque};
use std::fmt::Write as _;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info};

const PENDING_DAGS_SQL: &str = r#"
    SELECT cid_v1 FROM cargo.dags d WHERE
        size_actual IS NULL
            AND
        entry_last_updated > ( NOW() - $1::INTERVAL )
            AND
        EXISTS ( SELECT 42 FROM cargo.dag_sources ds WHERE d.cid_v1 = ds.cid_v1 AND ds.entry_removed IS NULL )
    ORDER BY entry_created DESC
"#;

const UPDATE_SIZE_SQL: &str = "UPDATE cargo.dags SET size_actual = $1 WHERE cid_v1 = $2";

const COPY_REFS_SQL: &str = "COPY cargo.refs ( cid_v1, ref_v1 ) FROM STDIN";

const REFRESH_ROLLUP_SQL: &str = "REFRESH MATERIALIZED VIEW cargo.legacy_nft_storage_export_rollup";

const COUNT_ROLLUP_SQL: &str = "SELECT COUNT(*) FROM cargo.legacy_nft_storage_export_rollup";

const ROLLUP_CURSOR: &str = "rollup_export";

// key order must be byte order, the aggregator verifies it
const DECLARE_ROLLUP_CURSOR_SQL: &str = r#"
    DECLARE rollup_export NO SCROLL CURSOR FOR
    SELECT
            ru.source_key,
            ru.srcid::BIGINT AS srcid,
            ru.cid_v1,
            ru.queued::BIGINT AS queued,
            ru.published::BIGINT AS published,
            ru.active::BIGINT AS active,
            ru.terminated::BIGINT AS terminated,
            de.status,
            COALESCE( de.entry_last_updated, ru.entry_last_updated ) AS last_changed,
            ae.aggregate_cid,
            a.piece_cid,
            de.provider,
            de.deal_id::BIGINT AS deal_id,
            ae.datamodel_selector,
            de.start_time,
            de.end_time
        FROM cargo.legacy_nft_storage_export_rollup ru
        LEFT JOIN cargo.aggregate_entries ae USING ( cid_v1 )
        LEFT JOIN cargo.aggregates a USING ( aggregate_cid )
        LEFT JOIN cargo.deals de USING ( aggregate_cid )
    ORDER BY ru.source_key COLLATE "C"
"#;

// one mark per (srcid, cid_v1) pair, never every source of a CID
const MARK_EXPORTED_SQL: &str = r#"
    UPDATE cargo.dag_sources ds
        SET entry_last_exported = $1
    FROM cargo.sources s, UNNEST( $3::BIGINT[], $4::TEXT[] ) AS m ( srcid, cid_v1 )
    WHERE
        s.project = $2
            AND
        ds.srcid = s.srcid
            AND
        ds.srcid = m.srcid
            AND
        ds.cid_v1 = m.cid_v1
"#;

// flush COPY data in chunks of roughly this size
const COPY_CHUNK_BYTES: usize = 1 << 20;

/// Shared pool; cheap to clone
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    export_statement_timeout: Duration,
    fetch_size: u32,
    source_project: i32,
}

impl PgStore {
    pub async fn connect(config: &DatabaseConfig, source_project: i32) -> Result<Self> {
        let opts = PgConnectOptions::from_str(&config.url)?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(opts)
            .await?;

        info!(
            max_connections = config.max_connections,
            "Connected to PostgreSQL"
        );

        Ok(Self {
            pool,
            export_statement_timeout: Duration::from_secs(config.export_statement_timeout_secs),
            fetch_size: config.export_fetch_size,
            source_project,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn to_i64(field: &'static str, value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange {
        field,
        value: value.to_string(),
    })
}

fn to_u64(field: &'static str, value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StoreError::OutOfRange {
        field,
        value: value.to_string(),
    })
}

#[async_trait]
impl DagStore for PgStore {
    async fn pending_dags(&self, max_age: Duration) -> Result<Vec<Cid>> {
        let interval = format!("{} seconds", max_age.as_secs());
        let rows: Vec<String> = sqlx::query_scalar(PENDING_DAGS_SQL)
            .bind(interval)
            .fetch_all(&self.pool)
            .await?;

        let mut seen = HashSet::with_capacity(rows.len());
        let mut dags = Vec::with_capacity(rows.len());
        for raw in rows {
            let cid = cid_from_store(&raw)?;
            if seen.insert(cid) {
                dags.push(cid);
            }
        }
        Ok(dags)
    }

    async fn record_analysis(&self, root: &Cid, size: u64, refs: &[Cid]) -> Result<()> {
        let root = root.to_string();
        let size = to_i64("dags.size_actual", size)?;

        if refs.is_empty() {
            sqlx::query(UPDATE_SIZE_SQL)
                .bind(size)
                .bind(&root)
                .execute(&self.pool)
                .await?;
            return Ok(());
        }

        // dropped without commit (error or cancellation) means rollback
        let mut tx = self.pool.begin().await?;

        let mut copy = tx.copy_in_raw(COPY_REFS_SQL).await?;
        for chunk in RefChunks::new(&root, refs, COPY_CHUNK_BYTES) {
            copy.send(chunk).await?;
        }
        let copied = copy.finish().await?;

        sqlx::query(UPDATE_SIZE_SQL)
            .bind(size)
            .bind(&root)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        debug!(cid = %root, refs = copied, "Stored DAG analysis");
        Ok(())
    }
}

/// COPY text rows `root\tref`, cut into chunks of at least `chunk_bytes`
/// (the last may be shorter). Rows never straddle a chunk.
struct RefChunks<'a> {
    root: &'a str,
    refs: std::slice::Iter<'a, Cid>,
    chunk_bytes: usize,
}

impl<'a> RefChunks<'a> {
    fn new(root: &'a str, refs: &'a [Cid], chunk_bytes: usize) -> Self {
        Self {
            root,
            refs: refs.iter(),
            chunk_bytes,
        }
    }
}

impl Iterator for RefChunks<'_> {
    type Item = Vec<u8>;

    fn next(&mut self) -> Option<Vec<u8>> {
        let mut chunk = String::new();
        for r in self.refs.by_ref() {
            let _ = writeln!(chunk, "{}\t{r}", self.root);
            if chunk.len() >= self.chunk_bytes {
                break;
            }
        }
        (!chunk.is_empty()).then(|| chunk.into_bytes())
    }
}

#[derive(sqlx::FromRow)]
struct RollupRecord {
    source_key: String,
    srcid: i64,
    cid_v1: String,
    queued: Option<i64>,
    published: Option<i64>,
    active: Option<i64>,
    terminated: Option<i64>,
    status: Option<String>,
    last_changed: DateTime<Utc>,
    aggregate_cid: Option<String>,
    piece_cid: Option<String>,
    provider: Option<String>,
    deal_id: Option<i64>,
    datamodel_selector: Option<String>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl TryFrom<RollupRecord> for RollupRow {
    type Error = StoreError;

    fn try_from(r: RollupRecord) -> Result<Self> {
        let counter = |field, v: Option<i64>| to_u64(field, v.unwrap_or(0));
        Ok(RollupRow {
            counters: StatusCounters {
                queued: counter("queued", r.queued)?,
                published: counter("published", r.published)?,
                active: counter("active", r.active)?,
                terminated: counter("terminated", r.terminated)?,
                ..StatusCounters::default()
            },
            source_key: r.source_key,
            srcid: r.srcid,
            cid: r.cid_v1,
            deal_status: r.status,
            last_changed: r.last_changed,
            aggregate_cid: r.aggregate_cid,
            piece_cid: r.piece_cid,
            provider: r.provider,
            deal_id: r.deal_id.map(|id| to_u64("deal_id", id)).transpose()?,
            datamodel_selector: r.datamodel_selector,
            deal_start: r.start_time,
            deal_end: r.end_time,
        })
    }
}

/// Pages through a `DECLARE`d cursor inside its own transaction
struct PgRollupCursor {
    tx: Transaction<'static, Postgres>,
    page: VecDeque<RollupRow>,
    fetch_sql: String,
    fetch_size: usize,
    exhausted: bool,
}

#[async_trait]
impl RollupCursor for PgRollupCursor {
    async fn next_row(&mut self) -> Result<Option<RollupRow>> {
        if self.page.is_empty() && !self.exhausted {
            let records: Vec<RollupRecord> = sqlx::query_as(&self.fetch_sql)
                .fetch_all(&mut *self.tx)
                .await?;
            self.exhausted = records.len() < self.fetch_size;
            for record in records {
                self.page.push_back(record.try_into()?);
            }
        }
        Ok(self.page.pop_front())
    }
}

#[async_trait]
impl ExportStore for PgStore {
    async fn refresh_rollup(&self) -> Result<()> {
        sqlx::query(REFRESH_ROLLUP_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn count_pending(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(COUNT_ROLLUP_SQL)
            .fetch_one(&self.pool)
            .await?;
        to_u64("rollup count", count)
    }

    async fn open_rollup_cursor(&self) -> Result<Box<dyn RollupCursor>> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;
        // update batches can be enormous
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.export_statement_timeout.as_millis()
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(DECLARE_ROLLUP_CURSOR_SQL)
            .execute(&mut *tx)
            .await?;

        Ok(Box::new(PgRollupCursor {
            tx,
            page: VecDeque::new(),
            fetch_sql: format!("FETCH {} FROM {ROLLUP_CURSOR}", self.fetch_size),
            fetch_size: self.fetch_size as usize,
            exhausted: false,
        }))
    }

    async fn mark_exported(&self, sources: &[SourceRef], at: DateTime<Utc>) -> Result<u64> {
        let (srcids, cids): (Vec<i64>, Vec<String>) =
            sources.iter().map(|s| (s.srcid, s.cid.clone())).unzip();
        let result = sqlx::query(MARK_EXPORTED_SQL)
            .bind(at)
            .bind(self.source_project)
            .bind(srcids)
            .bind(cids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::test_support::cid;

    fn record() -> RollupRecord {
        RollupRecord {
            source_key: "source-1".to_string(),
            srcid: 7,
            cid_v1: "bafy1".to_string(),
            queued: Some(2),
            published: None,
            active: Some(1),
            terminated: None,
            status: Some("active".to_string()),
            last_changed: Utc::now(),
            aggregate_cid: None,
            piece_cid: None,
            provider: Some("f01234".to_string()),
            deal_id: Some(42),
            datamodel_selector: None,
            start_time: None,
            end_time: None,
        }
    }

    #[test]
    fn test_record_converts_with_missing_counters_as_zero() {
        let row = RollupRow::try_from(record()).unwrap();

        assert_eq!(row.source(), SourceRef::new(7, "bafy1"));
        assert_eq!(row.counters.queued, 2);
        assert_eq!(row.counters.active, 1);
        assert_eq!(row.counters.published, 0);
        assert_eq!(row.counters.terminated, 0);
        assert_eq!(row.deal_id, Some(42));
    }

    #[test]
    fn test_negative_counter_rejected() {
        let bad = RollupRecord {
            terminated: Some(-1),
            ..record()
        };
        match RollupRow::try_from(bad) {
            Err(StoreError::OutOfRange { field, value }) => {
                assert_eq!(field, "terminated");
                assert_eq!(value, "-1");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_negative_deal_id_rejected() {
        let bad = RollupRecord {
            deal_id: Some(i64::MIN),
            ..record()
        };
        assert!(matches!(
            RollupRow::try_from(bad),
            Err(StoreError::OutOfRange { field: "deal_id", .. })
        ));
    }

    #[test]
    fn test_size_above_bigint_rejected() {
        assert_eq!(to_i64("dags.size_actual", 5).unwrap(), 5);
        assert!(to_i64("dags.size_actual", u64::MAX).is_err());
    }

    #[test]
    fn test_ref_chunks_split_on_row_boundaries() {
        let root = cid("root").to_string();
        let refs: Vec<Cid> = (0..50).map(|i| cid(&format!("ref-{i}"))).collect();
        let row_len = format!("{root}\t{}\n", refs[0]).len();

        // three rows per chunk
        let chunks: Vec<Vec<u8>> = RefChunks::new(&root, &refs, row_len * 3).collect();
        assert_eq!(chunks.len(), 17);
        assert!(chunks.iter().all(|c| c.ends_with(b"\n")));
        assert!(chunks[..16].iter().all(|c| c.len() == row_len * 3));
        assert_eq!(chunks[16].len(), row_len * 2);

        let joined = String::from_utf8(chunks.concat()).unwrap();
        let lines: Vec<&str> = joined.lines().collect();
        assert_eq!(lines.len(), 50);
        assert_eq!(lines[49], format!("{root}\t{}", refs[49]));
    }

    #[test]
    fn test_ref_chunks_single_chunk_and_empty() {
        let root = cid("root").to_string();
        let refs = vec![cid("a"), cid("b")];

        assert_eq!(RefChunks::new(&root, &refs, COPY_CHUNK_BYTES).count(), 1);
        assert_eq!(RefChunks::new(&root, &[], COPY_CHUNK_BYTES).count(), 0);
    }
}
