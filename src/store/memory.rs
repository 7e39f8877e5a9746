//! In-process store with the same eligibility and freshness rules as the
//! PostgreSQL queries

use super::{DagStore, ExportStore, Result, RollupCursor, RollupRow, SourceRef, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cid::Cid;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;
use tokio::sync::Mutex;

/// A `dags` row as seeded by a test
#[derive(Debug, Clone)]
pub struct SeedDag {
    pub cid: Cid,
    pub size: Option<u64>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub removed: bool,
}

impl SeedDag {
    /// Unmeasured, live, just updated
    pub fn fresh(cid: Cid, created: DateTime<Utc>) -> Self {
        Self {
            cid,
            size: None,
            created,
            updated: Utc::now(),
            removed: false,
        }
    }
}

#[derive(Debug, Default)]
struct State {
    dags: BTreeMap<Cid, SeedDag>,
    refs: BTreeSet<(Cid, Cid)>,
    rollup_source: Vec<RollupRow>,
    rollup: Vec<RollupRow>,
    exported: HashMap<SourceRef, DateTime<Utc>>,
    refreshes: u64,
    rejected_roots: HashSet<Cid>,
    fail_marks: bool,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_dag(&self, dag: SeedDag) {
        self.state.lock().await.dags.insert(dag.cid, dag);
    }

    /// Rows the rollup view would yield; order is irrelevant
    pub async fn seed_rollup(&self, rows: impl IntoIterator<Item = RollupRow>) {
        self.state.lock().await.rollup_source.extend(rows);
    }

    /// Fail `record_analysis` for `root` without writing anything
    pub async fn reject_writes_for(&self, root: Cid) {
        self.state.lock().await.rejected_roots.insert(root);
    }

    pub async fn fail_marks(&self, fail: bool) {
        self.state.lock().await.fail_marks = fail;
    }

    pub async fn size_of(&self, root: &Cid) -> Option<u64> {
        self.state.lock().await.dags.get(root).and_then(|d| d.size)
    }

    pub async fn refs_of(&self, root: &Cid) -> BTreeSet<Cid> {
        self.state
            .lock()
            .await
            .refs
            .iter()
            .filter(|(r, _)| r == root)
            .map(|(_, c)| *c)
            .collect()
    }

    pub async fn exported_at(&self, srcid: i64, cid: &str) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .exported
            .get(&SourceRef::new(srcid, cid))
            .copied()
    }

    pub async fn refresh_count(&self) -> u64 {
        self.state.lock().await.refreshes
    }
}

#[async_trait]
impl DagStore for MemoryStore {
    async fn pending_dags(&self, max_age: Duration) -> Result<Vec<Cid>> {
        let window = chrono::Duration::from_std(max_age).map_err(|_| StoreError::OutOfRange {
            field: "max_age",
            value: format!("{max_age:?}"),
        })?;
        let cutoff = Utc::now() - window;

        let state = self.state.lock().await;
        let mut eligible: Vec<&SeedDag> = state
            .dags
            .values()
            .filter(|d| d.size.is_none() && !d.removed && d.updated > cutoff)
            .collect();
        eligible.sort_by(|a, b| b.created.cmp(&a.created));

        Ok(eligible.into_iter().map(|d| d.cid).collect())
    }

    async fn record_analysis(&self, root: &Cid, size: u64, refs: &[Cid]) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.rejected_roots.contains(root) {
            return Err(StoreError::Rejected(format!("write for {root}")));
        }
        let dag = state
            .dags
            .get_mut(root)
            .ok_or_else(|| StoreError::UnknownDag(root.to_string()))?;

        dag.size = Some(size);
        state.refs.extend(refs.iter().map(|r| (*root, *r)));
        Ok(())
    }
}

struct VecCursor {
    rows: VecDeque<RollupRow>,
}

#[async_trait]
impl RollupCursor for VecCursor {
    async fn next_row(&mut self) -> Result<Option<RollupRow>> {
        Ok(self.rows.pop_front())
    }
}

#[async_trait]
impl ExportStore for MemoryStore {
    async fn refresh_rollup(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        let fresh: Vec<RollupRow> = state
            .rollup_source
            .iter()
            .filter(|r| !state.exported.contains_key(&r.source()))
            .cloned()
            .collect();
        state.rollup = fresh;
        state.refreshes += 1;
        Ok(())
    }

    async fn count_pending(&self) -> Result<u64> {
        Ok(self.state.lock().await.rollup.len() as u64)
    }

    async fn open_rollup_cursor(&self) -> Result<Box<dyn RollupCursor>> {
        let mut rows = self.state.lock().await.rollup.clone();
        // stable, so rows within a key keep seed order
        rows.sort_by(|a, b| a.source_key.as_bytes().cmp(b.source_key.as_bytes()));
        Ok(Box::new(VecCursor { rows: rows.into() }))
    }

    async fn mark_exported(&self, sources: &[SourceRef], at: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        if state.fail_marks {
            return Err(StoreError::Rejected("mark_exported".to_string()));
        }
        for source in sources {
            state.exported.insert(source.clone(), at);
        }
        Ok(sources.len() as u64)
    }
}
