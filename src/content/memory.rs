//! In-process content store for tests and dry runs

use super::{ContentApi, ContentError, DagStat, RefEntry, RefStream, Result};
use async_trait::async_trait;
use cid::Cid;
use std::collections::{HashMap, HashSet, VecDeque};
use tokio::sync::Mutex;

/// Failure injected for one root
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    PinFails,
    PinTimeout,
    StatTimeout,
    RefsTimeout,
    /// Stream yields this message in place of a reference
    InlineError(String),
    /// Stream yields a record that is not a CID
    MalformedRef,
}

#[derive(Debug, Clone)]
struct Dag {
    size: u64,
    refs: Vec<Cid>,
}

#[derive(Debug, Default)]
pub struct MemoryContentApi {
    dags: HashMap<Cid, Dag>,
    faults: HashMap<Cid, Fault>,
    pinned: Mutex<HashSet<Cid>>,
}

impl MemoryContentApi {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a DAG; `refs` may repeat blocks, listing de-duplicates them
    pub fn with_dag(mut self, root: Cid, size: u64, refs: Vec<Cid>) -> Self {
        self.dags.insert(root, Dag { size, refs });
        self
    }

    pub fn with_fault(mut self, root: Cid, fault: Fault) -> Self {
        self.faults.insert(root, fault);
        self
    }

    pub async fn is_pinned(&self, root: &Cid) -> bool {
        self.pinned.lock().await.contains(root)
    }

    fn dag(&self, op: &'static str, root: &Cid) -> Result<&Dag> {
        self.dags.get(root).ok_or_else(|| ContentError::Status {
            op,
            status: 500,
            body: format!("{root} not found"),
        })
    }

    fn unique_refs(dag: &Dag) -> Vec<Cid> {
        let mut seen = HashSet::new();
        dag.refs.iter().filter(|c| seen.insert(**c)).copied().collect()
    }
}

fn timeout(op: &'static str, root: &Cid) -> ContentError {
    ContentError::Timeout {
        op,
        cid: root.to_string(),
    }
}

#[async_trait]
impl ContentApi for MemoryContentApi {
    async fn pin(&self, root: &Cid) -> Result<()> {
        match self.faults.get(root) {
            Some(Fault::PinFails) => {
                return Err(ContentError::Status {
                    op: "pin/add",
                    status: 500,
                    body: "pin refused".to_string(),
                });
            }
            Some(Fault::PinTimeout) => return Err(timeout("pin/add", root)),
            _ => {}
        }
        self.dag("pin/add", root)?;
        self.pinned.lock().await.insert(*root);
        Ok(())
    }

    async fn dag_stat(&self, root: &Cid) -> Result<DagStat> {
        if self.faults.get(root) == Some(&Fault::StatTimeout) {
            return Err(timeout("dag/stat", root));
        }
        let dag = self.dag("dag/stat", root)?;
        let blocks = Self::unique_refs(dag).len() as u64 + 1;
        Ok(DagStat {
            size: dag.size,
            num_blocks: blocks,
        })
    }

    async fn refs(&self, root: &Cid) -> Result<Box<dyn RefStream>> {
        let dag = self.dag("refs", root)?;
        let mut items: VecDeque<Result<RefEntry>> =
            Self::unique_refs(dag).iter().map(|c| Ok(RefEntry::ok(c))).collect();

        // faults surface mid-stream, after the first record
        let at = items.len().min(1);
        match self.faults.get(root) {
            Some(Fault::RefsTimeout) => items.insert(at, Err(timeout("refs", root))),
            Some(Fault::InlineError(msg)) => items.insert(at, Ok(RefEntry::failed(msg.clone()))),
            Some(Fault::MalformedRef) => items.insert(
                at,
                Ok(RefEntry {
                    reference: "zz-not-a-cid".to_string(),
                    err: String::new(),
                }),
            ),
            _ => {}
        }

        Ok(Box::new(ListedRefs { items }))
    }
}

struct ListedRefs {
    items: VecDeque<Result<RefEntry>>,
}

#[async_trait]
impl RefStream for ListedRefs {
    async fn next_entry(&mut self) -> Result<Option<RefEntry>> {
        self.items.pop_front().transpose()
    }
}
