//! Recording KV double

use super::{BulkWriteResponse, KvPair, KvStore, Result, check_pair_limit};
use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use tokio::sync::Mutex;

#[derive(Debug, Default)]
struct State {
    calls: Vec<Vec<KvPair>>,
    entries: BTreeMap<String, KvPair>,
    scripted: VecDeque<BulkWriteResponse>,
}

/// Applies every accepted bulk write and keeps the call log
#[derive(Debug, Default)]
pub struct MemoryKv {
    state: Mutex<State>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next call answers with `response`; pairs are applied only if it
    /// reports success
    pub async fn respond_next(&self, response: BulkWriteResponse) {
        self.state.lock().await.scripted.push_back(response);
    }

    /// Pair counts of each bulk call, in order
    pub async fn call_sizes(&self) -> Vec<usize> {
        self.state.lock().await.calls.iter().map(Vec::len).collect()
    }

    pub async fn entry(&self, key: &str) -> Option<KvPair> {
        self.state.lock().await.entries.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn write_bulk(&self, pairs: &[KvPair]) -> Result<BulkWriteResponse> {
        check_pair_limit(pairs)?;

        let mut state = self.state.lock().await;
        state.calls.push(pairs.to_vec());

        let response = state.scripted.pop_front().unwrap_or_else(BulkWriteResponse::ok);
        if response.success {
            for pair in pairs {
                state.entries.insert(pair.key.clone(), pair.clone());
            }
        }
        Ok(response)
    }
}
