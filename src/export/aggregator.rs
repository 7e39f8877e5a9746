//! Streaming group-by over key-ordered rollup rows
//!
//! Two states: `Idle` before the first row, `InGroup` afterwards. A change of
//! key finalizes the open group into the pending batch, and the batch is
//! handed out for writing once it reaches either threshold.

use super::model::{ExportGroup, PendingBatch};
use super::{ExportError, Result};
use crate::store::RollupRow;

#[derive(Debug)]
enum State {
    Idle,
    InGroup(ExportGroup),
}

#[derive(Debug)]
pub struct BatchAggregator {
    max_keys: usize,
    max_bytes: usize,
    network: String,
    state: State,
    batch: PendingBatch,
}

impl BatchAggregator {
    pub fn new(max_keys: usize, max_bytes: usize, network: impl Into<String>) -> Self {
        Self {
            max_keys,
            max_bytes,
            network: network.into(),
            state: State::Idle,
            batch: PendingBatch::default(),
        }
    }

    /// Feed one row. Returns a batch when this row closed a group that
    /// filled the pending batch.
    pub fn push_row(&mut self, row: RollupRow) -> Result<Option<Vec<ExportGroup>>> {
        if let State::InGroup(group) = &mut self.state {
            if group.key == row.source_key {
                group.absorb(&row, &self.network)?;
                return Ok(None);
            }
            if row.source_key.as_bytes() < group.key.as_bytes() {
                return Err(ExportError::UnorderedInput {
                    previous: group.key.clone(),
                    key: row.source_key,
                });
            }
        }

        let ready = self.close_group()?;

        let mut group = ExportGroup::open(&row);
        group.absorb(&row, &self.network)?;
        self.state = State::InGroup(group);
        Ok(ready)
    }

    /// Close the open group and return whatever is still pending
    pub fn finish(&mut self) -> Result<Option<Vec<ExportGroup>>> {
        // closing the last group may fill the batch, which hands it out
        if let Some(batch) = self.close_group()? {
            return Ok(Some(batch));
        }
        if self.batch.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.batch.take()))
    }

    fn close_group(&mut self) -> Result<Option<Vec<ExportGroup>>> {
        let State::InGroup(done) = std::mem::replace(&mut self.state, State::Idle) else {
            return Ok(None);
        };
        self.batch.push(done)?;

        if self.batch.len() >= self.max_keys || self.batch.approx_bytes() >= self.max_bytes {
            return Ok(Some(self.batch.take()));
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::model::test_support::{active_row, queued_row};

    const MIB: usize = 1 << 20;

    fn drive(agg: &mut BatchAggregator, rows: Vec<RollupRow>) -> Vec<Vec<ExportGroup>> {
        let mut batches = Vec::new();
        for row in rows {
            if let Some(batch) = agg.push_row(row).unwrap() {
                batches.push(batch);
            }
        }
        if let Some(batch) = agg.finish().unwrap() {
            batches.push(batch);
        }
        batches
    }

    fn grouped_rows() -> Vec<RollupRow> {
        let mut rows = vec![queued_row("a", "bafy-a"), active_row("b", "bafy-b")];
        rows.extend((0..5000).map(|i| queued_row("c", &format!("bafy-c{i}"))));
        rows
    }

    #[test]
    fn test_groups_independent_of_flush_limits() {
        for max_keys in [1, 2, 3, 10_000] {
            let mut agg = BatchAggregator::new(max_keys, 85 * MIB, "mainnet");
            let groups: Vec<ExportGroup> = drive(&mut agg, grouped_rows()).into_iter().flatten().collect();

            let keys: Vec<&str> = groups.iter().map(|g| g.key.as_str()).collect();
            assert_eq!(keys, vec!["a", "b", "c"], "max_keys = {max_keys}");
            assert_eq!(groups[2].deals.len(), 5000);
            assert_eq!(groups[2].sources.len(), 5000);
        }
    }

    #[test]
    fn test_key_limit_splits_batches() {
        let rows = (0..10_001).map(|i| queued_row(&format!("key-{i:06}"), "bafy")).collect();
        let mut agg = BatchAggregator::new(10_000, 85 * MIB, "mainnet");

        let sizes: Vec<usize> = drive(&mut agg, rows).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10_000, 1]);
    }

    #[test]
    fn test_exactly_max_keys_is_one_full_batch() {
        let rows = (0..10_000).map(|i| queued_row(&format!("key-{i:06}"), "bafy")).collect();
        let mut agg = BatchAggregator::new(10_000, 85 * MIB, "mainnet");

        let sizes: Vec<usize> = drive(&mut agg, rows).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10_000]);
    }

    #[test]
    fn test_single_key_with_one_key_batches() {
        let mut agg = BatchAggregator::new(1, 85 * MIB, "mainnet");

        let batches = drive(&mut agg, vec![queued_row("only", "bafy-only")]);
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].key, "only");
    }

    #[test]
    fn test_byte_limit_flushes_early() {
        let rows = vec![
            queued_row("a", "bafy-a"),
            queued_row("b", "bafy-b"),
            queued_row("c", "bafy-c"),
        ];
        // any encoded entry exceeds one byte
        let mut agg = BatchAggregator::new(10_000, 1, "mainnet");

        let sizes: Vec<usize> = drive(&mut agg, rows).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![1, 1, 1]);
    }

    #[test]
    fn test_unordered_input_rejected() {
        let mut agg = BatchAggregator::new(10_000, 85 * MIB, "mainnet");
        agg.push_row(queued_row("b", "bafy-b")).unwrap();

        let err = agg.push_row(queued_row("a", "bafy-a")).unwrap_err();
        assert!(matches!(
            err,
            ExportError::UnorderedInput { ref previous, ref key } if previous == "b" && key == "a"
        ));
    }

    #[test]
    fn test_byte_order_not_locale_order() {
        // uppercase sorts before lowercase bytewise
        let rows = vec![queued_row("Z", "bafy-z"), queued_row("a", "bafy-a")];
        let mut agg = BatchAggregator::new(10_000, 85 * MIB, "mainnet");
        assert_eq!(drive(&mut agg, rows).concat().len(), 2);
    }

    #[test]
    fn test_empty_input_yields_nothing() {
        let mut agg = BatchAggregator::new(10_000, 85 * MIB, "mainnet");
        assert!(agg.finish().unwrap().is_none());
    }
}
