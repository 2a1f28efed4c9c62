//! Deduplicating merge of fresh candles into a store.
//!
//! Rows are keyed by open time. When a timestamp appears in both the stored
//! series and the fresh batch, the fresh row replaces the stored one; within
//! the fresh batch the later row wins. The result is sorted ascending.

use super::store::{CsvStore, StoreError};
use crate::domain::{Candle, StoreKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MergeOutcome {
    pub rows_before: usize,
    pub rows_after: usize,
    /// Timestamps that were not stored before.
    pub rows_added: usize,
    /// Stored timestamps whose values changed.
    pub rows_replaced: usize,
    /// Whether the store file was rewritten.
    pub written: bool,
}

impl MergeOutcome {
    pub fn changed(&self) -> bool {
        self.rows_added > 0 || self.rows_replaced > 0
    }
}

/// Merge `fresh` over `existing`, newest fetch wins.
pub fn merge_candles(existing: &[Candle], fresh: &[Candle]) -> (Vec<Candle>, MergeOutcome) {
    let mut by_time: BTreeMap<i64, Candle> =
        existing.iter().map(|c| (c.open_time_ms(), *c)).collect();
    let rows_before = existing.len();

    let mut rows_added = 0;
    let mut rows_replaced = 0;
    let mut fresh_by_time: BTreeMap<i64, Candle> = BTreeMap::new();
    for c in fresh {
        fresh_by_time.insert(c.open_time_ms(), *c);
    }
    for (ts, candle) in fresh_by_time {
        match by_time.insert(ts, candle) {
            None => rows_added += 1,
            Some(old) if old != candle => rows_replaced += 1,
            Some(_) => {}
        }
    }

    let merged: Vec<Candle> = by_time.into_values().collect();
    let outcome = MergeOutcome {
        rows_before,
        rows_after: merged.len(),
        rows_added,
        rows_replaced,
        written: false,
    };
    (merged, outcome)
}

/// Merge `fresh` into the store for `key` and replace it atomically.
///
/// An empty batch, or one that changes nothing, leaves the file untouched.
pub fn merge_into_store(
    store: &CsvStore,
    key: &StoreKey,
    fresh: &[Candle],
) -> Result<MergeOutcome, StoreError> {
    if fresh.is_empty() {
        let rows = store.count_rows(key)?;
        return Ok(MergeOutcome {
            rows_before: rows,
            rows_after: rows,
            ..MergeOutcome::default()
        });
    }

    let existing = store.load(key)?;
    let (merged, mut outcome) = merge_candles(&existing, fresh);

    // A store that is out of order or duplicated gets rewritten too.
    if !store.exists(key) || merged != existing {
        store.write(key, &merged)?;
        outcome.written = true;
    }

    debug!(
        %key,
        rows_before = outcome.rows_before,
        rows_after = outcome.rows_after,
        added = outcome.rows_added,
        replaced = outcome.rows_replaced,
        written = outcome.written,
        "merged candles"
    );
    Ok(outcome)
}
