//! Resume point for incremental fetching.
//!
//! The checkpoint is never persisted separately: it is derived from the last
//! row of the store, so a crashed or cancelled run resumes where the last
//! successful merge left off.

use super::store::{CsvStore, StoreError};
use crate::domain::{FetchWindow, StoreKey};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum Checkpoint {
    /// Candles are due in this window.
    Fetch(FetchWindow),
    /// The store already holds the most recent closed candle.
    UpToDate { last: Option<DateTime<Utc>> },
}

/// Derive the next window for `key`.
///
/// - empty or absent store: `floor(now - lookback)`, clamped to the Unix epoch
/// - otherwise: one interval after the last stored open
///
/// The window ends at the open of the most recent fully elapsed candle.
/// A tail that cannot be parsed is reported as `StoreError::Corrupt`.
pub fn resolve(
    store: &CsvStore,
    key: &StoreKey,
    lookback: Duration,
    now: DateTime<Utc>,
) -> Result<Checkpoint, StoreError> {
    let interval = key.interval;
    let end = interval.last_closed_open(now);
    let last = store.last_timestamp(key)?;

    let start = match last {
        Some(last) => interval.floor(last) + interval.duration(),
        None => interval.lookback_start(now, lookback),
    };

    if start > end {
        return Ok(Checkpoint::UpToDate { last });
    }
    Ok(Checkpoint::Fetch(FetchWindow::new(
        key.symbol.clone(),
        interval,
        start,
        end,
    )))
}
