//! Candle: one OHLCV row for a fixed interval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV candle keyed by its open time.
///
/// Uniqueness is per (symbol, interval, open_time); the symbol and interval
/// live on the store that holds the candle, not on every row.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    pub fn open_time_ms(&self) -> i64 {
        self.open_time.timestamp_millis()
    }

    /// Returns true if every price and volume field is a finite number.
    pub fn is_finite(&self) -> bool {
        self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite()
    }

    /// Basic OHLC sanity: high bounds the body from above, low from below.
    pub fn is_sane(&self) -> bool {
        self.is_finite()
            && self.high >= self.low
            && self.high >= self.open.max(self.close)
            && self.low <= self.open.min(self.close)
            && self.volume >= 0.0
    }
}
