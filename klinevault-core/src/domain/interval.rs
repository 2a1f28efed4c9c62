//! Interval: the fixed duration a candle represents.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const MINUTE_MS: i64 = 60_000;

/// Candle interval supported by the venue.
///
/// Serialized as the venue code (`"1m"`, `"4h"`, ...), which is also how it
/// appears in config files and store paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Interval {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown interval '{0}' (expected one of 1m 3m 5m 15m 30m 1h 2h 4h 6h 8h 12h 1d)")]
pub struct IntervalParseError(pub String);

impl Interval {
    pub const ALL: [Interval; 12] = [
        Interval::M1,
        Interval::M3,
        Interval::M5,
        Interval::M15,
        Interval::M30,
        Interval::H1,
        Interval::H2,
        Interval::H4,
        Interval::H6,
        Interval::H8,
        Interval::H12,
        Interval::D1,
    ];

    /// Venue code for this interval.
    pub fn code(self) -> &'static str {
        match self {
            Interval::M1 => "1m",
            Interval::M3 => "3m",
            Interval::M5 => "5m",
            Interval::M15 => "15m",
            Interval::M30 => "30m",
            Interval::H1 => "1h",
            Interval::H2 => "2h",
            Interval::H4 => "4h",
            Interval::H6 => "6h",
            Interval::H8 => "8h",
            Interval::H12 => "12h",
            Interval::D1 => "1d",
        }
    }

    /// Exact length in milliseconds.
    pub fn millis(self) -> i64 {
        let minutes = match self {
            Interval::M1 => 1,
            Interval::M3 => 3,
            Interval::M5 => 5,
            Interval::M15 => 15,
            Interval::M30 => 30,
            Interval::H1 => 60,
            Interval::H2 => 120,
            Interval::H4 => 240,
            Interval::H6 => 360,
            Interval::H8 => 480,
            Interval::H12 => 720,
            Interval::D1 => 1440,
        };
        minutes * MINUTE_MS
    }

    pub fn duration(self) -> Duration {
        Duration::milliseconds(self.millis())
    }

    /// Align an instant down to the open time of the candle containing it.
    pub fn floor(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let ms = ts.timestamp_millis();
        let aligned = ms - ms.rem_euclid(self.millis());
        DateTime::from_timestamp_millis(aligned).unwrap_or(ts)
    }

    /// Align an instant up to the next candle open (identity when already aligned).
    pub fn ceil(self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let floored = self.floor(ts);
        if floored == ts {
            ts
        } else {
            floored + self.duration()
        }
    }

    /// Open time of the most recent candle that has fully elapsed at `now`.
    pub fn last_closed_open(self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.floor(now) - self.duration()
    }

    /// Aligned open `lookback` before `now`, clamped to the Unix epoch.
    ///
    /// Never panics, whatever the lookback length.
    pub fn lookback_start(self, now: DateTime<Utc>, lookback: Duration) -> DateTime<Utc> {
        let epoch = DateTime::from_timestamp(0, 0).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let start = now
            .checked_sub_signed(lookback)
            .map_or(epoch, |start| start.max(epoch));
        self.floor(start)
    }

    /// Whether `ts` sits exactly on an interval boundary.
    pub fn is_aligned(self, ts: DateTime<Utc>) -> bool {
        ts.timestamp_millis().rem_euclid(self.millis()) == 0
    }

    /// Number of candle opens in the inclusive range `[start, end]`.
    ///
    /// Zero when `end < start`.
    pub fn count_between(self, start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
        let span = end.timestamp_millis() - start.timestamp_millis();
        if span < 0 {
            0
        } else {
            span / self.millis() + 1
        }
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Interval {
    type Err = IntervalParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Interval::ALL
            .into_iter()
            .find(|iv| iv.code() == trimmed)
            .ok_or_else(|| IntervalParseError(s.to_string()))
    }
}

impl TryFrom<String> for Interval {
    type Error = IntervalParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Interval> for String {
    fn from(value: Interval) -> Self {
        value.code().to_string()
    }
}
