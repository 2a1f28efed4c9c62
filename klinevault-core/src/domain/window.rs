//! Fetch windows and gap ranges.

use super::interval::Interval;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Inclusive time range of candle opens to retrieve for one symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchWindow {
    pub symbol: String,
    pub interval: Interval,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl FetchWindow {
    pub fn new(
        symbol: impl Into<String>,
        interval: Interval,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
            start,
            end,
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.start <= ts && ts <= self.end
    }

    /// Number of candle opens the window can hold.
    pub fn candle_count(&self) -> i64 {
        self.interval.count_between(self.start, self.end)
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Contiguous inclusive run of missing candle opens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl GapRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn candle_count(&self, interval: Interval) -> i64 {
        interval.count_between(self.start, self.end)
    }

    pub fn to_window(&self, symbol: &str, interval: Interval) -> FetchWindow {
        FetchWindow::new(symbol, interval, self.start, self.end)
    }
}

/// Collapse sorted, aligned missing opens into contiguous ranges.
pub fn collapse_missing(missing: &[DateTime<Utc>], interval: Interval) -> Vec<GapRange> {
    let step = interval.duration();
    let mut ranges: Vec<GapRange> = Vec::new();
    for &ts in missing {
        match ranges.last_mut() {
            Some(last) if last.end + step == ts => last.end = ts,
            _ => ranges.push(GapRange::new(ts, ts)),
        }
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    #[test]
    fn window_bounds_are_inclusive() {
        let w = FetchWindow::new("BTCUSDT", Interval::M1, t(0), t(9));
        assert!(w.contains(t(0)));
        assert!(w.contains(t(9)));
        assert!(!w.contains(t(10)));
        assert_eq!(w.candle_count(), 10);
        assert!(!w.is_empty());
    }

    #[test]
    fn collapse_groups_consecutive_opens() {
        let missing = vec![t(3), t(4), t(5), t(9), t(20), t(21)];
        let ranges = collapse_missing(&missing, Interval::M1);
        assert_eq!(
            ranges,
            vec![
                GapRange::new(t(3), t(5)),
                GapRange::new(t(9), t(9)),
                GapRange::new(t(20), t(21)),
            ]
        );
        assert_eq!(ranges[0].candle_count(Interval::M1), 3);
    }

    #[test]
    fn collapse_empty_is_empty() {
        assert!(collapse_missing(&[], Interval::M1).is_empty());
    }
}
