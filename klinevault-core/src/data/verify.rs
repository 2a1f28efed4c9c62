//! Store integrity verification.
//!
//! Each store is checked against a target window `[start, end]`:
//!
//! 1. Boundary pass: head and tail rows only. Missing, empty, or unparseable
//!    boundaries are classified without reading the body.
//! 2. Row count: `(last - first) / interval + 1` rows are expected.
//! 3. Full scan, only when the count disagrees (or `deep` is set): every row
//!    is parsed, ordering is checked, and the exact missing opens are listed.

use super::store::{Boundary, CsvStore, StoreError};
use crate::domain::{Candle, GapRange, Interval, StoreKey};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

/// What a store is checked against.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyTarget {
    pub interval: Interval,
    /// First open time the store must cover.
    pub start: DateTime<Utc>,
    /// Last open time the store must cover.
    pub end: DateTime<Utc>,
    /// Slack allowed at both boundaries.
    pub tolerance: Duration,
    /// Scan every row even when the row count matches.
    pub deep: bool,
}

impl VerifyTarget {
    /// Target covering `lookback` up to the last closed candle at `now`.
    pub fn for_lookback(
        interval: Interval,
        lookback: Duration,
        tolerance: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            interval,
            start: interval.lookback_start(now, lookback),
            end: interval.last_closed_open(now),
            tolerance,
            deep: false,
        }
    }

    fn full_range(&self) -> Vec<GapRange> {
        let start = self.interval.ceil(self.start);
        let end = self.interval.floor(self.end);
        if start <= end {
            vec![GapRange::new(start, end)]
        } else {
            Vec::new()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreIssue {
    Missing,
    Empty,
    Corrupt { reason: String },
    StartLate { first: DateTime<Utc> },
    EndEarly { last: DateTime<Utc> },
    InternalGaps { ranges: usize, missing_candles: i64 },
}

impl fmt::Display for StoreIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreIssue::Missing => write!(f, "missing"),
            StoreIssue::Empty => write!(f, "empty"),
            StoreIssue::Corrupt { reason } => write!(f, "corrupt ({reason})"),
            StoreIssue::StartLate { first } => write!(f, "starts late at {first}"),
            StoreIssue::EndEarly { last } => write!(f, "ends early at {last}"),
            StoreIssue::InternalGaps {
                ranges,
                missing_candles,
            } => write!(f, "{missing_candles} candle(s) missing in {ranges} gap(s)"),
        }
    }
}

/// Verification result for one store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GapReport {
    pub key: StoreKey,
    pub issues: Vec<StoreIssue>,
    /// Ranges to fetch, ascending.
    pub missing: Vec<GapRange>,
    pub rows: usize,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl GapReport {
    fn healthy(key: StoreKey) -> Self {
        Self {
            key,
            issues: Vec::new(),
            missing: Vec::new(),
            rows: 0,
            first: None,
            last: None,
        }
    }

    pub fn needs_repair(&self) -> bool {
        !self.issues.is_empty()
    }

    pub fn is_corrupt(&self) -> bool {
        self.issues
            .iter()
            .any(|i| matches!(i, StoreIssue::Corrupt { .. }))
    }

    pub fn missing_candles(&self) -> i64 {
        self.missing
            .iter()
            .map(|g| g.candle_count(self.key.interval))
            .sum()
    }
}

/// Aggregate of a verification pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VerifySummary {
    pub checked: usize,
    pub healthy: usize,
    /// Stores needing repair, in key order.
    pub reports: Vec<GapReport>,
}

impl VerifySummary {
    pub fn from_reports(mut all: Vec<GapReport>) -> Self {
        all.sort_by(|a, b| a.key.cmp(&b.key));
        let checked = all.len();
        let reports: Vec<GapReport> = all.into_iter().filter(GapReport::needs_repair).collect();
        Self {
            checked,
            healthy: checked - reports.len(),
            reports,
        }
    }

    pub fn all_healthy(&self) -> bool {
        self.reports.is_empty()
    }
}

/// Check one store against `target`.
///
/// Corruption is classified into the report; only I/O failures are errors.
pub fn verify_store(
    store: &CsvStore,
    key: &StoreKey,
    target: &VerifyTarget,
) -> Result<GapReport, StoreError> {
    let mut report = GapReport::healthy(key.clone());

    let (first, last) = match store.read_boundary(key) {
        Ok(Boundary::Missing) => {
            report.issues.push(StoreIssue::Missing);
            report.missing = target.full_range();
            return Ok(report);
        }
        Ok(Boundary::Empty) => {
            report.issues.push(StoreIssue::Empty);
            report.missing = target.full_range();
            return Ok(report);
        }
        Ok(Boundary::Rows { first, last }) => (first.open_time, last.open_time),
        Err(e) if e.is_corrupt() => return Ok(corrupt_report(report, target, e.to_string())),
        Err(e) => return Err(e),
    };
    report.first = Some(first);
    report.last = Some(last);

    let interval = key.interval;
    let step = interval.duration();
    let mut head_gap = None;
    let mut tail_gap = None;

    let late_after = target
        .start
        .checked_add_signed(target.tolerance)
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let early_before = target
        .end
        .checked_sub_signed(target.tolerance)
        .unwrap_or(DateTime::<Utc>::MIN_UTC);

    if first > late_after {
        report.issues.push(StoreIssue::StartLate { first });
        head_gap = Some(GapRange::new(interval.ceil(target.start), first - step));
    }
    if last < early_before {
        report.issues.push(StoreIssue::EndEarly { last });
        tail_gap = Some(GapRange::new(last + step, interval.floor(target.end)));
    }

    if first > last {
        return Ok(corrupt_report(
            report,
            target,
            "first row is later than last row".to_string(),
        ));
    }

    report.rows = store.count_rows(key)?;
    let expected = interval.count_between(first, last);
    let mut internal = Vec::new();

    if target.deep || report.rows as i64 != expected {
        let candles = match store.load(key) {
            Ok(c) => c,
            Err(e) if e.is_corrupt() => return Ok(corrupt_report(report, target, e.to_string())),
            Err(e) => return Err(e),
        };
        match internal_gaps(&candles, interval) {
            Ok(gaps) => internal = gaps,
            Err(reason) => return Ok(corrupt_report(report, target, reason)),
        }
    }

    if !internal.is_empty() {
        report.issues.push(StoreIssue::InternalGaps {
            ranges: internal.len(),
            missing_candles: internal.iter().map(|g| g.candle_count(interval)).sum(),
        });
    }

    report.missing = head_gap
        .into_iter()
        .chain(internal)
        .chain(tail_gap)
        .filter(|g| g.start <= g.end)
        .collect();

    debug!(
        %key,
        rows = report.rows,
        expected,
        issues = report.issues.len(),
        "verified store"
    );
    Ok(report)
}

fn corrupt_report(mut report: GapReport, target: &VerifyTarget, reason: String) -> GapReport {
    report.issues.push(StoreIssue::Corrupt { reason });
    report.missing = target.full_range();
    report
}

/// Missing ranges between consecutive rows; errors on unsorted, duplicated
/// or non-finite rows.
fn internal_gaps(candles: &[Candle], interval: Interval) -> Result<Vec<GapRange>, String> {
    if let Some(bad) = candles.iter().find(|c| !c.is_finite()) {
        return Err(format!("non-finite value at {}", bad.open_time));
    }
    let step = interval.duration();
    let mut gaps = Vec::new();
    for pair in candles.windows(2) {
        let (a, b) = (pair[0].open_time, pair[1].open_time);
        if b <= a {
            return Err(format!("rows out of order or duplicated at {b}"));
        }
        if b - a > step {
            gaps.push(GapRange::new(interval.ceil(a + step), interval.floor(b - step)));
        }
    }
    Ok(gaps.into_iter().filter(|g| g.start <= g.end).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn candle(min: i64) -> Candle {
        Candle {
            open_time: t(min),
            open: 1.0,
            high: 1.0,
            low: 1.0,
            close: 1.0,
            volume: 1.0,
        }
    }

    fn target(start: i64, end: i64) -> VerifyTarget {
        VerifyTarget {
            interval: Interval::M1,
            start: t(start),
            end: t(end),
            tolerance: Duration::zero(),
            deep: false,
        }
    }

    fn key() -> StoreKey {
        StoreKey::new("BTCUSDT", Interval::M1).unwrap()
    }

    #[test]
    fn complete_store_is_healthy() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        store.write(&key(), &(0..60).map(candle).collect::<Vec<_>>()).unwrap();

        let report = verify_store(&store, &key(), &target(0, 59)).unwrap();
        assert!(!report.needs_repair(), "{report:?}");
        assert_eq!(report.rows, 60);
    }

    #[test]
    fn missing_store_needs_whole_window() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());

        let report = verify_store(&store, &key(), &target(0, 59)).unwrap();
        assert_eq!(report.issues, vec![StoreIssue::Missing]);
        assert_eq!(report.missing, vec![GapRange::new(t(0), t(59))]);
    }

    #[test]
    fn boundary_gaps_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        store.write(&key(), &(10..50).map(candle).collect::<Vec<_>>()).unwrap();

        let report = verify_store(&store, &key(), &target(0, 59)).unwrap();
        assert_eq!(
            report.issues,
            vec![
                StoreIssue::StartLate { first: t(10) },
                StoreIssue::EndEarly { last: t(49) },
            ]
        );
        assert_eq!(
            report.missing,
            vec![GapRange::new(t(0), t(9)), GapRange::new(t(50), t(59))]
        );
        assert_eq!(report.missing_candles(), 20);
    }

    #[test]
    fn tolerance_absorbs_small_boundary_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        store.write(&key(), &(2..58).map(candle).collect::<Vec<_>>()).unwrap();

        let mut tgt = target(0, 59);
        tgt.tolerance = Duration::minutes(5);
        assert!(!verify_store(&store, &key(), &tgt).unwrap().needs_repair());
    }

    #[test]
    fn huge_lookback_and_tolerance_do_not_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        store.write(&key(), &(0..60).map(candle).collect::<Vec<_>>()).unwrap();

        let mut tgt = VerifyTarget::for_lookback(
            Interval::M1,
            Duration::days(4_000_000_000),
            Duration::zero(),
            t(60),
        );
        assert_eq!(tgt.start.timestamp(), 0);
        tgt.tolerance = Duration::days(100_000_000);
        assert!(!verify_store(&store, &key(), &tgt).unwrap().needs_repair());
    }

    #[test]
    fn internal_gaps_are_enumerated() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        let rows: Vec<Candle> = (0..60)
            .filter(|m| !(20..25).contains(m) && *m != 40)
            .map(candle)
            .collect();
        store.write(&key(), &rows).unwrap();

        let report = verify_store(&store, &key(), &target(0, 59)).unwrap();
        assert_eq!(
            report.issues,
            vec![StoreIssue::InternalGaps {
                ranges: 2,
                missing_candles: 6
            }]
        );
        assert_eq!(
            report.missing,
            vec![GapRange::new(t(20), t(24)), GapRange::new(t(40), t(40))]
        );
    }

    #[test]
    fn corrupt_body_row_is_found_by_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        let path = store.path(&key());
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(
            &path,
            "timestamp,open,high,low,close,volume\n\
             2025-01-01 00:00:00+00:00,1,1,1,1,1\n\
             2025-01-01 00:01:00+00:00,x,1,1,1,1\n\
             2025-01-01 00:03:00+00:00,1,1,1,1,1\n",
        )
        .unwrap();

        let report = verify_store(&store, &key(), &target(0, 3)).unwrap();
        assert!(report.is_corrupt(), "{report:?}");
        assert_eq!(report.missing, vec![GapRange::new(t(0), t(3))]);
    }

    #[test]
    fn duplicated_rows_are_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        store
            .write(&key(), &[candle(0), candle(1), candle(1), candle(2), candle(3)])
            .unwrap();

        let report = verify_store(&store, &key(), &target(0, 3)).unwrap();
        assert!(report.is_corrupt());
    }

    #[test]
    fn deep_scan_catches_count_neutral_damage() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        // One duplicate and one hole cancel out in the row count.
        store
            .write(&key(), &[candle(0), candle(1), candle(1), candle(3)])
            .unwrap();

        assert!(!verify_store(&store, &key(), &target(0, 3)).unwrap().needs_repair());
        let mut deep = target(0, 3);
        deep.deep = true;
        assert!(verify_store(&store, &key(), &deep).unwrap().is_corrupt());
    }

    #[test]
    fn nan_row_is_corrupt_under_deep_scan() {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        let mut rows: Vec<Candle> = (0..4).map(candle).collect();
        rows[2].close = f64::NAN;
        store.write(&key(), &rows).unwrap();

        let mut deep = target(0, 3);
        deep.deep = true;
        let report = verify_store(&store, &key(), &deep).unwrap();
        assert!(report.is_corrupt());
        assert_eq!(store.load_lenient(&key()).unwrap().dropped_rows, 1);
    }

    #[test]
    fn summary_counts_healthy_stores() {
        let healthy = GapReport::healthy(key());
        let mut broken = GapReport::healthy(StoreKey::new("ETHUSDT", Interval::M1).unwrap());
        broken.issues.push(StoreIssue::Empty);

        let summary = VerifySummary::from_reports(vec![healthy, broken]);
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.reports[0].key.symbol, "ETHUSDT");
    }
}
