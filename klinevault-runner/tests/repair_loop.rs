//! Integration tests for verify → repair against a scripted venue.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use klinevault_core::data::{
    verify_store, CsvStore, FetchSettings, GapReport, RetryPolicy, StoreIssue, Venue, VenueError,
    VerifyTarget,
};
use klinevault_core::domain::{Candle, GapRange, Interval, StoreKey, Symbol};
use klinevault_core::testing::{synthetic_series, ScriptedVenue};
use klinevault_runner::{verify_stores, RepairOutcome, Repairer};

const CANDLES: usize = 120;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn minute(n: usize) -> DateTime<Utc> {
    t0() + chrono::Duration::minutes(n as i64)
}

fn target() -> VerifyTarget {
    VerifyTarget {
        interval: Interval::M1,
        start: t0(),
        end: minute(CANDLES - 1),
        tolerance: chrono::Duration::zero(),
        deep: false,
    }
}

fn repairer<'a>(venue: &'a dyn Venue, store: &'a CsvStore) -> Repairer<'a> {
    Repairer {
        venue,
        store,
        settings: FetchSettings {
            page_size: 50,
            request_delay: Duration::ZERO,
            retry: RetryPolicy::immediate(2),
        },
        target: target(),
        max_rounds: 3,
        workers: 2,
        archive: None,
    }
}

fn key(symbol: &str) -> StoreKey {
    StoreKey::new(symbol, Interval::M1).unwrap()
}

fn verify(store: &CsvStore, symbol: &str) -> GapReport {
    verify_store(store, &key(symbol), &target()).unwrap()
}

fn without(series: &[Candle], hole: std::ops::Range<usize>) -> Vec<Candle> {
    series
        .iter()
        .enumerate()
        .filter(|(i, _)| !hole.contains(i))
        .map(|(_, c)| *c)
        .collect()
}

#[test]
fn internal_gap_is_fetched_and_merged() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let series = synthetic_series(t0(), Interval::M1, CANDLES);
    store.write(&key("BTCUSDT"), &without(&series, 40..55)).unwrap();

    let report = verify(&store, "BTCUSDT");
    assert_eq!(report.missing, vec![GapRange::new(minute(40), minute(54))]);

    let venue = ScriptedVenue::new().with_series("BTCUSDT", series.clone());
    let repaired = repairer(&venue, &store).repair(&[report], None).unwrap();

    assert_eq!(
        repaired.results[0].outcome,
        RepairOutcome::Resolved {
            rounds: 1,
            rows_added: 15
        }
    );
    assert_eq!(venue.requests("BTCUSDT"), 1);
    assert_eq!(store.load(&key("BTCUSDT")).unwrap(), series);
    assert!(!verify(&store, "BTCUSDT").needs_repair());
}

/// Snapshots the store file every time a page is requested.
struct StoreWatcher {
    inner: ScriptedVenue,
    path: std::path::PathBuf,
    snapshots: Mutex<Vec<Vec<u8>>>,
}

impl Venue for StoreWatcher {
    fn name(&self) -> &str {
        "store_watcher"
    }
    fn exchange_info(&self) -> Result<Vec<Symbol>, VenueError> {
        self.inner.exchange_info()
    }
    fn klines(
        &self,
        symbol: &str,
        interval: Interval,
        since: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        let bytes = std::fs::read(&self.path).unwrap();
        self.snapshots.lock().unwrap().push(bytes);
        self.inner.klines(symbol, interval, since, end, limit)
    }
    fn is_available(&self) -> bool {
        self.inner.is_available()
    }
}

#[test]
fn all_gaps_of_a_round_share_one_store_write() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let series = synthetic_series(t0(), Interval::M1, CANDLES);
    let holed: Vec<Candle> = series
        .iter()
        .enumerate()
        .filter(|(i, _)| ![10, 30, 50, 70, 90].contains(i))
        .map(|(_, c)| *c)
        .collect();
    store.write(&key("BTCUSDT"), &holed).unwrap();
    let path = store.path(&key("BTCUSDT"));
    let before = std::fs::read(&path).unwrap();

    let report = verify(&store, "BTCUSDT");
    assert_eq!(report.missing.len(), 5);

    let venue = StoreWatcher {
        inner: ScriptedVenue::new().with_series("BTCUSDT", series.clone()),
        path,
        snapshots: Mutex::new(Vec::new()),
    };
    let mut repairer = repairer(&venue, &store);
    repairer.workers = 1;
    let repaired = repairer.repair(&[report], None).unwrap();

    assert_eq!(
        repaired.results[0].outcome,
        RepairOutcome::Resolved {
            rounds: 1,
            rows_added: 5
        }
    );
    // No gap saw a store rewritten by an earlier gap of the same round.
    let snapshots = venue.snapshots.lock().unwrap();
    assert_eq!(snapshots.len(), 5);
    assert!(snapshots.iter().all(|s| *s == before));
    assert_eq!(store.load(&key("BTCUSDT")).unwrap(), series);
}

#[test]
fn gap_the_venue_cannot_fill_is_unresolved() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let series = synthetic_series(t0(), Interval::M1, CANDLES);
    let holed = without(&series, 70..80);
    store.write(&key("ETHUSDT"), &holed).unwrap();

    // The venue is missing the same candles (exchange maintenance).
    let venue = ScriptedVenue::new().with_series("ETHUSDT", holed.clone());
    let repaired = repairer(&venue, &store)
        .repair(&[verify(&store, "ETHUSDT")], None)
        .unwrap();

    assert!(!repaired.all_resolved());
    match &repaired.results[0].outcome {
        RepairOutcome::Unresolved {
            remaining,
            rows_added,
            last_error,
            ..
        } => {
            assert_eq!(remaining, &vec![GapRange::new(minute(70), minute(79))]);
            assert_eq!(*rows_added, 0);
            assert!(last_error.is_none());
        }
        other => panic!("expected unresolved, got {other:?}"),
    }
    assert_eq!(store.load(&key("ETHUSDT")).unwrap(), holed);
}

#[test]
fn failing_venue_exhausts_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let series = synthetic_series(t0(), Interval::M1, CANDLES);
    store.write(&key("SOLUSDT"), &without(&series, 10..20)).unwrap();

    let venue = ScriptedVenue::new()
        .with_series("SOLUSDT", series)
        .failing("SOLUSDT");
    let repaired = repairer(&venue, &store)
        .repair(&[verify(&store, "SOLUSDT")], None)
        .unwrap();

    match &repaired.results[0].outcome {
        RepairOutcome::Unresolved {
            rounds, last_error, ..
        } => {
            assert_eq!(*rounds, 3);
            assert!(last_error.is_some());
        }
        other => panic!("expected unresolved, got {other:?}"),
    }
    // Two attempts per round, three rounds.
    assert_eq!(venue.requests("SOLUSDT"), 6);
}

#[test]
fn missing_store_is_backfilled() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let series = synthetic_series(t0(), Interval::M1, CANDLES);
    let venue = ScriptedVenue::new().with_series("XRPUSDT", series.clone());

    let report = verify(&store, "XRPUSDT");
    assert_eq!(report.issues, vec![StoreIssue::Missing]);

    let repaired = repairer(&venue, &store).repair(&[report], None).unwrap();
    assert!(repaired.all_resolved());
    assert_eq!(store.load(&key("XRPUSDT")).unwrap(), series);
}

#[test]
fn corrupt_store_is_rebuilt_then_filled() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let series = synthetic_series(t0(), Interval::M1, CANDLES);
    store.write(&key("ADAUSDT"), &series).unwrap();

    // Damage one row in the middle of the file.
    let path = store.path(&key("ADAUSDT"));
    let text = std::fs::read_to_string(&path).unwrap();
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    lines[31] = "2025-01-01 00:30:00+00:00,oops,1,1,1,1".to_string();
    lines.push(lines[60].clone());
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();

    let report = verify(&store, "ADAUSDT");
    assert!(report.is_corrupt(), "{report:?}");

    let venue = ScriptedVenue::new().with_series("ADAUSDT", series.clone());
    let repaired = repairer(&venue, &store).repair(&[report], None).unwrap();

    assert!(repaired.all_resolved(), "{repaired:?}");
    assert_eq!(store.load(&key("ADAUSDT")).unwrap(), series);
}

#[test]
fn verify_then_repair_across_symbols() {
    let dir = tempfile::tempdir().unwrap();
    let store = CsvStore::new(dir.path());
    let series = synthetic_series(t0(), Interval::M1, CANDLES);
    store.write(&key("BTCUSDT"), &series).unwrap();
    store.write(&key("ETHUSDT"), &series[..100]).unwrap();
    store.write(&key("SOLUSDT"), &series[20..]).unwrap();

    let venue = ScriptedVenue::new()
        .with_series("BTCUSDT", series.clone())
        .with_series("ETHUSDT", series.clone())
        .with_series("SOLUSDT", series.clone());

    let keys = store.list_keys(Interval::M1).unwrap();
    let summary = verify_stores(&store, &keys, &target(), 3).unwrap();
    assert_eq!(summary.checked, 3);
    assert_eq!(summary.healthy, 1);

    let repaired = repairer(&venue, &store).repair(&summary.reports, None).unwrap();
    assert_eq!(repaired.resolved(), 2);
    assert_eq!(repaired.rows_added(), 40);
    assert_eq!(venue.requests("BTCUSDT"), 0);

    let after = verify_stores(&store, &keys, &target(), 3).unwrap();
    assert!(after.all_healthy());
}
