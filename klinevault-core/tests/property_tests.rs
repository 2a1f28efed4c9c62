//! Property tests for merge invariants.
//!
//! Uses proptest to verify:
//! 1. Ordering: merged series have strictly increasing, unique open times
//! 2. Coverage: every input timestamp survives the merge exactly once
//! 3. Precedence: fresh rows replace stored rows with the same open time
//! 4. Empty batches never change a store

use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeSet;
use klinevault_core::data::{merge_candles, merge_into_store, CsvStore};
use klinevault_core::domain::{Candle, Interval, StoreKey};

// ── Strategies (proptest) ────────────────────────────────────────────

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn candle_at(offset: i64, price: f64) -> Candle {
    Candle {
        open_time: t0() + Duration::minutes(offset),
        open: price,
        high: price + 1.0,
        low: price - 1.0,
        close: price,
        volume: 1.0,
    }
}

fn arb_price() -> impl Strategy<Value = f64> {
    (10.0..500.0_f64).prop_map(|p| (p * 100.0).round() / 100.0)
}

/// Unordered candles with repeated open times drawn from a small range.
fn arb_batch() -> impl Strategy<Value = Vec<Candle>> {
    prop::collection::vec((0i64..200, arb_price()), 0..120)
        .prop_map(|rows| rows.into_iter().map(|(o, p)| candle_at(o, p)).collect())
}

fn strictly_increasing(candles: &[Candle]) -> bool {
    candles.windows(2).all(|w| w[0].open_time < w[1].open_time)
}

// ── 1-3. Pure merge ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn merge_output_is_sorted_and_unique(existing in arb_batch(), fresh in arb_batch()) {
        let (merged, outcome) = merge_candles(&existing, &fresh);
        prop_assert!(strictly_increasing(&merged));
        prop_assert_eq!(outcome.rows_after, merged.len());
    }

    #[test]
    fn merge_keeps_every_timestamp_once(existing in arb_batch(), fresh in arb_batch()) {
        let (merged, _) = merge_candles(&existing, &fresh);
        let expected: BTreeSet<DateTime<Utc>> =
            existing.iter().chain(fresh.iter()).map(|c| c.open_time).collect();
        let actual: Vec<DateTime<Utc>> = merged.iter().map(|c| c.open_time).collect();
        prop_assert_eq!(actual, expected.into_iter().collect::<Vec<_>>());
    }

    #[test]
    fn fresh_rows_take_precedence(existing in arb_batch(), fresh in arb_batch()) {
        let (merged, _) = merge_candles(&existing, &fresh);
        for c in &merged {
            if let Some(latest_fresh) = fresh.iter().rev().find(|f| f.open_time == c.open_time) {
                prop_assert_eq!(c, latest_fresh);
            }
        }
    }

    #[test]
    fn merging_nothing_changes_nothing(existing in arb_batch()) {
        let (once, _) = merge_candles(&[], &existing);
        let (again, outcome) = merge_candles(&once, &[]);
        prop_assert_eq!(&again, &once);
        prop_assert!(!outcome.changed());
    }
}

// ── 4. Store-level no-op ─────────────────────────────────────────────

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn empty_batch_leaves_store_bytes_untouched(existing in arb_batch()) {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvStore::new(dir.path());
        let key = StoreKey::new("BTCUSDT", Interval::M1).unwrap();

        merge_into_store(&store, &key, &existing).unwrap();
        let before = std::fs::read(store.path(&key)).ok();

        let outcome = merge_into_store(&store, &key, &[]).unwrap();
        prop_assert!(!outcome.written);
        prop_assert_eq!(std::fs::read(store.path(&key)).ok(), before);
    }
}
