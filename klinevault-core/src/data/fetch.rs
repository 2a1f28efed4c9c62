//! Paginated candle retrieval for one symbol over one window.

use super::retry::RetryPolicy;
use super::venue::{Venue, VenueError};
use crate::domain::{Candle, FetchWindow};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Retrieval failed for one symbol after the retry budget was spent.
#[derive(Debug, Clone, Error)]
#[error("fetching {symbol} failed after {attempts} attempt(s): {source}")]
pub struct FetchError {
    pub symbol: String,
    pub attempts: u32,
    #[source]
    pub source: VenueError,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FetchSettings {
    /// Candles requested per page.
    pub page_size: usize,
    /// Pause between consecutive page requests.
    pub request_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            page_size: 1000,
            request_delay: Duration::from_millis(500),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchReport {
    /// Ascending, unique candles inside the window.
    pub candles: Vec<Candle>,
    pub pages: usize,
    /// Pages after which the cursor had to be pushed forward by one interval.
    pub forced_advances: usize,
    /// Archive files that contributed rows (backfill only).
    pub archive_files: usize,
}

pub struct FetchWorker<'a> {
    venue: &'a dyn Venue,
    settings: &'a FetchSettings,
}

impl<'a> FetchWorker<'a> {
    pub fn new(venue: &'a dyn Venue, settings: &'a FetchSettings) -> Self {
        Self { venue, settings }
    }

    /// Walk the window page by page.
    ///
    /// Every page advances the cursor by at least one interval, and the page
    /// count is capped at `window.candle_count() + 1`, so a venue that keeps
    /// returning the same rows cannot stall the loop.
    pub fn fetch(&self, window: &FetchWindow) -> Result<FetchReport, FetchError> {
        let mut report = FetchReport::default();
        if window.is_empty() {
            return Ok(report);
        }

        let step = window.interval.duration();
        let page_size = self.settings.page_size.max(1);
        let page_cap = window.candle_count().max(0) as usize + 1;
        let mut collected: BTreeMap<i64, Candle> = BTreeMap::new();
        let mut cursor = window.start;

        while cursor <= window.end {
            if report.pages >= page_cap {
                warn!(
                    symbol = %window.symbol,
                    pages = report.pages,
                    "page cap reached, stopping pagination"
                );
                break;
            }

            let what = format!("{} klines", window.symbol);
            let page = self
                .settings
                .retry
                .run(&what, |_| {
                    self.venue
                        .klines(&window.symbol, window.interval, cursor, window.end, page_size)
                })
                .map_err(|failure| FetchError {
                    symbol: window.symbol.clone(),
                    attempts: failure.attempts,
                    source: failure.error,
                })?;
            report.pages += 1;

            let Some(last) = page.last().map(|c| c.open_time) else {
                break;
            };

            let before = collected.len();
            for candle in page.iter().filter(|c| window.contains(c.open_time)) {
                if !candle.is_finite() {
                    warn!(
                        symbol = %window.symbol,
                        open_time = %candle.open_time,
                        "dropping non-finite candle"
                    );
                    continue;
                }
                if !candle.is_sane() {
                    debug!(
                        symbol = %window.symbol,
                        open_time = %candle.open_time,
                        "candle outside OHLC bounds"
                    );
                }
                collected.insert(candle.open_time_ms(), *candle);
            }
            debug!(
                symbol = %window.symbol,
                %cursor,
                returned = page.len(),
                kept = collected.len() - before,
                "fetched page"
            );

            let next = last + step;
            if next <= cursor {
                report.forced_advances += 1;
                cursor += step;
            } else {
                cursor = next;
            }

            if cursor <= window.end && !self.settings.request_delay.is_zero() {
                std::thread::sleep(self.settings.request_delay);
            }
        }

        report.candles = collected.into_values().collect();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Interval, Symbol};
    use chrono::{DateTime, TimeZone, Utc};
    use std::sync::Mutex;

    fn t(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + chrono::Duration::minutes(min)
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

    /// Serves a fixed page regardless of the cursor, recording every call.
    struct FixedPage {
        page: Vec<Candle>,
        calls: Mutex<Vec<DateTime<Utc>>>,
    }

    impl Venue for FixedPage {
        fn name(&self) -> &str {
            "fixed"
        }
        fn exchange_info(&self) -> Result<Vec<Symbol>, VenueError> {
            Ok(Vec::new())
        }
        fn klines(
            &self,
            _symbol: &str,
            _interval: Interval,
            since: DateTime<Utc>,
            _end: DateTime<Utc>,
            _limit: usize,
        ) -> Result<Vec<Candle>, VenueError> {
            self.calls.lock().unwrap().push(since);
            Ok(self.page.clone())
        }
        fn is_available(&self) -> bool {
            true
        }
    }

    fn settings() -> FetchSettings {
        FetchSettings {
            page_size: 3,
            request_delay: Duration::ZERO,
            retry: RetryPolicy::immediate(2),
        }
    }

    #[test]
    fn stalled_venue_forces_cursor_forward() {
        let venue = FixedPage {
            page: vec![candle(0), candle(1)],
            calls: Mutex::new(Vec::new()),
        };
        let s = settings();
        let window = FetchWindow::new("BTCUSDT", Interval::M1, t(5), t(9));

        let report = FetchWorker::new(&venue, &s).fetch(&window).unwrap();
        assert!(report.candles.is_empty());
        assert_eq!(report.pages, 5);
        assert_eq!(report.forced_advances, 5);
        assert_eq!(
            *venue.calls.lock().unwrap(),
            vec![t(5), t(6), t(7), t(8), t(9)]
        );
    }

    #[test]
    fn rows_outside_window_are_dropped() {
        let venue = FixedPage {
            page: vec![candle(1), candle(2), candle(3), candle(4)],
            calls: Mutex::new(Vec::new()),
        };
        let s = settings();
        let window = FetchWindow::new("BTCUSDT", Interval::M1, t(2), t(3));

        let report = FetchWorker::new(&venue, &s).fetch(&window).unwrap();
        let times: Vec<_> = report.candles.iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![t(2), t(3)]);
        assert_eq!(report.pages, 1);
    }

    #[test]
    fn inverted_window_makes_no_requests() {
        let venue = FixedPage {
            page: vec![candle(0)],
            calls: Mutex::new(Vec::new()),
        };
        let s = settings();
        let window = FetchWindow::new("BTCUSDT", Interval::M1, t(5), t(4));

        let report = FetchWorker::new(&venue, &s).fetch(&window).unwrap();
        assert_eq!(report, FetchReport::default());
        assert!(venue.calls.lock().unwrap().is_empty());
    }
}
