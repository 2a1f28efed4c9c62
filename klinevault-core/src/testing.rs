//! In-memory venue and archive with scripted behaviour for deterministic tests.
//!
//! Enabled for this crate's own tests and, through the `testing` feature, for
//! downstream crates' tests.

use crate::data::{Archive, ArchivePeriod, Venue, VenueError};
use crate::domain::{Candle, Interval, Symbol};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Deterministic series of `count` candles starting at `start`.
pub fn synthetic_series(start: DateTime<Utc>, interval: Interval, count: usize) -> Vec<Candle> {
    (0..count)
        .map(|i| {
            let base = 100.0 + (i % 97) as f64 * 0.5;
            Candle {
                open_time: start + interval.duration() * i as i32,
                open: base,
                high: base + 1.0,
                low: base - 1.0,
                close: base + 0.25,
                volume: 10.0 + (i % 13) as f64,
            }
        })
        .collect()
}

#[derive(Default)]
pub struct ScriptedVenue {
    series: BTreeMap<String, Vec<Candle>>,
    delisted: Vec<Symbol>,
    always_failing: HashSet<String>,
    transient_failures: Mutex<HashMap<String, u32>>,
    stalled: bool,
    unavailable: AtomicBool,
    requests: Mutex<HashMap<String, usize>>,
}

impl ScriptedVenue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `candles` for `symbol`; the symbol is listed as a tradable perpetual.
    pub fn with_series(mut self, symbol: &str, mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.open_time);
        self.series.insert(symbol.to_string(), candles);
        self
    }

    /// List a non-tradable symbol in `exchange_info`.
    pub fn with_delisted(mut self, symbol: &str) -> Self {
        self.delisted.push(listing(symbol, "SETTLING"));
        self
    }

    /// Every klines request for `symbol` fails with a server error.
    pub fn failing(mut self, symbol: &str) -> Self {
        self.always_failing.insert(symbol.to_string());
        self
    }

    /// The first `times` klines requests for `symbol` time out.
    pub fn flaky(self, symbol: &str, times: u32) -> Self {
        self.transient_failures
            .lock()
            .unwrap()
            .insert(symbol.to_string(), times);
        self
    }

    /// Ignore the cursor and always serve the first page of the series.
    pub fn stalled(mut self) -> Self {
        self.stalled = true;
        self
    }

    /// Simulate an open circuit breaker from now on.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Klines requests received for `symbol`, failed ones included.
    pub fn requests(&self, symbol: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .get(symbol)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_requests(&self) -> usize {
        self.requests.lock().unwrap().values().sum()
    }
}

fn listing(symbol: &str, status: &str) -> Symbol {
    Symbol {
        name: symbol.to_string(),
        base_asset: symbol.trim_end_matches("USDT").to_string(),
        quote_asset: "USDT".to_string(),
        contract_type: "PERPETUAL".to_string(),
        status: status.to_string(),
    }
}

impl Venue for ScriptedVenue {
    fn name(&self) -> &str {
        "scripted"
    }

    fn exchange_info(&self) -> Result<Vec<Symbol>, VenueError> {
        if !self.is_available() {
            return Err(VenueError::CircuitBreakerOpen);
        }
        Ok(self
            .series
            .keys()
            .map(|s| listing(s, "TRADING"))
            .chain(self.delisted.iter().cloned())
            .collect())
    }

    fn klines(
        &self,
        symbol: &str,
        _interval: Interval,
        since: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError> {
        if !self.is_available() {
            return Err(VenueError::CircuitBreakerOpen);
        }
        *self
            .requests
            .lock()
            .unwrap()
            .entry(symbol.to_string())
            .or_default() += 1;

        if self.always_failing.contains(symbol) {
            return Err(VenueError::ServerError {
                status: 500,
                message: "scripted failure".to_string(),
            });
        }
        if let Some(left) = self.transient_failures.lock().unwrap().get_mut(symbol) {
            if *left > 0 {
                *left -= 1;
                return Err(VenueError::Timeout("scripted timeout".to_string()));
            }
        }

        let Some(series) = self.series.get(symbol) else {
            return Err(VenueError::SymbolNotFound {
                symbol: symbol.to_string(),
            });
        };

        if self.stalled {
            return Ok(series.iter().take(limit).copied().collect());
        }
        Ok(series
            .iter()
            .filter(|c| since <= c.open_time && c.open_time <= end)
            .take(limit)
            .copied()
            .collect())
    }

    fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }
}

/// Archive that publishes every file of its series, except the ones marked
/// unpublished.
#[derive(Default)]
pub struct ScriptedArchive {
    series: BTreeMap<String, Vec<Candle>>,
    unpublished: HashSet<ArchivePeriod>,
    failing: bool,
    requested: Mutex<Vec<ArchivePeriod>>,
}

impl ScriptedArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_series(mut self, symbol: &str, mut candles: Vec<Candle>) -> Self {
        candles.sort_by_key(|c| c.open_time);
        self.series.insert(symbol.to_string(), candles);
        self
    }

    /// Answer "not published" for `period`.
    pub fn unpublished(mut self, period: ArchivePeriod) -> Self {
        self.unpublished.insert(period);
        self
    }

    /// Every download fails with a server error.
    pub fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    /// Files requested so far, in request order.
    pub fn requested(&self) -> Vec<ArchivePeriod> {
        self.requested.lock().unwrap().clone()
    }
}

impl Archive for ScriptedArchive {
    fn name(&self) -> &str {
        "scripted_archive"
    }

    fn candles(
        &self,
        symbol: &str,
        _interval: Interval,
        period: ArchivePeriod,
    ) -> Result<Option<Vec<Candle>>, VenueError> {
        self.requested.lock().unwrap().push(period);
        if self.failing {
            return Err(VenueError::ServerError {
                status: 503,
                message: "scripted archive failure".to_string(),
            });
        }
        if self.unpublished.contains(&period) {
            return Ok(None);
        }
        let rows: Vec<Candle> = self
            .series
            .get(symbol)
            .map(|series| {
                series
                    .iter()
                    .filter(|c| period.contains(c.open_time))
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        Ok((!rows.is_empty()).then_some(rows))
    }
}
