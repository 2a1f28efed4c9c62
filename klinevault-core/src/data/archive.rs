//! Bulk history from the Binance Vision kline archives.
//!
//! Closed months are published as one ZIP per symbol and interval, closed
//! days of the current month as one ZIP per day. A long window is filled from
//! those files first; whatever they do not cover (today, unpublished files,
//! failed downloads) is fetched page by page from the REST venue.

use super::binance::{transport_error, truncate};
use super::fetch::{FetchError, FetchReport, FetchSettings, FetchWorker};
use super::venue::{Venue, VenueError};
use crate::domain::{Candle, FetchWindow, Interval};
use chrono::{DateTime, Datelike, Duration, Months, NaiveDate, NaiveTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::Cursor;
use tracing::{debug, info, warn};
use zip::ZipArchive;

pub const VISION_BASE_URL: &str = "https://data.binance.vision";

/// Open times at or above this are microseconds, not milliseconds.
const MICROS_THRESHOLD: i64 = 100_000_000_000_000;

const FIELDS: [&str; 6] = ["open_time", "open", "high", "low", "close", "volume"];

/// One archive file's coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ArchivePeriod {
    /// Whole calendar month; holds the first day of the month.
    Monthly(NaiveDate),
    Daily(NaiveDate),
}

impl ArchivePeriod {
    pub fn month_of(day: NaiveDate) -> Self {
        ArchivePeriod::Monthly(month_start(day))
    }

    pub fn first_day(self) -> NaiveDate {
        match self {
            ArchivePeriod::Monthly(first) | ArchivePeriod::Daily(first) => first,
        }
    }

    pub fn last_day(self) -> NaiveDate {
        match self {
            ArchivePeriod::Monthly(first) => first
                .checked_add_months(Months::new(1))
                .and_then(|next| next.pred_opt())
                .unwrap_or(NaiveDate::MAX),
            ArchivePeriod::Daily(day) => day,
        }
    }

    pub fn is_monthly(self) -> bool {
        matches!(self, ArchivePeriod::Monthly(_))
    }

    pub fn days(self) -> impl Iterator<Item = NaiveDate> {
        let last = self.last_day();
        self.first_day().iter_days().take_while(move |d| *d <= last)
    }

    /// Whether `ts` falls on one of this period's days.
    pub fn contains(self, ts: DateTime<Utc>) -> bool {
        let day = ts.date_naive();
        self.first_day() <= day && day <= self.last_day()
    }

    /// Path of the file below the archive root.
    pub fn path(self, symbol: &str, interval: Interval) -> String {
        let (kind, stamp) = match self {
            ArchivePeriod::Monthly(first) => ("monthly", first.format("%Y-%m")),
            ArchivePeriod::Daily(day) => ("daily", day.format("%Y-%m-%d")),
        };
        format!("data/futures/um/{kind}/klines/{symbol}/{interval}/{symbol}-{interval}-{stamp}.zip")
    }
}

impl fmt::Display for ArchivePeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArchivePeriod::Monthly(first) => write!(f, "month {}", first.format("%Y-%m")),
            ArchivePeriod::Daily(day) => write!(f, "day {day}"),
        }
    }
}

/// Source of published kline archive files.
pub trait Archive: Send + Sync {
    fn name(&self) -> &str;

    /// Candles of one archive file, or `Ok(None)` when it is not published.
    fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        period: ArchivePeriod,
    ) -> Result<Option<Vec<Candle>>, VenueError>;
}

pub struct BinanceVision {
    client: reqwest::blocking::Client,
    base_url: String,
}

impl BinanceVision {
    pub fn new(timeout: std::time::Duration) -> Result<Self, VenueError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("klinevault/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| VenueError::NetworkUnreachable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: VISION_BASE_URL.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

impl Archive for BinanceVision {
    fn name(&self) -> &str {
        "binance_vision"
    }

    fn candles(
        &self,
        symbol: &str,
        interval: Interval,
        period: ArchivePeriod,
    ) -> Result<Option<Vec<Candle>>, VenueError> {
        let url = format!("{}/{}", self.base_url, period.path(symbol, interval));
        debug!(%url, "archive request");

        let resp = self.client.get(&url).send().map_err(transport_error)?;
        let status = resp.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(VenueError::RateLimited {
                retry_after_secs: None,
            });
        }
        if status.is_server_error() {
            let body = resp.text().unwrap_or_default();
            return Err(VenueError::ServerError {
                status: status.as_u16(),
                message: truncate(&body),
            });
        }
        // The bucket answers 404 (or 403) for files that do not exist.
        if !status.is_success() {
            return Ok(None);
        }

        let bytes = resp.bytes().map_err(transport_error)?;
        decode_archive(&bytes).map(Some)
    }
}

/// Decode a kline ZIP: one CSV entry, optional `open_time,...` header.
pub fn decode_archive(bytes: &[u8]) -> Result<Vec<Candle>, VenueError> {
    let bad = |reason: String| VenueError::ResponseFormatChanged(format!("kline archive: {reason}"));

    let mut zip = ZipArchive::new(Cursor::new(bytes)).map_err(|e| bad(e.to_string()))?;
    let entry = zip.by_index(0).map_err(|e| bad(e.to_string()))?;
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(entry);

    let mut candles = Vec::new();
    for (i, record) in rdr.records().enumerate() {
        let record = record.map_err(|e| bad(format!("row {i}: {e}")))?;
        if i == 0
            && record
                .get(0)
                .is_some_and(|f| f.trim().eq_ignore_ascii_case(FIELDS[0]))
        {
            continue;
        }
        let candle = parse_archive_row(&record).map_err(|reason| bad(format!("row {i}: {reason}")))?;
        candles.push(candle);
    }
    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

fn parse_archive_row(record: &csv::StringRecord) -> Result<Candle, String> {
    if record.len() < FIELDS.len() {
        return Err(format!(
            "expected at least {} fields, got {}",
            FIELDS.len(),
            record.len()
        ));
    }
    let raw: i64 = record[0]
        .trim()
        .parse()
        .map_err(|e| format!("open time '{}': {e}", &record[0]))?;
    let millis = if raw >= MICROS_THRESHOLD { raw / 1000 } else { raw };
    let open_time = DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| format!("open time out of range: {raw}"))?;

    let num = |idx: usize| -> Result<f64, String> {
        record[idx]
            .trim()
            .parse::<f64>()
            .map_err(|e| format!("{} '{}': {e}", FIELDS[idx], &record[idx]))
    };
    Ok(Candle {
        open_time,
        open: num(1)?,
        high: num(2)?,
        low: num(3)?,
        close: num(4)?,
        volume: num(5)?,
    })
}

/// Files covering the days `[first, last]`, given that nothing from `today`
/// on is published: monthly files for closed months, daily files for the
/// current month.
pub fn plan_periods(first: NaiveDate, last: NaiveDate, today: NaiveDate) -> Vec<ArchivePeriod> {
    let Some(last) = today.pred_opt().map(|yesterday| yesterday.min(last)) else {
        return Vec::new();
    };
    let current_month = month_start(today);

    let mut periods = Vec::new();
    let mut day = first;
    while day <= last {
        let period = if day < current_month {
            ArchivePeriod::month_of(day)
        } else {
            ArchivePeriod::Daily(day)
        };
        periods.push(period);
        match period.last_day().succ_opt() {
            Some(next) => day = next,
            None => break,
        }
    }
    periods
}

/// Archive to try before the REST venue, for windows spanning at least
/// `min_days` days.
#[derive(Clone, Copy)]
pub struct ArchiveBackfill<'a> {
    pub archive: &'a dyn Archive,
    pub min_days: u32,
}

/// Fills a window from archive files where possible and from REST pages
/// everywhere else.
pub struct BackfillWorker<'a> {
    venue: &'a dyn Venue,
    archive: Option<ArchiveBackfill<'a>>,
    settings: &'a FetchSettings,
}

impl<'a> BackfillWorker<'a> {
    pub fn new(
        venue: &'a dyn Venue,
        archive: Option<ArchiveBackfill<'a>>,
        settings: &'a FetchSettings,
    ) -> Self {
        Self {
            venue,
            archive,
            settings,
        }
    }

    /// Fetch `window` as seen at `now`.
    ///
    /// Archive failures are not errors: the days they should have covered are
    /// fetched from REST instead. REST failures are returned as usual.
    /// Where both sources serve a candle, the REST row wins.
    pub fn fetch(&self, window: &FetchWindow, now: DateTime<Utc>) -> Result<FetchReport, FetchError> {
        let rest = FetchWorker::new(self.venue, self.settings);
        let span = window.end.signed_duration_since(window.start);
        let Some(backfill) = self
            .archive
            .filter(|b| !window.is_empty() && span >= Duration::days(i64::from(b.min_days)))
        else {
            return rest.fetch(window);
        };

        let first_day = window.start.date_naive();
        let last_day = window.end.date_naive();
        let today = now.date_naive();

        let mut collected: BTreeMap<i64, Candle> = BTreeMap::new();
        let mut covered: BTreeSet<NaiveDate> = BTreeSet::new();
        let mut report = FetchReport::default();

        for period in plan_periods(first_day, last_day, today) {
            let mut served = Vec::new();
            match self.archive_file(backfill.archive, window, period) {
                FileFetch::Served(candles) => served.push((period, candles)),
                // Last month may not be consolidated yet; its daily files are.
                FileFetch::Unpublished
                    if period.is_monthly()
                        && period.last_day().succ_opt() == Some(month_start(today)) =>
                {
                    for day in period.days().filter(|d| first_day <= *d && *d <= last_day) {
                        let daily = ArchivePeriod::Daily(day);
                        if let FileFetch::Served(candles) =
                            self.archive_file(backfill.archive, window, daily)
                        {
                            served.push((daily, candles));
                        }
                    }
                }
                FileFetch::Unpublished | FileFetch::Failed => {}
            }

            for (file, candles) in served {
                report.archive_files += 1;
                covered.extend(file.days());
                for candle in candles
                    .into_iter()
                    .filter(|c| window.contains(c.open_time) && c.is_finite())
                {
                    collected.insert(candle.open_time_ms(), candle);
                }
            }
        }
        let from_archive = collected.len();

        for part in uncovered_windows(window, &covered) {
            let fetched = rest.fetch(&part)?;
            report.pages += fetched.pages;
            report.forced_advances += fetched.forced_advances;
            for candle in fetched.candles {
                collected.insert(candle.open_time_ms(), candle);
            }
        }

        info!(
            symbol = %window.symbol,
            archive = backfill.archive.name(),
            files = report.archive_files,
            from_archive,
            rest_pages = report.pages,
            "backfill complete"
        );
        report.candles = collected.into_values().collect();
        Ok(report)
    }

    fn archive_file(
        &self,
        archive: &dyn Archive,
        window: &FetchWindow,
        period: ArchivePeriod,
    ) -> FileFetch {
        let what = format!("{} {period} archive", window.symbol);
        match self
            .settings
            .retry
            .run(&what, |_| archive.candles(&window.symbol, window.interval, period))
        {
            Ok(Some(candles)) => FileFetch::Served(candles),
            Ok(None) => {
                debug!(symbol = %window.symbol, %period, "archive file not published");
                FileFetch::Unpublished
            }
            Err(failure) => {
                warn!(
                    symbol = %window.symbol,
                    %period,
                    attempts = failure.attempts,
                    error = %failure.error,
                    "archive download failed, falling back to REST"
                );
                FileFetch::Failed
            }
        }
    }
}

enum FileFetch {
    Served(Vec<Candle>),
    Unpublished,
    Failed,
}

/// Sub-windows of `window` on days no archive file covered.
fn uncovered_windows(window: &FetchWindow, covered: &BTreeSet<NaiveDate>) -> Vec<FetchWindow> {
    let first_day = window.start.date_naive();
    let last_day = window.end.date_naive();

    let mut runs: Vec<(NaiveDate, NaiveDate)> = Vec::new();
    let mut open: Option<(NaiveDate, NaiveDate)> = None;
    for day in first_day.iter_days().take_while(|d| *d <= last_day) {
        if covered.contains(&day) {
            runs.extend(open.take());
        } else {
            open = Some(match open {
                Some((start, _)) => (start, day),
                None => (day, day),
            });
        }
    }
    runs.extend(open);

    runs.into_iter()
        .filter_map(|(first, last)| {
            let start = day_start(first).max(window.start);
            let end = last
                .succ_opt()
                .map(|next| day_start(next) - window.interval.duration())
                .unwrap_or(window.end)
                .min(window.end);
            (start <= end).then(|| FetchWindow::new(window.symbol.clone(), window.interval, start, end))
        })
        .collect()
}

fn month_start(day: NaiveDate) -> NaiveDate {
    day.with_day(1).unwrap_or(day)
}

fn day_start(day: NaiveDate) -> DateTime<Utc> {
    day.and_time(NaiveTime::MIN).and_utc()
}
