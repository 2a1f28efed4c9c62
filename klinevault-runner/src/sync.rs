//! Batch sync: checkpoint, fetch and merge every symbol on a bounded pool.
//!
//! Each symbol is an independent task on a private rayon pool of `workers`
//! threads. Task outcomes come back through the parallel `collect` into a
//! `BatchReport`; a failing symbol never affects its siblings.
//!
//! Before a task starts it checks, in order:
//! - the cancel flag
//! - the batch deadline
//! - whether the venue still accepts requests (circuit breaker)
//!
//! and records the symbol as `Skipped` if any of them says stop.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use klinevault_core::data::{
    merge_into_store, resolve_checkpoint, ArchiveBackfill, BackfillWorker, Checkpoint, CsvStore,
    FetchSettings, Venue,
};
use klinevault_core::domain::{normalize_symbol, Interval, StoreKey};

use crate::progress::SyncProgress;

/// Errors that abort a whole batch (per-symbol failures never do).
#[derive(Debug, Error)]
pub enum RunError {
    #[error("no symbols to process")]
    NoSymbols,

    #[error("failed to build worker pool: {0}")]
    ThreadPool(String),

    #[error("store listing failed: {0}")]
    Store(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SymbolStatus {
    Updated {
        rows_added: usize,
        last: DateTime<Utc>,
    },
    UpToDate,
    Failed(String),
    Skipped(String),
}

impl SymbolStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, SymbolStatus::Updated { .. } | SymbolStatus::UpToDate)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolResult {
    pub symbol: String,
    pub status: SymbolStatus,
}

/// Outcome of one sync batch, in symbol order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub interval: Interval,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub results: Vec<SymbolResult>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn updated(&self) -> usize {
        self.count(|s| matches!(s, SymbolStatus::Updated { .. }))
    }

    pub fn up_to_date(&self) -> usize {
        self.count(|s| matches!(s, SymbolStatus::UpToDate))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, SymbolStatus::Failed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|s| matches!(s, SymbolStatus::Skipped(_)))
    }

    pub fn rows_added(&self) -> usize {
        self.results
            .iter()
            .map(|r| match r.status {
                SymbolStatus::Updated { rows_added, .. } => rows_added,
                _ => 0,
            })
            .sum()
    }

    /// Symbols that failed or were skipped.
    pub fn needs_attention(&self) -> Vec<&SymbolResult> {
        self.results.iter().filter(|r| !r.status.is_ok()).collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|r| r.status.is_ok())
    }

    fn count(&self, pred: impl Fn(&SymbolStatus) -> bool) -> usize {
        self.results.iter().filter(|r| pred(&r.status)).count()
    }
}

/// Everything a batch needs besides the symbol list.
pub struct SyncJob<'a> {
    pub venue: &'a dyn Venue,
    pub store: &'a CsvStore,
    pub interval: Interval,
    pub lookback: chrono::Duration,
    pub settings: FetchSettings,
    pub workers: usize,
    pub batch_timeout: Option<Duration>,
    /// Bulk archive tried before REST on long windows.
    pub archive: Option<ArchiveBackfill<'a>>,
}

impl SyncJob<'_> {
    /// Bring every symbol's store up to the last closed candle at `now`.
    pub fn run(
        &self,
        symbols: &[String],
        now: DateTime<Utc>,
        progress: &dyn SyncProgress,
        cancel: Option<&AtomicBool>,
    ) -> Result<BatchReport, RunError> {
        let symbols = dedup_symbols(symbols);
        if symbols.is_empty() {
            return Err(RunError::NoSymbols);
        }

        let started_at = Utc::now();
        let start = Instant::now();
        let deadline = self.batch_timeout.map(|t| start + t);
        let total = symbols.len();
        let pool = worker_pool(self.workers)?;

        info!(
            symbols = total,
            workers = self.workers,
            interval = %self.interval,
            "starting sync batch"
        );

        let results: Vec<SymbolResult> = pool.install(|| {
            symbols
                .par_iter()
                .map(|symbol| {
                    let status = match stop_reason(self.venue, deadline, cancel) {
                        Some(reason) => SymbolStatus::Skipped(reason),
                        None => {
                            progress.on_start(symbol, total);
                            self.sync_symbol(symbol, now)
                        }
                    };
                    progress.on_complete(symbol, total, &status);
                    SymbolResult {
                        symbol: symbol.clone(),
                        status,
                    }
                })
                .collect()
        });

        let report = BatchReport {
            interval: self.interval,
            started_at,
            elapsed_ms: start.elapsed().as_millis() as u64,
            results,
        };
        progress.on_batch_complete(report.updated(), report.failed(), total);
        info!(
            updated = report.updated(),
            up_to_date = report.up_to_date(),
            failed = report.failed(),
            skipped = report.skipped(),
            rows_added = report.rows_added(),
            elapsed_ms = report.elapsed_ms,
            "sync batch complete"
        );
        Ok(report)
    }

    /// Checkpoint, fetch and merge for one symbol.
    fn sync_symbol(&self, symbol: &str, now: DateTime<Utc>) -> SymbolStatus {
        let key = match StoreKey::new(symbol, self.interval) {
            Ok(key) => key,
            Err(e) => return SymbolStatus::Failed(e.to_string()),
        };

        let window = match resolve_checkpoint(self.store, &key, self.lookback, now) {
            Ok(Checkpoint::Fetch(window)) => window,
            Ok(Checkpoint::UpToDate { .. }) => return SymbolStatus::UpToDate,
            Err(e) => {
                warn!(%key, error = %e, "cannot resolve checkpoint");
                return SymbolStatus::Failed(e.to_string());
            }
        };

        let worker = BackfillWorker::new(self.venue, self.archive, &self.settings);
        let report = match worker.fetch(&window, now) {
            Ok(report) => report,
            Err(e) => {
                warn!(%key, error = %e, "fetch failed");
                return SymbolStatus::Failed(e.to_string());
            }
        };

        match merge_into_store(self.store, &key, &report.candles) {
            Ok(outcome) if outcome.changed() => SymbolStatus::Updated {
                rows_added: outcome.rows_added,
                last: report
                    .candles
                    .last()
                    .map(|c| c.open_time)
                    .unwrap_or(window.end),
            },
            Ok(_) => SymbolStatus::UpToDate,
            Err(e) => {
                warn!(%key, error = %e, "merge failed");
                SymbolStatus::Failed(e.to_string())
            }
        }
    }
}

/// Normalize, sort and deduplicate so each store gets at most one task.
pub fn dedup_symbols(symbols: &[String]) -> Vec<String> {
    symbols
        .iter()
        .map(|s| normalize_symbol(s))
        .filter(|s| !s.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub(crate) fn worker_pool(workers: usize) -> Result<rayon::ThreadPool, RunError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .build()
        .map_err(|e| RunError::ThreadPool(e.to_string()))
}

/// Why a not-yet-started task should be skipped, if it should.
pub(crate) fn stop_reason(
    venue: &dyn Venue,
    deadline: Option<Instant>,
    cancel: Option<&AtomicBool>,
) -> Option<String> {
    if cancel.is_some_and(|f| f.load(Ordering::Relaxed)) {
        return Some("cancelled".to_string());
    }
    if deadline.is_some_and(|d| Instant::now() >= d) {
        return Some("batch deadline reached".to_string());
    }
    if !venue.is_available() {
        return Some("venue unavailable (circuit breaker open)".to_string());
    }
    None
}
