//! Repair loop: fetch the ranges a verification pass flagged and re-verify.
//!
//! Per symbol, each round:
//! 1. rebuilds a corrupt store from its parseable rows and re-verifies it
//! 2. fetches every missing range as its own window, then merges all
//!    fetched rows with a single store write
//! 3. re-verifies against the same target
//!
//! A symbol still incomplete after `max_rounds` is `Unresolved`. A round
//! that fetched nothing and saw no errors ends the loop early, since the
//! venue has no data for what is left.

use std::sync::atomic::AtomicBool;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use klinevault_core::data::{
    merge_into_store, verify_store, ArchiveBackfill, BackfillWorker, CsvStore, FetchSettings,
    GapReport, StoreError, StoreIssue, Venue, VerifyTarget,
};
use klinevault_core::domain::GapRange;

use crate::sync::{stop_reason, worker_pool, RunError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RepairOutcome {
    Resolved {
        rounds: u32,
        rows_added: usize,
    },
    Unresolved {
        rounds: u32,
        rows_added: usize,
        issues: Vec<StoreIssue>,
        remaining: Vec<GapRange>,
        last_error: Option<String>,
    },
    Skipped {
        reason: String,
    },
}

impl RepairOutcome {
    pub fn is_resolved(&self) -> bool {
        matches!(self, RepairOutcome::Resolved { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairResult {
    pub symbol: String,
    pub outcome: RepairOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepairReport {
    pub results: Vec<RepairResult>,
}

impl RepairReport {
    pub fn resolved(&self) -> usize {
        self.results.iter().filter(|r| r.outcome.is_resolved()).count()
    }

    /// Symbols left for manual follow-up (unresolved or skipped).
    pub fn unresolved(&self) -> Vec<&RepairResult> {
        self.results.iter().filter(|r| !r.outcome.is_resolved()).collect()
    }

    pub fn all_resolved(&self) -> bool {
        self.results.iter().all(|r| r.outcome.is_resolved())
    }

    pub fn rows_added(&self) -> usize {
        self.results
            .iter()
            .map(|r| match r.outcome {
                RepairOutcome::Resolved { rows_added, .. }
                | RepairOutcome::Unresolved { rows_added, .. } => rows_added,
                RepairOutcome::Skipped { .. } => 0,
            })
            .sum()
    }
}

pub struct Repairer<'a> {
    pub venue: &'a dyn Venue,
    pub store: &'a CsvStore,
    pub settings: FetchSettings,
    pub target: VerifyTarget,
    pub max_rounds: u32,
    pub workers: usize,
    /// Bulk archive tried before REST on long gaps.
    pub archive: Option<ArchiveBackfill<'a>>,
}

impl Repairer<'_> {
    /// Repair every report that needs it, in parallel.
    pub fn repair(
        &self,
        reports: &[GapReport],
        cancel: Option<&AtomicBool>,
    ) -> Result<RepairReport, RunError> {
        let pending: Vec<&GapReport> = reports.iter().filter(|r| r.needs_repair()).collect();
        if pending.is_empty() {
            return Ok(RepairReport::default());
        }

        let pool = worker_pool(self.workers)?;
        let results: Vec<RepairResult> = pool.install(|| {
            pending
                .par_iter()
                .map(|report| {
                    let outcome = match stop_reason(self.venue, None, cancel) {
                        Some(reason) => RepairOutcome::Skipped { reason },
                        None => self.repair_one(report),
                    };
                    RepairResult {
                        symbol: report.key.symbol.clone(),
                        outcome,
                    }
                })
                .collect()
        });

        let report = RepairReport { results };
        info!(
            symbols = report.results.len(),
            resolved = report.resolved(),
            unresolved = report.unresolved().len(),
            rows_added = report.rows_added(),
            "repair pass complete"
        );
        Ok(report)
    }

    fn repair_one(&self, initial: &GapReport) -> RepairOutcome {
        let key = &initial.key;
        let mut current = initial.clone();
        let mut rows_added = 0;
        let mut last_error = None;
        let mut rounds = 0;
        // Clock for archive planning: the target's last candle has closed.
        let now = self
            .target
            .end
            .checked_add_signed(self.target.interval.duration())
            .unwrap_or(self.target.end);

        while rounds < self.max_rounds {
            if !self.venue.is_available() {
                last_error = Some("venue unavailable (circuit breaker open)".to_string());
                break;
            }
            rounds += 1;

            if current.is_corrupt() {
                match self.rebuild(&current) {
                    Ok(report) => current = report,
                    Err(e) => {
                        warn!(%key, error = %e, "rebuild failed");
                        last_error = Some(e.to_string());
                        break;
                    }
                }
                if !current.needs_repair() {
                    return RepairOutcome::Resolved { rounds, rows_added };
                }
            }

            // Gaps are fetched independently; the store is rewritten once per round.
            let mut fetched = Vec::new();
            let mut round_errors = 0;
            for gap in &current.missing {
                let window = gap.to_window(&key.symbol, key.interval);
                match self.source().fetch(&window, now) {
                    Ok(report) => fetched.extend(report.candles),
                    Err(e) => {
                        warn!(
                            %key,
                            start = %gap.start,
                            end = %gap.end,
                            error = %e,
                            "gap fetch failed"
                        );
                        last_error = Some(e.to_string());
                        round_errors += 1;
                    }
                }
            }
            let round_added = match merge_into_store(self.store, key, &fetched) {
                Ok(outcome) => outcome.rows_added,
                Err(e) => {
                    warn!(%key, error = %e, "merge failed");
                    last_error = Some(e.to_string());
                    round_errors += 1;
                    0
                }
            };
            rows_added += round_added;

            current = match verify_store(self.store, key, &self.target) {
                Ok(report) => report,
                Err(e) => {
                    last_error = Some(e.to_string());
                    break;
                }
            };
            if !current.needs_repair() {
                info!(%key, rounds, rows_added, "repaired");
                return RepairOutcome::Resolved { rounds, rows_added };
            }
            if round_added == 0 && round_errors == 0 {
                break;
            }
        }

        warn!(
            %key,
            rounds,
            remaining = current.missing.len(),
            "gaps remain after repair"
        );
        RepairOutcome::Unresolved {
            rounds,
            rows_added,
            issues: current.issues,
            remaining: current.missing,
            last_error,
        }
    }

    fn source(&self) -> BackfillWorker<'_> {
        BackfillWorker::new(self.venue, self.archive, &self.settings)
    }

    /// Rewrite a corrupt store from its salvageable rows, then re-verify it.
    fn rebuild(&self, report: &GapReport) -> Result<GapReport, StoreError> {
        let key = &report.key;
        let salvage = self.store.load_lenient(key)?;
        warn!(
            %key,
            kept = salvage.candles.len(),
            dropped = salvage.dropped_rows,
            duplicates = salvage.duplicate_rows,
            "rebuilding corrupt store"
        );
        self.store.write(key, &salvage.candles)?;
        verify_store(self.store, key, &self.target)
    }
}
