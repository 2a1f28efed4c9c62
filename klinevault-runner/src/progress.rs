//! Human-facing progress reporting for batch runs.
//!
//! Called from worker threads, so implementations must be `Sync`. Logging
//! goes through `tracing` separately; these callbacks are for the console.

use crate::sync::SymbolStatus;
use std::sync::atomic::{AtomicUsize, Ordering};

pub trait SyncProgress: Send + Sync {
    /// Called before a symbol's task starts.
    fn on_start(&self, symbol: &str, total: usize);

    /// Called when a symbol's task finishes, in completion order.
    fn on_complete(&self, symbol: &str, total: usize, status: &SymbolStatus);

    /// Called once after every task has been collected.
    fn on_batch_complete(&self, updated: usize, failed: usize, total: usize);
}

/// Prints one line per completed symbol.
#[derive(Default)]
pub struct StdoutProgress {
    done: AtomicUsize,
}

impl StdoutProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncProgress for StdoutProgress {
    fn on_start(&self, _symbol: &str, _total: usize) {}

    fn on_complete(&self, symbol: &str, total: usize, status: &SymbolStatus) {
        let n = self.done.fetch_add(1, Ordering::Relaxed) + 1;
        match status {
            SymbolStatus::Updated { rows_added, last } => {
                println!("[{n}/{total}] OK: {symbol} +{rows_added} rows (last {last})")
            }
            SymbolStatus::UpToDate => println!("[{n}/{total}] OK: {symbol} up to date"),
            SymbolStatus::Failed(reason) => println!("[{n}/{total}] FAIL: {symbol}: {reason}"),
            SymbolStatus::Skipped(reason) => println!("[{n}/{total}] SKIP: {symbol}: {reason}"),
        }
    }

    fn on_batch_complete(&self, updated: usize, failed: usize, total: usize) {
        println!("\nDone: {updated} updated, {failed} failed, {total} total");
    }
}

/// Discards every callback.
pub struct SilentProgress;

impl SyncProgress for SilentProgress {
    fn on_start(&self, _symbol: &str, _total: usize) {}
    fn on_complete(&self, _symbol: &str, _total: usize, _status: &SymbolStatus) {}
    fn on_batch_complete(&self, _updated: usize, _failed: usize, _total: usize) {}
}
