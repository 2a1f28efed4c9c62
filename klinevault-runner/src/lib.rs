//! KlineVault Runner: batch sync, verification, repair, configuration.
//!
//! This crate builds on `klinevault-core` to provide:
//! - TOML configuration with defaults and validation
//! - Batch sync over a bounded worker pool with per-symbol isolation
//! - Parallel store verification
//! - Repair loop driven by verification reports
//! - Progress callbacks and serializable batch/repair reports

pub mod config;
pub mod progress;
pub mod repair;
pub mod sync;
pub mod verify;

pub use config::{ConfigError, SyncConfig};
pub use progress::{SilentProgress, StdoutProgress, SyncProgress};
pub use repair::{RepairOutcome, RepairReport, RepairResult, Repairer};
pub use sync::{dedup_symbols, BatchReport, RunError, SymbolResult, SymbolStatus, SyncJob};
pub use verify::{verification_keys, verify_stores};
