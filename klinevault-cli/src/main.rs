//! KlineVault CLI: discovery, sync, verification, repair and store status.
//!
//! Commands:
//! - `symbols`: list the tradable universe from the venue
//! - `sync`: bring every store up to the last closed candle
//! - `verify`: check stores for boundary gaps, internal gaps and corruption
//! - `repair`: verify, then fetch and merge whatever is missing
//! - `status`: per-store first/last open time, rows and size
//!
//! The first Ctrl-C during `sync` or `repair` lets running symbols finish and
//! skips the rest; a second one exits at once.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use klinevault_core::data::{
    discover_symbols, ArchiveBackfill, BinanceFutures, BinanceVision, CsvStore, Venue,
};
use klinevault_core::domain::Interval;
use klinevault_runner::{
    verification_keys, verify_stores, BatchReport, RepairOutcome, RepairReport, Repairer,
    StdoutProgress, SymbolStatus, SyncConfig, SyncJob,
};

#[derive(Parser)]
#[command(
    name = "klinevault",
    about = "KlineVault: incremental OHLCV acquisition, merge and repair"
)]
struct Cli {
    /// Path to a TOML config file. Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Store root, overriding the config.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Candle interval (1m, 5m, 1h, ...), overriding the config.
    #[arg(long, global = true)]
    interval: Option<Interval>,

    /// Worker pool size, overriding the config.
    #[arg(long, global = true)]
    workers: Option<usize>,

    /// Debug-level logging (RUST_LOG takes precedence when set).
    #[arg(long, short, global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List the tradable symbols matching the universe filter.
    Symbols,
    /// Fetch everything since each store's last row and merge it.
    Sync {
        /// Symbols to sync instead of discovering the universe.
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Write the batch report as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Check stores against the configured lookback window.
    Verify {
        /// Also check these symbols (reported missing if never synced).
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Include the discovered universe (requires network access).
        #[arg(long, default_value_t = false)]
        discover: bool,

        /// Scan every row even when the row count matches.
        #[arg(long, default_value_t = false)]
        deep: bool,

        /// Write the verification summary as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Verify, then fetch and merge every missing range.
    Repair {
        /// Also repair these symbols.
        #[arg(long, value_delimiter = ',')]
        symbols: Vec<String>,

        /// Include the discovered universe.
        #[arg(long, default_value_t = false)]
        discover: bool,

        /// Override the configured number of repair rounds.
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Write the repair report as JSON to this path.
        #[arg(long)]
        report: Option<PathBuf>,
    },
    /// Show first/last open time, row count and size of every store.
    Status,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;

    match cli.command {
        Commands::Symbols => run_symbols(&config),
        Commands::Sync { symbols, report } => run_sync(&config, symbols, report.as_deref()),
        Commands::Verify {
            symbols,
            discover,
            deep,
            report,
        } => run_verify(&config, symbols, discover, deep, report.as_deref()),
        Commands::Repair {
            symbols,
            discover,
            max_rounds,
            report,
        } => run_repair(&config, symbols, discover, max_rounds, report.as_deref()),
        Commands::Status => run_status(&config),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let mut config = match &cli.config {
        Some(path) => SyncConfig::from_file(path)?,
        None => SyncConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(interval) = cli.interval {
        config.interval = interval;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers;
    }
    config.validate()?;
    Ok(config)
}

fn build_venue(config: &SyncConfig) -> Result<BinanceFutures> {
    let breaker = Arc::new(config.circuit_breaker());
    let venue = BinanceFutures::new(breaker, config.request_timeout())?
        .with_base_url(config.fetch.base_url.as_str());
    Ok(venue)
}

fn build_archive(config: &SyncConfig) -> Result<Option<BinanceVision>> {
    if !config.archive.enabled {
        return Ok(None);
    }
    let archive = BinanceVision::new(config.request_timeout())?
        .with_base_url(config.archive.base_url.as_str());
    Ok(Some(archive))
}

/// Flag raised by the first Ctrl-C. A second Ctrl-C exits with status 130.
fn install_interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let raised = Arc::clone(&flag);
    let spawned = std::thread::Builder::new()
        .name("interrupt".into())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    warn!(error = %e, "cannot listen for Ctrl-C");
                    return;
                }
            };
            runtime.block_on(async {
                while tokio::signal::ctrl_c().await.is_ok() {
                    if !raise(&raised) {
                        warn!("second interrupt, exiting");
                        std::process::exit(130);
                    }
                    warn!("interrupt received, skipping symbols not yet started");
                }
            });
        });
    if let Err(e) = spawned {
        warn!(error = %e, "cannot listen for Ctrl-C");
    }
    flag
}

/// Raise `flag`; false if it was already raised.
fn raise(flag: &AtomicBool) -> bool {
    !flag.swap(true, Ordering::SeqCst)
}

/// Explicit symbols win; otherwise the configured list; otherwise discovery.
fn resolve_universe(config: &SyncConfig, venue: &dyn Venue, explicit: Vec<String>) -> Result<Vec<String>> {
    if !explicit.is_empty() {
        return Ok(explicit);
    }
    if !config.universe.symbols.is_empty() {
        return Ok(config.universe.symbols.clone());
    }
    Ok(discover_symbols(venue, &config.universe.filter())?)
}

fn write_report<T: Serialize>(path: Option<&Path>, report: &T) -> Result<()> {
    if let Some(path) = path {
        let json = serde_json::to_string_pretty(report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }
    Ok(())
}

fn run_symbols(config: &SyncConfig) -> Result<()> {
    let venue = build_venue(config)?;
    let symbols = discover_symbols(&venue, &config.universe.filter())?;
    for symbol in &symbols {
        println!("{symbol}");
    }
    eprintln!("{} symbols", symbols.len());
    Ok(())
}

fn run_sync(config: &SyncConfig, symbols: Vec<String>, report_path: Option<&Path>) -> Result<()> {
    let venue = build_venue(config)?;
    let archive = build_archive(config)?;
    let store = CsvStore::new(&config.data_dir);
    let symbols = resolve_universe(config, &venue, symbols)?;

    let job = SyncJob {
        venue: &venue,
        store: &store,
        interval: config.interval,
        lookback: config.lookback(),
        settings: config.fetch_settings(),
        workers: config.workers,
        batch_timeout: config.batch_timeout(),
        archive: archive.as_ref().map(|archive| ArchiveBackfill {
            archive,
            min_days: config.archive.min_days,
        }),
    };
    let progress = StdoutProgress::new();
    let interrupted = install_interrupt_flag();
    let report = job.run(&symbols, Utc::now(), &progress, Some(&interrupted))?;

    print_batch_summary(&report);
    write_report(report_path, &report)?;

    if !report.all_succeeded() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_verify(
    config: &SyncConfig,
    symbols: Vec<String>,
    discover: bool,
    deep: bool,
    report_path: Option<&Path>,
) -> Result<()> {
    let store = CsvStore::new(&config.data_dir);
    let mut target = config.verify_target(Utc::now());
    target.deep |= deep;

    let expected = expected_symbols(config, symbols, discover)?;
    let keys = verification_keys(&store, &target, &expected)?;
    if keys.is_empty() {
        bail!(
            "no stores under {} for interval {}",
            config.data_dir.display(),
            config.interval
        );
    }
    let summary = verify_stores(&store, &keys, &target, config.workers)?;

    println!(
        "Window: {} .. {} ({} tolerance)",
        target.start,
        target.end,
        format_minutes(config.verify.tolerance_minutes)
    );
    println!("Checked: {}  Healthy: {}", summary.checked, summary.healthy);
    if !summary.reports.is_empty() {
        println!();
        println!("{:<16} {:>10} {:>10}  {}", "Symbol", "Rows", "Missing", "Issues");
        println!("{}", "-".repeat(72));
        for r in &summary.reports {
            let issues: Vec<String> = r.issues.iter().map(|i| i.to_string()).collect();
            println!(
                "{:<16} {:>10} {:>10}  {}",
                r.key.symbol,
                r.rows,
                r.missing_candles(),
                issues.join("; ")
            );
        }
    }
    write_report(report_path, &summary)?;

    if !summary.all_healthy() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_repair(
    config: &SyncConfig,
    symbols: Vec<String>,
    discover: bool,
    max_rounds: Option<u32>,
    report_path: Option<&Path>,
) -> Result<()> {
    let venue = build_venue(config)?;
    let archive = build_archive(config)?;
    let store = CsvStore::new(&config.data_dir);
    let target = config.verify_target(Utc::now());

    let expected = if discover {
        resolve_universe(config, &venue, symbols)?
    } else {
        expected_symbols(config, symbols, false)?
    };
    let keys = verification_keys(&store, &target, &expected)?;
    let summary = verify_stores(&store, &keys, &target, config.workers)?;
    println!(
        "Verified {} stores, {} need repair",
        summary.checked,
        summary.reports.len()
    );
    if summary.all_healthy() {
        write_report(report_path, &RepairReport::default())?;
        return Ok(());
    }

    let repairer = Repairer {
        venue: &venue,
        store: &store,
        settings: config.fetch_settings(),
        target,
        max_rounds: max_rounds.unwrap_or(config.repair.max_rounds).max(1),
        workers: config.workers,
        archive: archive.as_ref().map(|archive| ArchiveBackfill {
            archive,
            min_days: config.archive.min_days,
        }),
    };
    let interrupted = install_interrupt_flag();
    let report = repairer.repair(&summary.reports, Some(&interrupted))?;

    print_repair_summary(&report);
    write_report(report_path, &report)?;

    if !report.all_resolved() {
        std::process::exit(1);
    }
    Ok(())
}

fn run_status(config: &SyncConfig) -> Result<()> {
    let store = CsvStore::new(&config.data_dir);
    let keys = store.list_keys(config.interval)?;
    if keys.is_empty() {
        println!(
            "No stores for {} under {}",
            config.interval,
            config.data_dir.display()
        );
        return Ok(());
    }

    let mut total_size = 0u64;
    println!("Store: {} ({})", config.data_dir.display(), config.interval);
    println!();
    println!(
        "{:<16} {:<20} {:<20} {:>10} {:>10}",
        "Symbol", "First", "Last", "Rows", "Size"
    );
    println!("{}", "-".repeat(80));
    for key in &keys {
        match store.stat(key) {
            Ok(stat) => {
                total_size += stat.size_bytes;
                println!(
                    "{:<16} {:<20} {:<20} {:>10} {:>10}",
                    key.symbol,
                    format_open(stat.first),
                    format_open(stat.last),
                    stat.rows,
                    format_size(stat.size_bytes)
                );
            }
            Err(e) => println!("{:<16} {e}", key.symbol),
        }
    }
    println!();
    println!("Stores: {}  Total size: {}", keys.len(), format_size(total_size));
    Ok(())
}

fn expected_symbols(config: &SyncConfig, explicit: Vec<String>, discover: bool) -> Result<Vec<String>> {
    let mut symbols = explicit;
    symbols.extend(config.universe.symbols.iter().cloned());
    if discover {
        let venue = build_venue(config)?;
        symbols.extend(discover_symbols(&venue, &config.universe.filter())?);
    }
    Ok(symbols)
}

fn print_batch_summary(report: &BatchReport) {
    println!();
    println!(
        "Updated: {}  Up to date: {}  Failed: {}  Skipped: {}  Rows added: {}  ({:.1}s)",
        report.updated(),
        report.up_to_date(),
        report.failed(),
        report.skipped(),
        report.rows_added(),
        report.elapsed_ms as f64 / 1000.0
    );
    let attention = report.needs_attention();
    if !attention.is_empty() {
        println!();
        println!("Needs attention:");
        for r in attention {
            match &r.status {
                SymbolStatus::Failed(reason) => println!("  FAIL {}: {reason}", r.symbol),
                SymbolStatus::Skipped(reason) => println!("  SKIP {}: {reason}", r.symbol),
                _ => {}
            }
        }
    }
}

fn print_repair_summary(report: &RepairReport) {
    println!(
        "Resolved: {}  Unresolved: {}  Rows added: {}",
        report.resolved(),
        report.unresolved().len(),
        report.rows_added()
    );
    for r in report.unresolved() {
        match &r.outcome {
            RepairOutcome::Unresolved {
                rounds,
                remaining,
                last_error,
                ..
            } => {
                println!("  {} after {rounds} round(s):", r.symbol);
                for gap in remaining {
                    println!("    missing {} .. {}", gap.start, gap.end);
                }
                if let Some(err) = last_error {
                    println!("    last error: {err}");
                }
            }
            RepairOutcome::Skipped { reason } => println!("  {} skipped: {reason}", r.symbol),
            RepairOutcome::Resolved { .. } => {}
        }
    }
}

fn format_open(ts: Option<chrono::DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn format_minutes(minutes: u64) -> String {
    if minutes % 60 == 0 {
        format!("{}h", minutes / 60)
    } else {
        format!("{minutes}m")
    }
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_the_first_interrupt_raises_the_flag() {
        let flag = AtomicBool::new(false);
        assert!(raise(&flag));
        assert!(flag.load(Ordering::Relaxed));
        assert!(!raise(&flag));
    }

    #[test]
    fn disabled_archive_is_not_built() {
        let mut config = SyncConfig::default();
        config.archive.enabled = false;
        assert!(build_archive(&config).unwrap().is_none());
        config.archive.enabled = true;
        assert!(build_archive(&config).unwrap().is_some());
    }
}
