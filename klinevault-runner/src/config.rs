//! Serializable sync configuration.
//!
//! Loaded from TOML; every section and field has a default, so an empty file
//! (or no file at all) describes a working setup:
//!
//! ```toml
//! data_dir = "data"
//! interval = "1m"
//! lookback_days = 30
//! workers = 3
//!
//! [universe]
//! quote_asset = "USDT"
//! contract_type = "PERPETUAL"
//! exclude = ["USDCUSDT"]
//!
//! [fetch]
//! page_size = 1000
//! request_delay_ms = 500
//!
//! [retry]
//! max_attempts = 4
//!
//! [verify]
//! tolerance_minutes = 1440
//!
//! [repair]
//! max_rounds = 3
//!
//! [archive]
//! enabled = true
//! min_days = 2
//! ```

use chrono::{DateTime, Utc};
use klinevault_core::data::{
    CircuitBreaker, FetchSettings, RetryPolicy, UniverseFilter, VerifyTarget, FUTURES_BASE_URL,
    MAX_KLINE_LIMIT, VISION_BASE_URL,
};
use klinevault_core::domain::Interval;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Longest accepted lookback; USDⓈ-M futures history is far shorter.
pub const MAX_LOOKBACK_DAYS: u32 = 3650;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(String),

    #[error("failed to serialize config: {0}")]
    Serialize(String),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SyncConfig {
    /// Root of the store tree (`{data_dir}/{interval}/{SYMBOL}.csv`).
    pub data_dir: PathBuf,
    pub interval: Interval,
    /// History fetched for a symbol with no store yet.
    pub lookback_days: u32,
    /// Worker pool size.
    pub workers: usize,
    /// Stop scheduling new symbols after this many seconds.
    pub batch_timeout_secs: Option<u64>,
    pub universe: UniverseConfig,
    pub fetch: FetchConfig,
    pub retry: RetryConfig,
    pub verify: VerifyConfig,
    pub repair: RepairConfig,
    pub archive: ArchiveConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            interval: Interval::M1,
            lookback_days: 30,
            workers: 3,
            batch_timeout_secs: None,
            universe: UniverseConfig::default(),
            fetch: FetchConfig::default(),
            retry: RetryConfig::default(),
            verify: VerifyConfig::default(),
            repair: RepairConfig::default(),
            archive: ArchiveConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UniverseConfig {
    pub quote_asset: String,
    pub contract_type: String,
    /// Dropped from the discovered universe.
    pub exclude: Vec<String>,
    /// When non-empty, used instead of discovery.
    pub symbols: Vec<String>,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        let filter = UniverseFilter::default();
        Self {
            quote_asset: filter.quote_asset,
            contract_type: filter.contract_type,
            exclude: Vec::new(),
            symbols: Vec::new(),
        }
    }
}

impl UniverseConfig {
    pub fn filter(&self) -> UniverseFilter {
        UniverseFilter {
            quote_asset: self.quote_asset.clone(),
            contract_type: self.contract_type.clone(),
            exclude: self.exclude.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FetchConfig {
    pub base_url: String,
    pub page_size: usize,
    pub request_delay_ms: u64,
    pub request_timeout_secs: u64,
    /// Consecutive rate limits before the circuit breaker opens.
    pub breaker_threshold: u32,
    pub breaker_cooldown_secs: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: FUTURES_BASE_URL.to_string(),
            page_size: 1000,
            request_delay_ms: 500,
            request_timeout_secs: 30,
            breaker_threshold: 5,
            breaker_cooldown_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VerifyConfig {
    /// Slack allowed at the window boundaries.
    pub tolerance_minutes: u64,
    /// Scan every row instead of trusting a matching row count.
    pub deep: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            tolerance_minutes: 24 * 60,
            deep: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RepairConfig {
    pub max_rounds: u32,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self { max_rounds: 3 }
    }
}

/// Binance Vision bulk archive, used for windows of `min_days` or more.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub base_url: String,
    pub min_days: u32,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: VISION_BASE_URL.to_string(),
            min_days: 2,
        }
    }
}

impl SyncConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.workers == 0 {
            return invalid("workers must be at least 1".into());
        }
        if self.lookback_days == 0 || self.lookback_days > MAX_LOOKBACK_DAYS {
            return invalid(format!(
                "lookback_days must be in 1..={MAX_LOOKBACK_DAYS}, got {}",
                self.lookback_days
            ));
        }
        let max_tolerance = u64::from(MAX_LOOKBACK_DAYS) * 24 * 60;
        if self.verify.tolerance_minutes > max_tolerance {
            return invalid(format!(
                "verify.tolerance_minutes must be at most {max_tolerance}, got {}",
                self.verify.tolerance_minutes
            ));
        }
        if self.fetch.page_size == 0 || self.fetch.page_size > MAX_KLINE_LIMIT {
            return invalid(format!(
                "fetch.page_size must be in 1..={MAX_KLINE_LIMIT}, got {}",
                self.fetch.page_size
            ));
        }
        if self.fetch.request_timeout_secs == 0 {
            return invalid("fetch.request_timeout_secs must be at least 1".into());
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".into());
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return invalid(format!(
                "retry.base_delay_ms ({}) exceeds retry.max_delay_ms ({})",
                self.retry.base_delay_ms, self.retry.max_delay_ms
            ));
        }
        if self.repair.max_rounds == 0 {
            return invalid("repair.max_rounds must be at least 1".into());
        }
        if self.archive.enabled && self.archive.min_days == 0 {
            return invalid("archive.min_days must be at least 1".into());
        }
        if self.archive.enabled && !self.archive.base_url.starts_with("http") {
            return invalid(format!(
                "archive.base_url must be an http(s) URL, got '{}'",
                self.archive.base_url
            ));
        }
        Ok(())
    }

    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.lookback_days))
    }

    pub fn batch_timeout(&self) -> Option<Duration> {
        self.batch_timeout_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            jitter: self.retry.jitter,
        }
    }

    pub fn fetch_settings(&self) -> FetchSettings {
        FetchSettings {
            page_size: self.fetch.page_size,
            request_delay: Duration::from_millis(self.fetch.request_delay_ms),
            retry: self.retry_policy(),
        }
    }

    pub fn circuit_breaker(&self) -> CircuitBreaker {
        CircuitBreaker::new(
            Duration::from_secs(self.fetch.breaker_cooldown_secs),
            self.fetch.breaker_threshold,
        )
    }

    /// Window every store should cover at `now`.
    pub fn verify_target(&self, now: DateTime<Utc>) -> VerifyTarget {
        let tolerance = i64::try_from(self.verify.tolerance_minutes)
            .ok()
            .and_then(chrono::Duration::try_minutes)
            .unwrap_or(chrono::Duration::MAX);
        let mut target = VerifyTarget::for_lookback(self.interval, self.lookback(), tolerance, now);
        target.deep = self.verify.deep;
        target
    }
}
