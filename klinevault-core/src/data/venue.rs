//! Venue trait and structured error types.
//!
//! The `Venue` trait abstracts over the exchange REST API so the pipeline can
//! run against the live futures endpoint or an in-memory script in tests.
//! Implementations issue exactly one request per call; retries belong to the
//! caller's `RetryPolicy`.

use super::retry::Retryable;
use crate::domain::{Candle, Interval, Symbol};
use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by venue (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("venue refused this client (HTTP {status}); circuit breaker tripped")]
    Banned { status: u16 },

    #[error("venue server error (HTTP {status}): {message}")]
    ServerError { status: u16, message: String },

    #[error("request rejected (HTTP {status}): {message}")]
    InvalidRequest { status: u16, message: String },

    #[error("symbol not found: {symbol}")]
    SymbolNotFound { symbol: String },

    #[error("response format changed: {0}")]
    ResponseFormatChanged(String),

    #[error("circuit breaker open: requests suspended")]
    CircuitBreakerOpen,
}

impl Retryable for VenueError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            VenueError::NetworkUnreachable(_)
                | VenueError::Timeout(_)
                | VenueError::RateLimited { .. }
                | VenueError::ServerError { .. }
        )
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            VenueError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

/// Read-only market data venue.
pub trait Venue: Send + Sync {
    /// Human-readable name of this venue.
    fn name(&self) -> &str;

    /// List every instrument the venue knows about, tradable or not.
    fn exchange_info(&self) -> Result<Vec<Symbol>, VenueError>;

    /// One page of candles with `since <= open_time <= end`, ascending,
    /// at most `limit` rows. Venues may return edge-adjacent rows outside the
    /// range; callers filter.
    fn klines(
        &self,
        symbol: &str,
        interval: Interval,
        since: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Candle>, VenueError>;

    /// Whether requests are currently allowed (not banned, not rate-limited).
    fn is_available(&self) -> bool;
}
