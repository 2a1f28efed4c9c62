//! KlineVault Core: domain types, venue access, CSV store, merge and verification.
//!
//! This crate contains everything that touches a single symbol's series:
//! - Domain types (candles, intervals, symbols, store keys, fetch windows)
//! - The `Venue` trait and the Binance USDⓈ-M futures client
//! - Retry policy and circuit breaker shared by every request
//! - Checkpoint resolution, paginated fetching, deduplicating merge
//! - Integrity verification with gap enumeration

pub mod data;
pub mod domain;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
