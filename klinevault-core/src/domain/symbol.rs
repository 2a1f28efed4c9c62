//! Tradable instrument metadata as reported by the venue.

use serde::{Deserialize, Serialize};

/// Venue status string for instruments that accept orders.
pub const TRADING_STATUS: &str = "TRADING";

/// Instrument listed on the venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    /// Venue identifier, e.g. `BTCUSDT`.
    pub name: String,
    pub base_asset: String,
    pub quote_asset: String,
    /// `PERPETUAL`, `CURRENT_QUARTER`, ... (empty for spot-style listings).
    pub contract_type: String,
    pub status: String,
}

impl Symbol {
    pub fn is_tradable(&self) -> bool {
        self.status == TRADING_STATUS
    }
}

/// Normalize a symbol written in unified notation to the venue identifier.
///
/// `BTC/USDT:USDT` → `BTCUSDT`, `eth/usdt` → `ETHUSDT`, `BTCUSDT` unchanged.
/// The settlement suffix after `:` is dropped rather than concatenated.
pub fn normalize_symbol(raw: &str) -> String {
    let without_settle = raw.split(':').next().unwrap_or(raw);
    without_settle
        .chars()
        .filter(|c| *c != '/' && !c.is_whitespace())
        .flat_map(char::to_uppercase)
        .collect()
}
