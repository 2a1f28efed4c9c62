//! Symbol universe discovery.

use super::venue::{Venue, VenueError};
use crate::domain::{normalize_symbol, Symbol};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to list instruments from {venue}: {source}")]
    Venue {
        venue: String,
        #[source]
        source: VenueError,
    },

    #[error("no tradable symbols match quote asset '{quote_asset}' and contract type '{contract_type}'")]
    EmptyUniverse {
        quote_asset: String,
        contract_type: String,
    },
}

/// Which instruments make up the universe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseFilter {
    pub quote_asset: String,
    pub contract_type: String,
    /// Symbols dropped after filtering (normalized before comparison).
    pub exclude: Vec<String>,
}

impl Default for UniverseFilter {
    fn default() -> Self {
        Self {
            quote_asset: "USDT".to_string(),
            contract_type: "PERPETUAL".to_string(),
            exclude: Vec::new(),
        }
    }
}

impl UniverseFilter {
    pub fn matches(&self, symbol: &Symbol) -> bool {
        symbol.is_tradable()
            && symbol.quote_asset.eq_ignore_ascii_case(&self.quote_asset)
            && symbol.contract_type.eq_ignore_ascii_case(&self.contract_type)
    }
}

/// Sorted, deduplicated names of the tradable symbols matching `filter`.
pub fn discover_symbols(
    venue: &dyn Venue,
    filter: &UniverseFilter,
) -> Result<Vec<String>, DiscoveryError> {
    let listed = venue.exchange_info().map_err(|source| DiscoveryError::Venue {
        venue: venue.name().to_string(),
        source,
    })?;
    let symbols = select_symbols(&listed, filter);

    info!(
        venue = venue.name(),
        listed = listed.len(),
        selected = symbols.len(),
        "discovered symbol universe"
    );

    if symbols.is_empty() {
        return Err(DiscoveryError::EmptyUniverse {
            quote_asset: filter.quote_asset.clone(),
            contract_type: filter.contract_type.clone(),
        });
    }
    Ok(symbols)
}

/// Apply `filter` to an instrument listing.
pub fn select_symbols(listed: &[Symbol], filter: &UniverseFilter) -> Vec<String> {
    let excluded: BTreeSet<String> = filter.exclude.iter().map(|s| normalize_symbol(s)).collect();
    listed
        .iter()
        .filter(|s| filter.matches(s))
        .map(|s| normalize_symbol(&s.name))
        .filter(|name| !name.is_empty() && !excluded.contains(name))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
