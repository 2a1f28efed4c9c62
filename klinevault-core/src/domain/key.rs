//! StoreKey: validated (symbol, interval) identity of a time-series store.

use super::interval::Interval;
use super::symbol::normalize_symbol;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const STORE_EXTENSION: &str = "csv";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("empty symbol")]
    Empty,

    #[error("symbol '{0}' contains characters not allowed in a store name")]
    InvalidCharacters(String),
}

/// Identity of one store: one file per (symbol, interval).
///
/// Layout: `{root}/{interval}/{SYMBOL}.csv`. The symbol is normalized and
/// validated once here so every call site agrees on the file name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StoreKey {
    pub symbol: String,
    pub interval: Interval,
}

impl StoreKey {
    pub fn new(symbol: &str, interval: Interval) -> Result<Self, KeyError> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() {
            return Err(KeyError::Empty);
        }
        if !symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(KeyError::InvalidCharacters(symbol));
        }
        Ok(Self { symbol, interval })
    }

    /// Directory holding every store of one interval.
    pub fn interval_dir(root: &Path, interval: Interval) -> PathBuf {
        root.join(interval.code())
    }

    pub fn file_name(&self) -> String {
        format!("{}.{STORE_EXTENSION}", self.symbol)
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        Self::interval_dir(root, self.interval).join(self.file_name())
    }

    /// Recover a key from a store file path; `None` for anything that is not a store.
    pub fn from_path(path: &Path, interval: Interval) -> Option<Self> {
        if path.extension().and_then(|e| e.to_str()) != Some(STORE_EXTENSION) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        Self::new(stem, interval).ok().filter(|k| k.symbol == stem)
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_layout() {
        let key = StoreKey::new("BTC/USDT:USDT", Interval::M1).unwrap();
        assert_eq!(key.symbol, "BTCUSDT");
        assert_eq!(
            key.path(Path::new("/data")),
            PathBuf::from("/data/1m/BTCUSDT.csv")
        );
    }

    #[test]
    fn rejects_empty_and_path_like_symbols() {
        assert_eq!(StoreKey::new("", Interval::M1), Err(KeyError::Empty));
        assert!(matches!(
            StoreKey::new("../etc", Interval::M1),
            Err(KeyError::InvalidCharacters(_))
        ));
    }

    #[test]
    fn from_path_roundtrips_and_skips_foreign_files() {
        let key = StoreKey::new("ETHUSDT", Interval::H1).unwrap();
        let path = key.path(Path::new("data"));
        assert_eq!(StoreKey::from_path(&path, Interval::H1), Some(key));
        assert_eq!(
            StoreKey::from_path(Path::new("data/1h/ETHUSDT.csv.tmp"), Interval::H1),
            None
        );
        assert_eq!(
            StoreKey::from_path(Path::new("data/1h/notes.txt"), Interval::H1),
            None
        );
        // Lower-case names are not something this crate writes.
        assert_eq!(
            StoreKey::from_path(Path::new("data/1h/ethusdt.csv"), Interval::H1),
            None
        );
    }

    #[test]
    fn display_includes_interval() {
        let key = StoreKey::new("SOLUSDT", Interval::M15).unwrap();
        assert_eq!(key.to_string(), "SOLUSDT@15m");
    }
}
