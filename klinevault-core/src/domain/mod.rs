//! Domain types for KlineVault

pub mod candle;
pub mod interval;
pub mod key;
pub mod symbol;
pub mod window;

pub use candle::Candle;
pub use interval::{Interval, IntervalParseError};
pub use key::{KeyError, StoreKey};
pub use symbol::{normalize_symbol, Symbol};
pub use window::{collapse_missing, FetchWindow, GapRange};
