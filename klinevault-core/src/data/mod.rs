//! Acquisition, storage and verification of candle series

pub mod archive;
pub mod binance;
pub mod checkpoint;
pub mod circuit_breaker;
pub mod discovery;
pub mod fetch;
pub mod merge;
pub mod retry;
pub mod store;
pub mod timestamp;
pub mod venue;
pub mod verify;

pub use archive::{
    decode_archive, plan_periods, Archive, ArchiveBackfill, ArchivePeriod, BackfillWorker,
    BinanceVision, VISION_BASE_URL,
};
pub use binance::{BinanceFutures, FUTURES_BASE_URL, MAX_KLINE_LIMIT};
pub use checkpoint::{resolve as resolve_checkpoint, Checkpoint};
pub use circuit_breaker::CircuitBreaker;
pub use discovery::{discover_symbols, select_symbols, DiscoveryError, UniverseFilter};
pub use fetch::{FetchError, FetchReport, FetchSettings, FetchWorker};
pub use merge::{merge_candles, merge_into_store, MergeOutcome};
pub use retry::{RetryFailure, RetryPolicy, Retryable};
pub use store::{Boundary, CsvStore, Salvage, StoreError, StoreStat};
pub use venue::{Venue, VenueError};
pub use verify::{verify_store, GapReport, StoreIssue, VerifySummary, VerifyTarget};
