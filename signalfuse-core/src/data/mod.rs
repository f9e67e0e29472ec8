//! Market data collaborators: live sources, historical stores, fetch policy.

pub mod binance;
pub mod circuit_breaker;
pub mod provider;
pub mod retry;
pub mod store;
pub mod synthetic;

pub use binance::BinanceSource;
pub use circuit_breaker::CircuitBreaker;
pub use provider::{DataFetchError, HistoricalStore, MarketDataSource, SourceKind, StoreError};
pub use retry::{retry_transient, with_timeout, RetryPolicy};
pub use store::{CsvStore, ParquetStore, StoreMeta};
pub use synthetic::{generate_candles, SimulatedSource};
