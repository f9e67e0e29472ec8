//! Market data and historical store seams, with their error taxonomy.
//!
//! `MarketDataSource` abstracts over live sources (Binance REST, the simulated
//! walk) so the live loop can swap one for the other on a permanent failure.
//! `HistoricalStore` abstracts over on-disk candle archives for backtests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{Candle, Timeframe};

/// Errors from a live market data fetch.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataFetchError {
    #[error("fetch timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("network unreachable: {0}")]
    Network(String),

    #[error("rate limited by provider (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("provider server error: HTTP {status}")]
    Server { status: u16 },

    #[error("access denied by provider: HTTP {status} ({reason})")]
    AccessDenied { status: u16, reason: String },

    #[error("unexpected response: {0}")]
    BadResponse(String),

    #[error("circuit breaker open: provider blocked for another {remaining_secs}s")]
    CircuitOpen { remaining_secs: u64 },
}

impl DataFetchError {
    /// Transient errors are worth retrying; permanent ones switch the source.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DataFetchError::Timeout { .. }
                | DataFetchError::Network(_)
                | DataFetchError::RateLimited { .. }
                | DataFetchError::Server { .. }
        )
    }
}

/// Errors from a historical store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no candles for {instrument} {timeframe} in [{from}, {to})")]
    NotFound {
        instrument: String,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    },

    #[error("store I/O error: {0}")]
    Io(String),

    #[error("parquet error: {0}")]
    Parquet(String),

    #[error("csv error: {0}")]
    Csv(String),

    #[error("invalid stored data: {0}")]
    Invalid(String),
}

/// Where candles came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Binance,
    Simulated,
    Parquet,
    Csv,
}

/// A live source of closed candles and ticker prices.
///
/// Calls run on detached threads under a hard timeout, so implementations
/// must bound their own I/O rather than block indefinitely.
pub trait MarketDataSource: Send + Sync {
    fn name(&self) -> &str;

    /// The most recent `limit` closed candles, oldest first.
    fn get_candles(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, DataFetchError>;

    fn get_latest_price(&self, instrument: &str) -> Result<f64, DataFetchError>;

    /// False while the source refuses requests (e.g. circuit breaker open).
    fn is_available(&self) -> bool;
}

/// An immutable archive of past candles.
pub trait HistoricalStore: Send + Sync {
    fn name(&self) -> &str;

    /// Candles with `from <= open_time < to`, ordered by open_time.
    ///
    /// Fails with `StoreError::NotFound` when the range holds no candles.
    fn load(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError>;
}

/// Keep `[from, to)`, sorted; `NotFound` if empty.
pub(crate) fn select_range(
    mut candles: Vec<Candle>,
    instrument: &str,
    timeframe: Timeframe,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Candle>, StoreError> {
    candles.retain(|c| c.open_time >= from && c.open_time < to);
    candles.sort_by_key(|c| c.open_time);
    if candles.is_empty() {
        return Err(StoreError::NotFound {
            instrument: instrument.to_string(),
            timeframe,
            from,
            to,
        });
    }
    Ok(candles)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(DataFetchError::Timeout { after_ms: 100 }.is_transient());
        assert!(DataFetchError::Network("reset".into()).is_transient());
        assert!(DataFetchError::RateLimited { retry_after_secs: 1 }.is_transient());
        assert!(DataFetchError::Server { status: 502 }.is_transient());

        assert!(!DataFetchError::AccessDenied {
            status: 451,
            reason: "geo".into()
        }
        .is_transient());
        assert!(!DataFetchError::BadResponse("x".into()).is_transient());
        assert!(!DataFetchError::CircuitOpen { remaining_secs: 5 }.is_transient());
    }
}
