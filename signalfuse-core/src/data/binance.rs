//! Binance spot REST source (public market data endpoints only).
//!
//! - `GET /api/v3/klines` for candles; the still-forming last kline is dropped
//! - `GET /api/v3/ticker/price` for the latest price
//!
//! Each call is a single attempt; retry and timeout policy belongs to the caller.
//! HTTP 451/403 (restricted location, IP block) trips the circuit breaker and is
//! reported as permanent.

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::circuit_breaker::CircuitBreaker;
use super::provider::{DataFetchError, MarketDataSource};
use crate::domain::{Candle, Timeframe};

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";

/// Exchange-side cap on klines per request.
const MAX_KLINES: usize = 1000;

#[derive(Debug, Deserialize)]
struct TickerPrice {
    price: String,
}

pub struct BinanceSource {
    client: reqwest::blocking::Client,
    base_url: String,
    circuit_breaker: Arc<CircuitBreaker>,
    timeout: Duration,
}

impl BinanceSource {
    pub fn new(
        base_url: impl Into<String>,
        circuit_breaker: Arc<CircuitBreaker>,
        timeout: Duration,
    ) -> Result<Self, DataFetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("signalfuse/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DataFetchError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            circuit_breaker,
            timeout,
        })
    }

    fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, DataFetchError> {
        self.circuit_breaker.check()?;
        let outcome = self.request(url);
        self.circuit_breaker.observe(&outcome);
        outcome
    }

    fn request<T: DeserializeOwned>(&self, url: &str) -> Result<T, DataFetchError> {
        let resp = self.client.get(url).send().map_err(|e| {
            if e.is_timeout() {
                DataFetchError::Timeout {
                    after_ms: self.timeout.as_millis() as u64,
                }
            } else {
                DataFetchError::Network(e.to_string())
            }
        })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(classify_status(status, retry_after));
        }

        resp.json::<T>()
            .map_err(|e| DataFetchError::BadResponse(format!("failed to parse {url}: {e}")))
    }
}

/// Map a non-success HTTP status to the fetch error taxonomy.
pub fn classify_status(status: StatusCode, retry_after_secs: Option<u64>) -> DataFetchError {
    match status.as_u16() {
        451 => DataFetchError::AccessDenied {
            status: 451,
            reason: "unavailable from this location".into(),
        },
        403 => DataFetchError::AccessDenied {
            status: 403,
            reason: "forbidden".into(),
        },
        429 | 418 => DataFetchError::RateLimited {
            retry_after_secs: retry_after_secs.unwrap_or(60),
        },
        s if status.is_server_error() => DataFetchError::Server { status: s },
        s => DataFetchError::BadResponse(format!("HTTP {s}")),
    }
}

/// Parse the klines array. Klines still open at `now` are dropped.
pub fn parse_klines(
    instrument: &str,
    timeframe: Timeframe,
    rows: &[Vec<Value>],
    now: DateTime<Utc>,
) -> Result<Vec<Candle>, DataFetchError> {
    let mut candles = Vec::with_capacity(rows.len());
    for row in rows {
        let field = |i: usize| -> Result<f64, DataFetchError> {
            match row.get(i) {
                Some(Value::String(s)) => s
                    .parse::<f64>()
                    .map_err(|e| DataFetchError::BadResponse(format!("kline field {i}: {e}"))),
                Some(Value::Number(n)) => n
                    .as_f64()
                    .ok_or_else(|| DataFetchError::BadResponse(format!("kline field {i} not a float"))),
                _ => Err(DataFetchError::BadResponse(format!("kline field {i} missing"))),
            }
        };
        let open_ms = row
            .first()
            .and_then(Value::as_i64)
            .ok_or_else(|| DataFetchError::BadResponse("kline open time missing".into()))?;
        let open_time = DateTime::from_timestamp_millis(open_ms)
            .ok_or_else(|| DataFetchError::BadResponse(format!("invalid open time {open_ms}")))?;

        let candle = Candle {
            instrument: instrument.to_string(),
            timeframe,
            open_time,
            open: field(1)?,
            high: field(2)?,
            low: field(3)?,
            close: field(4)?,
            volume: field(5)?,
        };
        if candle.close_time() <= now {
            candles.push(candle);
        }
    }
    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

impl MarketDataSource for BinanceSource {
    fn name(&self) -> &str {
        "binance"
    }

    fn get_candles(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, DataFetchError> {
        // One extra row covers the forming kline that gets dropped.
        let limit = (limit + 1).min(MAX_KLINES);
        let url = format!(
            "{}/api/v3/klines?symbol={instrument}&interval={timeframe}&limit={limit}",
            self.base_url
        );
        let rows: Vec<Vec<Value>> = self.get_json(&url)?;
        parse_klines(instrument, timeframe, &rows, Utc::now())
    }

    fn get_latest_price(&self, instrument: &str) -> Result<f64, DataFetchError> {
        let url = format!("{}/api/v3/ticker/price?symbol={instrument}", self.base_url);
        let ticker: TickerPrice = self.get_json(&url)?;
        ticker
            .price
            .parse::<f64>()
            .map_err(|e| DataFetchError::BadResponse(format!("ticker price: {e}")))
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}
