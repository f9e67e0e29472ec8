//! Deterministic simulated market data.
//!
//! A seeded random walk per instrument: the RNG seed is the BLAKE3 hash of the
//! instrument name, so the same instrument always yields the same series.
//! Used as the degraded-mode fallback of the live loop and for demos and tests.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};

use super::provider::{DataFetchError, MarketDataSource};
use crate::domain::{Candle, Timeframe};

const START_PRICE: f64 = 100.0;

/// Walks kept per stream.
const HISTORY_CAP: usize = 2_000;

fn seeded_rng(instrument: &str) -> StdRng {
    StdRng::from_seed(*blake3::hash(instrument.as_bytes()).as_bytes())
}

fn next_candle(rng: &mut StdRng, instrument: &str, timeframe: Timeframe, open_time: DateTime<Utc>, price: f64) -> Candle {
    let step: f64 = rng.gen_range(-0.01..0.01);
    let open = price;
    let close = price * (1.0 + step);
    let high = open.max(close) * (1.0 + rng.gen_range(0.0..0.003));
    let low = open.min(close) * (1.0 - rng.gen_range(0.0..0.003));
    let volume = rng.gen_range(10.0..1_000.0);
    Candle {
        instrument: instrument.to_string(),
        timeframe,
        open_time,
        open,
        high,
        low,
        close,
        volume,
    }
}

/// Generate `count` consecutive candles starting at `start`.
pub fn generate_candles(
    instrument: &str,
    timeframe: Timeframe,
    start: DateTime<Utc>,
    count: usize,
) -> Vec<Candle> {
    let mut rng = seeded_rng(instrument);
    let mut price = START_PRICE;
    let start = timeframe.window_start(start);
    (0..count)
        .map(|i| {
            let open_time = start + timeframe.duration() * i as i32;
            let candle = next_candle(&mut rng, instrument, timeframe, open_time, price);
            price = candle.close;
            candle
        })
        .collect()
}

struct Walk {
    rng: StdRng,
    candles: Vec<Candle>,
}

type Clock = Box<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Live-style source over the simulated walk.
///
/// Each (instrument, timeframe) stream starts `limit` windows before the first
/// request and is extended up to the last closed window of the clock on every
/// call, so repeated calls return a consistent, growing history.
pub struct SimulatedSource {
    clock: Clock,
    walks: Mutex<BTreeMap<(String, Timeframe), Walk>>,
}

impl Default for SimulatedSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedSource {
    pub fn new() -> Self {
        Self::with_clock(Utc::now)
    }

    pub fn with_clock(clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        Self {
            clock: Box::new(clock),
            walks: Mutex::new(BTreeMap::new()),
        }
    }
}

impl MarketDataSource for SimulatedSource {
    fn name(&self) -> &str {
        "simulated"
    }

    fn get_candles(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>, DataFetchError> {
        // Exclusive end: the window containing `now` is still forming.
        let end = timeframe.window_start((self.clock)());
        let mut walks = self.walks.lock().unwrap_or_else(PoisonError::into_inner);
        let walk = walks
            .entry((instrument.to_string(), timeframe))
            .or_insert_with(|| Walk {
                rng: seeded_rng(instrument),
                candles: Vec::new(),
            });

        let mut next_open = match walk.candles.last() {
            Some(last) => last.open_time + timeframe.duration(),
            None => end - timeframe.duration() * limit.max(1) as i32,
        };
        let mut price = walk.candles.last().map_or(START_PRICE, |c| c.close);
        while next_open < end {
            let candle = next_candle(&mut walk.rng, instrument, timeframe, next_open, price);
            price = candle.close;
            next_open += timeframe.duration();
            walk.candles.push(candle);
        }
        if walk.candles.len() > HISTORY_CAP {
            let excess = walk.candles.len() - HISTORY_CAP;
            walk.candles.drain(..excess);
        }

        let skip = walk.candles.len().saturating_sub(limit);
        Ok(walk.candles[skip..].to_vec())
    }

    fn get_latest_price(&self, instrument: &str) -> Result<f64, DataFetchError> {
        let candles = self.get_candles(instrument, Timeframe::M1, 1)?;
        candles
            .last()
            .map(|c| c.close)
            .ok_or_else(|| DataFetchError::BadResponse("simulated walk is empty".into()))
    }

    fn is_available(&self) -> bool {
        true
    }
}
