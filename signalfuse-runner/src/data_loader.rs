//! Candle loading and validation for backtests.
//!
//! Loads every configured instrument on the base timeframe from the configured
//! source, validates each stream and fingerprints the whole dataset so reports
//! can be tied back to the exact data they ran on.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::info;

use signalfuse_core::data::{generate_candles, CsvStore, HistoricalStore, ParquetStore, SourceKind};
use signalfuse_core::domain::{Candle, Timeframe};
use signalfuse_core::indicators::SequenceError;

use crate::config::{RunConfig, SourceConfig};
use crate::error::RunError;

/// 2024-01-01T00:00:00Z, where simulated replays start unless `start` is set.
const SIMULATED_START_SECS: i64 = 1_704_067_200;

/// Validated candle streams, one per instrument, all on the same timeframe.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedData {
    pub timeframe: Timeframe,
    pub candles: BTreeMap<String, Vec<Candle>>,
    pub dataset_hash: String,
    pub source: SourceKind,
}

impl LoadedData {
    /// Group candles by instrument and validate every stream.
    ///
    /// Each stream must be strictly increasing in open_time (an older candle is a
    /// `SequenceError`, a repeated one is invalid data), on `timeframe`, and sane.
    pub fn from_candles(
        timeframe: Timeframe,
        candles: Vec<Candle>,
        source: SourceKind,
    ) -> Result<Self, RunError> {
        let mut streams: BTreeMap<String, Vec<Candle>> = BTreeMap::new();
        for candle in candles {
            streams.entry(candle.instrument.clone()).or_default().push(candle);
        }
        if streams.values().all(Vec::is_empty) {
            return Err(RunError::NoData);
        }
        for stream in streams.values() {
            validate_series(stream, timeframe)?;
        }
        let dataset_hash = compute_dataset_hash(&streams);
        Ok(Self {
            timeframe,
            candles: streams,
            dataset_hash,
            source,
        })
    }

    pub fn instruments(&self) -> impl Iterator<Item = &str> {
        self.candles.keys().map(String::as_str)
    }

    pub fn candle_count(&self) -> usize {
        self.candles.values().map(Vec::len).sum()
    }
}

/// Check one instrument's stream.
pub fn validate_series(candles: &[Candle], timeframe: Timeframe) -> Result<(), RunError> {
    for c in candles {
        if c.timeframe != timeframe {
            return Err(RunError::InvalidData(format!(
                "{} candle at {} is on {}, expected {timeframe}",
                c.instrument, c.open_time, c.timeframe
            )));
        }
        if !c.is_sane() {
            return Err(RunError::InvalidData(format!(
                "{} candle at {} fails OHLCV sanity (o={} h={} l={} c={} v={})",
                c.instrument, c.open_time, c.open, c.high, c.low, c.close, c.volume
            )));
        }
    }
    for pair in candles.windows(2) {
        let (prev, next) = (&pair[0], &pair[1]);
        if next.open_time < prev.open_time {
            return Err(SequenceError {
                instrument: next.instrument.clone(),
                timeframe,
                last: prev.open_time,
                received: next.open_time,
            }
            .into());
        }
        if next.open_time == prev.open_time {
            return Err(RunError::InvalidData(format!(
                "duplicate {} candle at {}",
                next.instrument, next.open_time
            )));
        }
    }
    Ok(())
}

/// Load every configured instrument from the configured source.
pub fn load_candles(config: &RunConfig) -> Result<LoadedData, RunError> {
    let timeframe = config.engine.timeframes.base;
    let from = config.start.unwrap_or(DateTime::<Utc>::MIN_UTC);
    let to = config.end.unwrap_or(DateTime::<Utc>::MAX_UTC);

    let (kind, candles) = match &config.source {
        SourceConfig::Parquet { dir } => {
            let store = ParquetStore::new(dir);
            (SourceKind::Parquet, load_from_store(&store, config, timeframe, from, to)?)
        }
        SourceConfig::Csv { dir } => {
            let store = CsvStore::new(dir);
            (SourceKind::Csv, load_from_store(&store, config, timeframe, from, to)?)
        }
        SourceConfig::Simulated { candles } => {
            let start = config
                .start
                .unwrap_or_else(|| DateTime::from_timestamp(SIMULATED_START_SECS, 0).unwrap_or_default());
            let all = config
                .instruments
                .iter()
                .flat_map(|inst| generate_candles(inst, timeframe, start, *candles))
                .filter(|c| c.open_time < to)
                .collect();
            (SourceKind::Simulated, all)
        }
    };

    let loaded = LoadedData::from_candles(timeframe, candles, kind)?;
    info!(
        source = ?loaded.source,
        instruments = loaded.candles.len(),
        candles = loaded.candle_count(),
        dataset_hash = %loaded.dataset_hash,
        "dataset loaded"
    );
    Ok(loaded)
}

fn load_from_store(
    store: &dyn HistoricalStore,
    config: &RunConfig,
    timeframe: Timeframe,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Candle>, RunError> {
    let mut all = Vec::new();
    for instrument in &config.instruments {
        let candles = store.load(instrument, timeframe, from, to)?;
        info!(store = store.name(), instrument = %instrument, candles = candles.len(), "loaded");
        all.extend(candles);
    }
    Ok(all)
}

/// Compute a BLAKE3 hash of the dataset for reproducibility tracking.
///
/// Covers every candle in instrument order; BTreeMap iteration keeps it stable.
fn compute_dataset_hash(streams: &BTreeMap<String, Vec<Candle>>) -> String {
    let mut hasher = blake3::Hasher::new();
    for (instrument, candles) in streams {
        hasher.update(instrument.as_bytes());
        for c in candles {
            hasher.update(c.timeframe.as_str().as_bytes());
            hasher.update(&c.open_time.timestamp_millis().to_le_bytes());
            hasher.update(&c.open.to_le_bytes());
            hasher.update(&c.high.to_le_bytes());
            hasher.update(&c.low.to_le_bytes());
            hasher.update(&c.close.to_le_bytes());
            hasher.update(&c.volume.to_le_bytes());
        }
    }
    hasher.finalize().to_hex().to_string()
}
