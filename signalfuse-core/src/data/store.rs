//! On-disk historical candle stores.
//!
//! Parquet layout: `{root}/instrument={INSTRUMENT}/timeframe={tf}.parquet`
//! with a `timeframe={tf}.meta.json` sidecar. CSV layout:
//! `{root}/{INSTRUMENT}_{tf}.csv` with a `timestamp` column in epoch
//! milliseconds (extra columns such as close time are ignored).
//!
//! Writes are atomic: write to `.tmp`, then rename into place.

use chrono::{DateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::provider::{select_range, HistoricalStore, StoreError};
use crate::domain::{Candle, Timeframe};

const COLUMNS: [&str; 6] = ["open_time", "open", "high", "low", "close", "volume"];

/// Sidecar written next to each Parquet file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub instrument: String,
    pub timeframe: Timeframe,
    pub first_open_time: DateTime<Utc>,
    pub last_open_time: DateTime<Utc>,
    pub candle_count: usize,
    /// BLAKE3 over the serialized candles.
    pub data_hash: String,
    pub source: String,
}

/// Check that a batch is one stream, strictly increasing and sane.
fn check_batch(candles: &[Candle]) -> Result<(&str, Timeframe), StoreError> {
    let first = candles
        .first()
        .ok_or_else(|| StoreError::Invalid("no candles to store".into()))?;
    for c in candles {
        if c.instrument != first.instrument || c.timeframe != first.timeframe {
            return Err(StoreError::Invalid(format!(
                "mixed streams in one batch: {} and {}",
                first.candle_ref(),
                c.candle_ref()
            )));
        }
        if !c.is_sane() {
            return Err(StoreError::Invalid(format!("insane candle {}", c.candle_ref())));
        }
    }
    if candles.windows(2).any(|w| w[1].open_time <= w[0].open_time) {
        return Err(StoreError::Invalid(format!(
            "{} {} candles are not strictly increasing",
            first.instrument, first.timeframe
        )));
    }
    Ok((&first.instrument, first.timeframe))
}

fn atomic_write(path: &Path, write: impl FnOnce(&Path) -> Result<(), StoreError>) -> Result<(), StoreError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| StoreError::Io(format!("create {}: {e}", dir.display())))?;
    }
    let tmp = path.with_extension("tmp");
    write(&tmp)?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        StoreError::Io(format!("atomic rename failed: {e}"))
    })
}

// ── Parquet ─────────────────────────────────────────────────────────

pub struct ParquetStore {
    root: PathBuf,
}

impl ParquetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, instrument: &str, timeframe: Timeframe) -> PathBuf {
        self.root
            .join(format!("instrument={instrument}"))
            .join(format!("timeframe={timeframe}.parquet"))
    }

    fn meta_path(&self, instrument: &str, timeframe: Timeframe) -> PathBuf {
        self.root
            .join(format!("instrument={instrument}"))
            .join(format!("timeframe={timeframe}.meta.json"))
    }

    /// Replace the stored series for the batch's stream.
    pub fn write(&self, candles: &[Candle], source: &str) -> Result<PathBuf, StoreError> {
        let (instrument, timeframe) = check_batch(candles)?;
        let path = self.path_for(instrument, timeframe);

        let mut df = candles_to_dataframe(candles)?;
        atomic_write(&path, |tmp| {
            let file = fs::File::create(tmp).map_err(|e| StoreError::Io(format!("create file: {e}")))?;
            ParquetWriter::new(file)
                .finish(&mut df)
                .map_err(|e| StoreError::Parquet(format!("write parquet: {e}")))?;
            Ok(())
        })?;

        let hash_input = serde_json::to_vec(candles)
            .map_err(|e| StoreError::Invalid(format!("hash serialization: {e}")))?;
        let meta = StoreMeta {
            instrument: instrument.to_string(),
            timeframe,
            first_open_time: candles[0].open_time,
            last_open_time: candles[candles.len() - 1].open_time,
            candle_count: candles.len(),
            data_hash: blake3::hash(&hash_input).to_hex().to_string(),
            source: source.to_string(),
        };
        let meta_json = serde_json::to_string_pretty(&meta)
            .map_err(|e| StoreError::Invalid(format!("meta serialization: {e}")))?;
        fs::write(self.meta_path(instrument, timeframe), meta_json)
            .map_err(|e| StoreError::Io(format!("meta write: {e}")))?;

        Ok(path)
    }

    pub fn meta(&self, instrument: &str, timeframe: Timeframe) -> Option<StoreMeta> {
        let content = fs::read_to_string(self.meta_path(instrument, timeframe)).ok()?;
        serde_json::from_str(&content).ok()
    }

    /// Every stored candle of a stream, oldest first.
    pub fn load_all(&self, instrument: &str, timeframe: Timeframe) -> Result<Vec<Candle>, StoreError> {
        let path = self.path_for(instrument, timeframe);
        if !path.exists() {
            return Err(StoreError::NotFound {
                instrument: instrument.to_string(),
                timeframe,
                from: DateTime::<Utc>::MIN_UTC,
                to: DateTime::<Utc>::MAX_UTC,
            });
        }
        let file = fs::File::open(&path).map_err(|e| StoreError::Io(format!("open {}: {e}", path.display())))?;
        let df = ParquetReader::new(file)
            .finish()
            .map_err(|e| StoreError::Parquet(format!("read {}: {e}", path.display())))?;
        dataframe_to_candles(&df, instrument, timeframe)
    }
}

impl HistoricalStore for ParquetStore {
    fn name(&self) -> &str {
        "parquet"
    }

    fn load(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        let candles = match self.load_all(instrument, timeframe) {
            Err(StoreError::NotFound { .. }) => Vec::new(),
            other => other?,
        };
        select_range(candles, instrument, timeframe, from, to)
    }
}

fn candles_to_dataframe(candles: &[Candle]) -> Result<DataFrame, StoreError> {
    let times: Vec<i64> = candles.iter().map(|c| c.open_time.timestamp_millis()).collect();
    let col = |f: fn(&Candle) -> f64| candles.iter().map(f).collect::<Vec<f64>>();

    DataFrame::new(vec![
        Column::new("open_time".into(), times),
        Column::new("open".into(), col(|c| c.open)),
        Column::new("high".into(), col(|c| c.high)),
        Column::new("low".into(), col(|c| c.low)),
        Column::new("close".into(), col(|c| c.close)),
        Column::new("volume".into(), col(|c| c.volume)),
    ])
    .map_err(|e| StoreError::Parquet(format!("dataframe creation: {e}")))
}

fn dataframe_to_candles(
    df: &DataFrame,
    instrument: &str,
    timeframe: Timeframe,
) -> Result<Vec<Candle>, StoreError> {
    for name in COLUMNS {
        if df.column(name).is_err() {
            return Err(StoreError::Invalid(format!("missing column '{name}'")));
        }
    }
    let map_err = |e: PolarsError| StoreError::Parquet(format!("column read: {e}"));

    let times = df.column("open_time").map_err(map_err)?.i64().map_err(map_err)?;
    let opens = df.column("open").map_err(map_err)?.f64().map_err(map_err)?;
    let highs = df.column("high").map_err(map_err)?.f64().map_err(map_err)?;
    let lows = df.column("low").map_err(map_err)?.f64().map_err(map_err)?;
    let closes = df.column("close").map_err(map_err)?.f64().map_err(map_err)?;
    let volumes = df.column("volume").map_err(map_err)?.f64().map_err(map_err)?;

    let mut candles = Vec::with_capacity(df.height());
    for i in 0..df.height() {
        let ms = times
            .get(i)
            .ok_or_else(|| StoreError::Invalid(format!("null open_time at row {i}")))?;
        let open_time = DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| StoreError::Invalid(format!("invalid open_time {ms} at row {i}")))?;
        candles.push(Candle {
            instrument: instrument.to_string(),
            timeframe,
            open_time,
            open: opens.get(i).unwrap_or(f64::NAN),
            high: highs.get(i).unwrap_or(f64::NAN),
            low: lows.get(i).unwrap_or(f64::NAN),
            close: closes.get(i).unwrap_or(f64::NAN),
            volume: volumes.get(i).unwrap_or(0.0),
        });
    }
    candles.sort_by_key(|c| c.open_time);
    Ok(candles)
}

// ── CSV ─────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
struct CsvRow {
    timestamp: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

pub struct CsvStore {
    root: PathBuf,
}

impl CsvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, instrument: &str, timeframe: Timeframe) -> PathBuf {
        self.root.join(format!("{instrument}_{timeframe}.csv"))
    }

    pub fn write(&self, candles: &[Candle]) -> Result<PathBuf, StoreError> {
        let (instrument, timeframe) = check_batch(candles)?;
        let path = self.path_for(instrument, timeframe);
        atomic_write(&path, |tmp| {
            let mut wtr = csv::Writer::from_path(tmp).map_err(|e| StoreError::Csv(e.to_string()))?;
            for c in candles {
                wtr.serialize(CsvRow {
                    timestamp: c.open_time.timestamp_millis(),
                    open: c.open,
                    high: c.high,
                    low: c.low,
                    close: c.close,
                    volume: c.volume,
                })
                .map_err(|e| StoreError::Csv(e.to_string()))?;
            }
            wtr.flush().map_err(|e| StoreError::Io(e.to_string()))
        })?;
        Ok(path)
    }
}

impl HistoricalStore for CsvStore {
    fn name(&self) -> &str {
        "csv"
    }

    fn load(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>, StoreError> {
        let path = self.path_for(instrument, timeframe);
        if !path.exists() {
            return select_range(Vec::new(), instrument, timeframe, from, to);
        }
        let mut rdr = csv::Reader::from_path(&path).map_err(|e| StoreError::Csv(e.to_string()))?;
        let mut candles = Vec::new();
        for (i, row) in rdr.deserialize::<CsvRow>().enumerate() {
            let row = row.map_err(|e| StoreError::Csv(format!("{} row {}: {e}", path.display(), i + 1)))?;
            let open_time = DateTime::from_timestamp_millis(row.timestamp)
                .ok_or_else(|| StoreError::Invalid(format!("invalid timestamp {}", row.timestamp)))?;
            candles.push(Candle {
                instrument: instrument.to_string(),
                timeframe,
                open_time,
                open: row.open,
                high: row.high,
                low: row.low,
                close: row.close,
                volume: row.volume,
            });
        }
        select_range(candles, instrument, timeframe, from, to)
    }
}
