//! Live paper-trading loop.
//!
//! One OS thread per instrument, each owning its orchestrator (indicators,
//! aggregator, position). Capital lives in the single-writer ledger thread.
//! Every fetch runs under a timeout and a bounded retry; a cycle whose fetch
//! still fails reports HOLD with the error instead of stalling. A permanent
//! failure switches that instrument to the simulated fallback for good and
//! marks it degraded.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use signalfuse_core::data::binance::DEFAULT_BASE_URL;
use signalfuse_core::data::{
    retry_transient, with_timeout, BinanceSource, CircuitBreaker, DataFetchError, MarketDataSource,
    RetryPolicy,
};
use signalfuse_core::domain::{AccountState, Candle, ClosedTrade, ExitReason, Timeframe};
use signalfuse_core::predictor::{LogisticModel, PredictorAdapter};
use signalfuse_core::{Action, ConfigError, DecisionOrchestrator, EngineConfig, HoldReason, StepOutcome};

use crate::error::RunError;
use crate::ledger::{LedgerHandle, LedgerService};

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LiveConfig {
    pub poll_interval_ms: u64,
    /// Candles requested per fetch; the first fetch warms the indicators.
    pub history_limit: usize,
    /// Stop after this many cycles per instrument. Unbounded when absent.
    pub max_cycles: Option<u64>,
    pub retry: RetryPolicy,
    pub base_url: String,
    pub breaker_cooldown_secs: u64,
    /// Re-read the model artifact this often and swap it in between cycles.
    pub model_reload_secs: Option<u64>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10_000,
            history_limit: 100,
            max_cycles: None,
            retry: RetryPolicy::default(),
            base_url: DEFAULT_BASE_URL.to_string(),
            breaker_cooldown_secs: 30 * 60,
            model_reload_secs: None,
        }
    }
}

impl LiveConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.retry.validate()?;
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::OutOfRange {
                field: "live.poll_interval_ms",
                value: 0.0,
                expected: ">= 1",
            });
        }
        if self.history_limit < 2 {
            return Err(ConfigError::OutOfRange {
                field: "live.history_limit",
                value: self.history_limit as f64,
                expected: ">= 2",
            });
        }
        if self.model_reload_secs == Some(0) {
            return Err(ConfigError::OutOfRange {
                field: "live.model_reload_secs",
                value: 0.0,
                expected: ">= 1",
            });
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Binance REST source behind its own circuit breaker.
pub fn binance_source(config: &LiveConfig) -> Result<Arc<dyn MarketDataSource>, RunError> {
    let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(config.breaker_cooldown_secs)));
    let source = BinanceSource::new(config.base_url.clone(), breaker, config.retry.timeout())?;
    Ok(Arc::new(source))
}

/// What happened in one instrument's cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleStatus {
    /// Fresh candles were fetched and stepped (possibly none).
    Stepped { outcomes: Vec<StepOutcome> },
    /// The fetch failed after retries; nothing was stepped.
    Held { reason: HoldReason, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub instrument: String,
    pub cycle: u64,
    /// Name of the source the cycle fetched from.
    pub source: String,
    /// The instrument runs on the simulated fallback.
    pub degraded: bool,
    pub status: CycleStatus,
}

/// Final state of a live session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSummary {
    pub cycles: BTreeMap<String, u64>,
    /// Closed trades, including shutdown closes, ordered by exit time.
    pub trades: Vec<ClosedTrade>,
    pub degraded_instruments: Vec<String>,
    pub account: AccountState,
}

struct WorkerSummary {
    instrument: String,
    cycles: u64,
    trades: Vec<ClosedTrade>,
    degraded: bool,
}

pub struct LiveRunner {
    config: LiveConfig,
    engine: EngineConfig,
    instruments: Vec<String>,
    primary: Arc<dyn MarketDataSource>,
    fallback: Arc<dyn MarketDataSource>,
    predictor: Arc<PredictorAdapter>,
    model_path: Option<PathBuf>,
    shutdown: Arc<AtomicBool>,
}

impl LiveRunner {
    pub fn new(
        config: LiveConfig,
        engine: EngineConfig,
        instruments: Vec<String>,
        primary: Arc<dyn MarketDataSource>,
        fallback: Arc<dyn MarketDataSource>,
        predictor: Arc<PredictorAdapter>,
    ) -> Result<Self, RunError> {
        config.validate()?;
        engine.validate()?;
        Ok(Self {
            config,
            engine,
            instruments,
            primary,
            fallback,
            predictor,
            model_path: None,
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Artifact to re-read every `model_reload_secs`.
    pub fn with_model_path(mut self, path: PathBuf) -> Self {
        self.model_path = Some(path);
        self
    }

    /// Set to true to stop every worker after its current cycle.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run until shutdown or `max_cycles`, then close open positions and stop the ledger.
    pub fn run(&self, initial_capital: f64, reports: Sender<CycleReport>) -> Result<LiveSummary, RunError> {
        let mut orchestrators = Vec::with_capacity(self.instruments.len());
        for instrument in &self.instruments {
            orchestrators.push(DecisionOrchestrator::new(
                instrument.as_str(),
                &self.engine,
                Arc::clone(&self.predictor),
            )?);
        }

        let ledger = LedgerService::spawn(
            AccountState::new(initial_capital).with_limits(self.engine.risk.entry_limits()),
        )?;
        info!(
            instruments = self.instruments.len(),
            source = self.primary.name(),
            capital = initial_capital,
            "live loop starting"
        );

        let workers = thread::scope(|s| -> Result<Vec<WorkerSummary>, RunError> {
            let mut handles = Vec::new();
            for orch in orchestrators {
                let worker = Worker {
                    instrument: orch.instrument().to_string(),
                    timeframe: orch.base_timeframe(),
                    orch,
                    ledger: ledger.handle(),
                    source: Arc::clone(&self.primary),
                    fallback: Arc::clone(&self.fallback),
                    degraded: false,
                    config: &self.config,
                    shutdown: &self.shutdown,
                    reports: reports.clone(),
                    last_seen: None,
                    last_close_time: None,
                    trades: Vec::new(),
                };
                let spawned = thread::Builder::new()
                    .name(format!("live-{}", worker.instrument))
                    .spawn_scoped(s, move || worker.run());
                match spawned {
                    Ok(h) => handles.push(h),
                    Err(e) => {
                        self.shutdown.store(true, Ordering::SeqCst);
                        return Err(RunError::Live(format!("failed to spawn worker: {e}")));
                    }
                }
            }

            self.supervise(|| handles.iter().all(|h| h.is_finished()));

            handles
                .into_iter()
                .map(|h| h.join().map_err(|_| RunError::Live("instrument worker panicked".into())))
                .collect()
        })?;

        let account = ledger.shutdown()?;
        let mut cycles = BTreeMap::new();
        let mut trades = Vec::new();
        let mut degraded_instruments = Vec::new();
        for w in workers {
            if w.degraded {
                degraded_instruments.push(w.instrument.clone());
            }
            cycles.insert(w.instrument, w.cycles);
            trades.extend(w.trades);
        }
        trades.sort_by(|a, b| a.exit_time.cmp(&b.exit_time).then_with(|| a.instrument.cmp(&b.instrument)));

        info!(
            capital = account.capital(),
            trades = trades.len(),
            degraded = degraded_instruments.len(),
            "live loop stopped"
        );
        Ok(LiveSummary {
            cycles,
            trades,
            degraded_instruments,
            account,
        })
    }

    /// Wait for the workers, swapping in a re-read model when one is due.
    fn supervise(&self, finished: impl Fn() -> bool) {
        let reload_every = match (&self.model_path, self.config.model_reload_secs) {
            (Some(_), Some(secs)) => Some(Duration::from_secs(secs)),
            _ => None,
        };
        let mut last_reload = Instant::now();
        while !finished() {
            thread::sleep(SLEEP_SLICE);
            if let (Some(every), Some(path)) = (reload_every, &self.model_path) {
                if last_reload.elapsed() >= every {
                    last_reload = Instant::now();
                    let swapped = LogisticModel::from_file(path)
                        .and_then(|m| self.predictor.swap(Arc::new(m)));
                    if let Err(e) = swapped {
                        warn!(path = %path.display(), error = %e, "model reload failed, keeping current model");
                    }
                }
            }
        }
    }
}

struct Worker<'a> {
    instrument: String,
    timeframe: Timeframe,
    orch: DecisionOrchestrator,
    ledger: LedgerHandle,
    source: Arc<dyn MarketDataSource>,
    fallback: Arc<dyn MarketDataSource>,
    degraded: bool,
    config: &'a LiveConfig,
    shutdown: &'a AtomicBool,
    reports: Sender<CycleReport>,
    last_seen: Option<DateTime<Utc>>,
    last_close_time: Option<DateTime<Utc>>,
    trades: Vec<ClosedTrade>,
}

impl Worker<'_> {
    fn run(mut self) -> WorkerSummary {
        let mut cycle = 0;
        while !self.shutdown.load(Ordering::SeqCst) {
            cycle += 1;
            let status = self.cycle();
            let report = CycleReport {
                instrument: self.instrument.clone(),
                cycle,
                source: self.source.name().to_string(),
                degraded: self.degraded,
                status,
            };
            // Nobody listening is fine; the loop keeps trading.
            let _ = self.reports.send(report);

            if self.config.max_cycles.is_some_and(|max| cycle >= max) || !self.pause() {
                break;
            }
        }
        self.close_on_shutdown();
        WorkerSummary {
            instrument: self.instrument,
            cycles: cycle,
            trades: self.trades,
            degraded: self.degraded,
        }
    }

    fn cycle(&mut self) -> CycleStatus {
        let fetched = match self.fetch() {
            Err(e) if !e.is_transient() && !self.degraded => {
                warn!(
                    instrument = %self.instrument,
                    source = self.source.name(),
                    error = %e,
                    fallback = self.fallback.name(),
                    "permanent fetch failure, switching to fallback source"
                );
                self.source = Arc::clone(&self.fallback);
                self.degraded = true;
                self.fetch()
            }
            other => other,
        };

        match fetched {
            Ok(candles) => CycleStatus::Stepped {
                outcomes: self.step_fresh(candles),
            },
            Err(e) => {
                let reason = match e {
                    DataFetchError::Timeout { .. } => HoldReason::FetchTimeout,
                    _ => HoldReason::DataUnavailable,
                };
                warn!(instrument = %self.instrument, error = %e, reason = reason.as_str(), "cycle held");
                CycleStatus::Held {
                    reason,
                    error: e.to_string(),
                }
            }
        }
    }

    fn fetch(&self) -> Result<Vec<Candle>, DataFetchError> {
        let timeout = self.config.retry.timeout();
        retry_transient(&self.config.retry, self.source.name(), |_| {
            let source = Arc::clone(&self.source);
            let instrument = self.instrument.clone();
            let (timeframe, limit) = (self.timeframe, self.config.history_limit);
            with_timeout(timeout, move || source.get_candles(&instrument, timeframe, limit))
        })
    }

    /// Step the candles newer than the last one processed.
    fn step_fresh(&mut self, mut candles: Vec<Candle>) -> Vec<StepOutcome> {
        candles.sort_by_key(|c| c.open_time);
        let mut outcomes = Vec::new();
        for candle in candles {
            if self.last_seen.is_some_and(|t| candle.open_time <= t) {
                continue;
            }
            if !candle.is_sane() {
                warn!(instrument = %self.instrument, candle = %candle.candle_ref(), "insane candle skipped");
                continue;
            }
            let outcome = self.orch.step(&candle, &mut self.ledger);
            self.last_seen = Some(candle.open_time);
            self.last_close_time = Some(candle.close_time());
            if let Action::Close { trade } = &outcome.action {
                self.trades.push(trade.clone());
            }
            outcomes.push(outcome);
        }
        debug!(instrument = %self.instrument, stepped = outcomes.len(), "cycle stepped");
        outcomes
    }

    /// Sleep one poll interval in slices. False if shutdown was requested.
    fn pause(&self) -> bool {
        let deadline = Instant::now() + self.config.poll_interval();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }

    fn close_on_shutdown(&mut self) {
        let (Some(price), Some(at)) = (self.orch.last_close(), self.last_close_time) else {
            return;
        };
        if let Some(trade) = self.orch.force_close(price, at, ExitReason::Shutdown, &mut self.ledger) {
            info!(instrument = %self.instrument, net_pnl = trade.net_pnl, "position closed on shutdown");
            self.trades.push(trade);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(LiveConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_zero_interval_and_tiny_history() {
        let zero = LiveConfig {
            poll_interval_ms: 0,
            ..LiveConfig::default()
        };
        assert!(matches!(
            zero.validate(),
            Err(ConfigError::OutOfRange { field: "live.poll_interval_ms", .. })
        ));
        let tiny = LiveConfig {
            history_limit: 1,
            ..LiveConfig::default()
        };
        assert!(tiny.validate().is_err());
    }

    #[test]
    fn retry_policy_is_validated() {
        let cfg = LiveConfig {
            retry: RetryPolicy {
                max_attempts: 0,
                ..RetryPolicy::default()
            },
            ..LiveConfig::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OutOfRange { field: "retry.max_attempts", .. })
        ));
    }

    #[test]
    fn cycle_report_serializes_with_status_tag() {
        let report = CycleReport {
            instrument: "BTCUSDT".into(),
            cycle: 3,
            source: "binance".into(),
            degraded: false,
            status: CycleStatus::Held {
                reason: HoldReason::FetchTimeout,
                error: "fetch timed out after 10ms".into(),
            },
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"]["status"], "held");
    }
}
