//! Per-instrument decision state machine: one `step` per incoming base candle.
//!
//! Order of evaluation:
//! 1. routing (instrument and base timeframe), then duplicate/stale checks;
//!    a stale candle resets the indicator stream, which then warms up again
//! 2. pin the model for this cycle and advance the aggregator
//! 3. with a position open: stop/target exit, then opposing-signal exit, then
//!    trailing update
//! 4. flat: warm-up, threshold, higher-timeframe veto, sizing, capital
//!    reservation (trading halt, position cap, available capital)
//!
//! A step emits exactly one action. A position closed on a candle is never
//! reopened on that same candle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::aggregator::{AlignedSignal, MultiTimeframeAggregator};
use crate::config::{ConfigError, EngineConfig};
use crate::domain::{
    Candle, CandleRef, CapitalLedger, ClosedTrade, ExitReason, MarginViolation, Position,
    PositionState, Reservation, Side, Timeframe,
};
use crate::fusion::{FusedSignal, SignalFusion};
use crate::predictor::PredictorAdapter;
use crate::risk::{RiskManager, TrailingUpdate};

/// Why a step held.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// A position is open and nothing changed.
    PositionUnchanged,
    HigherTimeframeVeto { timeframe: Timeframe },
    /// Same open_time as the last processed candle.
    DuplicateCandle,
    FetchTimeout,
    DataUnavailable,
    LedgerUnavailable,
}

impl HoldReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            HoldReason::PositionUnchanged => "position_unchanged",
            HoldReason::HigherTimeframeVeto { .. } => "higher_timeframe_veto",
            HoldReason::DuplicateCandle => "duplicate_candle",
            HoldReason::FetchTimeout => "fetch_timeout",
            HoldReason::DataUnavailable => "data_unavailable",
            HoldReason::LedgerUnavailable => "ledger_unavailable",
        }
    }
}

/// Why a step refused to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Indicators still undefined.
    WarmUp,
    /// Candle older than the last one processed.
    StaleCandle,
    BelowThreshold,
    /// Sized notional exceeds available capital.
    MarginViolation,
    /// Sizing produced no exposure.
    ZeroSize,
    /// Candle is for another instrument or timeframe.
    Unroutable,
    /// Drawdown halt is in force.
    TradingHalted,
    /// Portfolio already holds the maximum number of positions.
    MaxPositions,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::WarmUp => "warm_up",
            RejectReason::StaleCandle => "stale_candle",
            RejectReason::BelowThreshold => "below_threshold",
            RejectReason::MarginViolation => "margin_violation",
            RejectReason::ZeroSize => "zero_size",
            RejectReason::Unroutable => "unroutable",
            RejectReason::TradingHalted => "trading_halted",
            RejectReason::MaxPositions => "max_positions",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    Open {
        side: Side,
        entry_price: f64,
        size: f64,
        notional: f64,
        stop_loss: f64,
        take_profit: f64,
    },
    Hold {
        reason: HoldReason,
    },
    Close {
        trade: ClosedTrade,
    },
    /// Trailing stop moved.
    Adjust {
        stop_loss: f64,
    },
    Rejected {
        reason: RejectReason,
    },
}

impl Action {
    pub fn hold(reason: HoldReason) -> Self {
        Action::Hold { reason }
    }

    pub fn rejected(reason: RejectReason) -> Self {
        Action::Rejected { reason }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Action::Open { .. } => "OPEN",
            Action::Hold { .. } => "HOLD",
            Action::Close { .. } => "CLOSE",
            Action::Adjust { .. } => "ADJUST",
            Action::Rejected { .. } => "REJECTED",
        }
    }
}

/// The reported result of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutcome {
    pub candle_ref: CandleRef,
    pub action: Action,
    /// Fused signal the decision was based on, if the step got that far.
    pub signal: Option<FusedSignal>,
    /// Set when a close had its loss capped at available capital.
    pub margin_violation: Option<MarginViolation>,
    /// The model failed on this candle and fusion ran on indicators only.
    pub ml_degraded: bool,
}

impl StepOutcome {
    fn bare(candle: &Candle, action: Action) -> Self {
        Self {
            candle_ref: candle.candle_ref(),
            action,
            signal: None,
            margin_violation: None,
            ml_degraded: false,
        }
    }
}

pub struct DecisionOrchestrator {
    instrument: String,
    aggregator: MultiTimeframeAggregator,
    fusion: SignalFusion,
    risk: RiskManager,
    predictor: Arc<PredictorAdapter>,
    last_open_time: Option<DateTime<Utc>>,
    last_close: Option<f64>,
}

impl fmt::Debug for DecisionOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecisionOrchestrator")
            .field("instrument", &self.instrument)
            .field("state", &self.risk.state())
            .field("last_open_time", &self.last_open_time)
            .finish()
    }
}

impl DecisionOrchestrator {
    pub fn new(
        instrument: impl Into<String>,
        config: &EngineConfig,
        predictor: Arc<PredictorAdapter>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            instrument: instrument.into(),
            aggregator: MultiTimeframeAggregator::new(&config.indicators, config.timeframes.clone()),
            fusion: SignalFusion::new(config.fusion.clone())?,
            risk: RiskManager::new(config.risk.clone()),
            predictor,
            last_open_time: None,
            last_close: None,
        })
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn base_timeframe(&self) -> Timeframe {
        self.aggregator.base_timeframe()
    }

    pub fn state(&self) -> PositionState {
        self.risk.state()
    }

    pub fn position(&self) -> Option<&Position> {
        self.risk.position()
    }

    pub fn last_close(&self) -> Option<f64> {
        self.last_close
    }

    /// Open-position PnL at the last processed close.
    pub fn unrealized_pnl(&self) -> f64 {
        self.last_close.map_or(0.0, |p| self.risk.unrealized_pnl(p))
    }

    /// Process one candle and emit exactly one action.
    pub fn step(&mut self, candle: &Candle, ledger: &mut dyn CapitalLedger) -> StepOutcome {
        if candle.instrument != self.instrument || candle.timeframe != self.base_timeframe() {
            warn!(
                instrument = %self.instrument,
                candle = %candle.candle_ref(),
                "candle routed to the wrong orchestrator"
            );
            return StepOutcome::bare(candle, Action::rejected(RejectReason::Unroutable));
        }

        if let Some(last) = self.last_open_time {
            if candle.open_time == last {
                debug!(instrument = %self.instrument, at = %candle.open_time, "duplicate candle");
                return StepOutcome::bare(candle, Action::hold(HoldReason::DuplicateCandle));
            }
            if candle.open_time < last {
                warn!(
                    instrument = %self.instrument,
                    last = %last,
                    received = %candle.open_time,
                    "stale candle, resetting stream"
                );
                self.reset_stream();
                return StepOutcome::bare(candle, Action::rejected(RejectReason::StaleCandle));
            }
        }

        let model = self.predictor.pin();
        let aligned = match self.aggregator.update(candle, &model, &self.fusion) {
            Ok(aligned) => aligned,
            Err(e) => {
                warn!(instrument = %self.instrument, error = %e, "sequence error, resetting stream");
                self.reset_stream();
                return StepOutcome::bare(candle, Action::rejected(RejectReason::StaleCandle));
            }
        };
        self.last_open_time = Some(candle.open_time);
        self.last_close = Some(candle.close);

        let mut outcome = StepOutcome {
            candle_ref: candle.candle_ref(),
            action: Action::hold(HoldReason::PositionUnchanged),
            signal: aligned.fused.clone(),
            margin_violation: None,
            ml_degraded: aligned.ml_degraded,
        };

        if self.risk.state().is_active() {
            self.manage_position(candle, aligned.fused.as_ref(), ledger, &mut outcome);
        } else {
            outcome.action = self.consider_entry(candle, &aligned, ledger);
        }

        match &outcome.action {
            Action::Open { .. } | Action::Close { .. } => {}
            action => debug!(
                instrument = %self.instrument,
                at = %candle.open_time,
                action = action.kind(),
                "step"
            ),
        }
        outcome
    }

    /// Drop indicator history so the next candle starts a fresh warm-up.
    /// An open position stays with the risk manager.
    fn reset_stream(&mut self) {
        self.aggregator.reset();
        self.last_open_time = None;
        self.last_close = None;
    }

    fn manage_position(
        &mut self,
        candle: &Candle,
        fused: Option<&FusedSignal>,
        ledger: &mut dyn CapitalLedger,
        outcome: &mut StepOutcome,
    ) {
        if let Some((reason, price)) = self.risk.on_candle(candle) {
            self.close_into(price, reason, candle.open_time, ledger, outcome);
            return;
        }

        let side = self.risk.position().map(|p| p.side);
        let opposing = fused.filter(|s| {
            s.actionable
                && s.confidence >= self.fusion.config().exit_confidence
                && s.side().is_some()
                && s.side() != side
        });
        if opposing.is_some() {
            self.close_into(candle.close, ExitReason::OpposingSignal, candle.open_time, ledger, outcome);
            return;
        }

        outcome.action = match self.risk.update_trailing(candle.close) {
            TrailingUpdate::Moved { to, .. } => Action::Adjust { stop_loss: to },
            TrailingUpdate::Unchanged => Action::hold(HoldReason::PositionUnchanged),
        };
    }

    fn consider_entry(
        &mut self,
        candle: &Candle,
        aligned: &AlignedSignal,
        ledger: &mut dyn CapitalLedger,
    ) -> Action {
        let Some(signal) = &aligned.fused else {
            return Action::rejected(RejectReason::WarmUp);
        };
        let side = match signal.side() {
            Some(side) if signal.actionable => side,
            _ => return Action::rejected(RejectReason::BelowThreshold),
        };
        if let Some(veto) = &aligned.veto {
            debug!(
                instrument = %self.instrument,
                timeframe = %veto.timeframe,
                score = veto.score,
                "entry vetoed by higher timeframe"
            );
            return Action::hold(HoldReason::HigherTimeframeVeto {
                timeframe: veto.timeframe,
            });
        }

        let capital = match ledger.capital() {
            Ok(c) => c,
            Err(e) => {
                warn!(instrument = %self.instrument, error = %e, "capital ledger unavailable");
                return Action::hold(HoldReason::LedgerUnavailable);
            }
        };
        let plan = self.risk.plan_entry(side, signal.confidence, capital, candle.close);
        if plan.notional <= 0.0 || plan.size <= 0.0 {
            return Action::rejected(RejectReason::ZeroSize);
        }

        match ledger.reserve(&self.instrument, plan.notional) {
            Ok(Reservation::Granted) => {}
            Ok(Reservation::Denied { available }) => {
                warn!(
                    instrument = %self.instrument,
                    notional = plan.notional,
                    available,
                    "entry exceeds available capital"
                );
                return Action::rejected(RejectReason::MarginViolation);
            }
            Ok(Reservation::Halted { drawdown }) => {
                debug!(instrument = %self.instrument, drawdown, "entry blocked, trading halted");
                return Action::rejected(RejectReason::TradingHalted);
            }
            Ok(Reservation::PositionLimit { open }) => {
                debug!(instrument = %self.instrument, open, "entry blocked, position cap reached");
                return Action::rejected(RejectReason::MaxPositions);
            }
            Err(e) => {
                warn!(instrument = %self.instrument, error = %e, "capital ledger unavailable");
                return Action::hold(HoldReason::LedgerUnavailable);
            }
        }

        if let Err(e) = self.risk.open(&self.instrument, &plan, candle.open_time) {
            error!(instrument = %self.instrument, error = %e, "position bookkeeping out of sync");
            return Action::hold(HoldReason::PositionUnchanged);
        }

        info!(
            instrument = %self.instrument,
            side = ?plan.side,
            price = plan.entry_price,
            notional = plan.notional,
            stop_loss = plan.stop_loss,
            take_profit = plan.take_profit,
            confidence = signal.confidence,
            "OPEN"
        );
        Action::Open {
            side: plan.side,
            entry_price: plan.entry_price,
            size: plan.size,
            notional: plan.notional,
            stop_loss: plan.stop_loss,
            take_profit: plan.take_profit,
        }
    }

    fn close_into(
        &mut self,
        price: f64,
        reason: ExitReason,
        at: DateTime<Utc>,
        ledger: &mut dyn CapitalLedger,
        outcome: &mut StepOutcome,
    ) {
        if let Some((trade, violation)) = self.close_position(price, reason, at, ledger) {
            outcome.action = Action::Close { trade };
            outcome.margin_violation = violation;
        }
    }

    /// Close any open position at `price`, outside the candle flow (end of data, shutdown).
    pub fn force_close(
        &mut self,
        price: f64,
        at: DateTime<Utc>,
        reason: ExitReason,
        ledger: &mut dyn CapitalLedger,
    ) -> Option<ClosedTrade> {
        self.close_position(price, reason, at, ledger).map(|(trade, _)| trade)
    }

    fn close_position(
        &mut self,
        price: f64,
        reason: ExitReason,
        at: DateTime<Utc>,
        ledger: &mut dyn CapitalLedger,
    ) -> Option<(ClosedTrade, Option<MarginViolation>)> {
        let notional = self.risk.position().map_or(0.0, |p| p.notional);
        let mut trade = self.risk.close(price, reason, at)?;
        let violation = match ledger.settle(&trade) {
            Ok(settlement) => {
                if let Some(v) = &settlement.violation {
                    warn!(
                        instrument = %self.instrument,
                        requested_loss = v.requested_loss,
                        capped_loss = v.capped_loss,
                        "margin violation: loss capped at available capital"
                    );
                    trade.margin_capped = true;
                    trade.net_pnl = settlement.applied_pnl;
                    if notional > 0.0 {
                        trade.return_pct = settlement.applied_pnl / notional;
                    }
                }
                settlement.violation
            }
            Err(e) => {
                error!(instrument = %self.instrument, error = %e, "trade closed but not settled");
                None
            }
        };
        info!(
            instrument = %self.instrument,
            side = ?trade.side,
            reason = ?trade.exit_reason,
            price = trade.exit_price,
            net_pnl = trade.net_pnl,
            "CLOSE"
        );
        Some((trade, violation))
    }
}
