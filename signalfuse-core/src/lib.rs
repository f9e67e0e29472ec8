//! SignalFuse Core: indicators, predictor adapter, multi-timeframe fusion, risk, orchestration.
//!
//! This crate contains the decision engine:
//! - Domain types (candles, positions, closed trades, account ledger)
//! - Streaming indicators (RSI, MACD, EMA, Bollinger) with a causality guarantee
//! - Predictor adapter over a versioned feature schema, with atomic model swaps
//! - Multi-timeframe aggregation with higher-timeframe veto
//! - Signal fusion with a confidence gate
//! - Kelly-bounded sizing, stops, and a ratcheting trailing stop
//! - Per-instrument decision orchestrator (one action per candle)
//! - Market data collaborators: Binance REST, simulated walk, Parquet/CSV stores

pub mod aggregator;
pub mod config;
pub mod data;
pub mod domain;
pub mod fusion;
pub mod indicators;
pub mod orchestrator;
pub mod predictor;
pub mod risk;

pub use config::{ConfigError, EngineConfig};
pub use orchestrator::{Action, DecisionOrchestrator, HoldReason, RejectReason, StepOutcome};
