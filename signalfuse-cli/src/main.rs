//! SignalFuse CLI: download, backtest, compare and live commands.
//!
//! Commands:
//! - `download` fetches recent closed candles from Binance into a Parquet or CSV store
//! - `backtest` replays a TOML run config and saves the report artifacts
//! - `compare` replays with and without the predictor and saves both reports
//! - `live` runs the paper-trading loop until Enter is pressed or `--max-cycles`

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::io::BufRead;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use signalfuse_core::data::binance::DEFAULT_BASE_URL;
use signalfuse_core::data::{
    retry_transient, BinanceSource, CircuitBreaker, CsvStore, MarketDataSource, ParquetStore, RetryPolicy,
    SimulatedSource,
};
use signalfuse_core::domain::Timeframe;
use signalfuse_core::Action;
use signalfuse_runner::export::{save_comparison, save_report};
use signalfuse_runner::report::{WITHOUT_ML, WITH_ML};
use signalfuse_runner::{
    binance_source, load_candles, load_predictor, run_backtest, run_comparison, BacktestReport, CycleReport,
    CycleStatus, LiveRunner, LiveSummary, RunConfig,
};

#[derive(Parser)]
#[command(
    name = "signalfuse",
    about = "SignalFuse: indicator + ML signal fusion with risk-adjusted decisions"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreFormat {
    Parquet,
    Csv,
}

#[derive(Subcommand)]
enum Commands {
    /// Download recent closed candles from Binance into a local store.
    Download {
        /// Instruments to download (e.g., BTCUSDT ETHUSDT).
        #[arg(required = true)]
        instruments: Vec<String>,

        /// Candle timeframe (1m, 5m, 15m, 30m, 1h, 4h, 1d).
        #[arg(long, default_value = "5m")]
        timeframe: Timeframe,

        /// Number of most recent closed candles (Binance caps this at 1000).
        #[arg(long, default_value_t = 1000)]
        limit: usize,

        #[arg(long, value_enum, default_value = "parquet")]
        format: StoreFormat,

        /// Store directory. Defaults to ./data.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,

        #[arg(long, default_value = DEFAULT_BASE_URL)]
        base_url: String,
    },
    /// Replay a run config through the decision pipeline.
    Backtest {
        /// Path to a TOML run config. Defaults apply when absent.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Override the config's output directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Replay with and without the predictor and report the difference.
    Compare {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
    /// Run the live paper-trading loop.
    Live {
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stop after this many cycles per instrument.
        #[arg(long)]
        max_cycles: Option<u64>,

        /// Skip Binance and trade the simulated walk.
        #[arg(long, default_value_t = false)]
        simulated: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Download {
            instruments,
            timeframe,
            limit,
            format,
            data_dir,
            base_url,
        } => run_download(&instruments, timeframe, limit, format, &data_dir, base_url),
        Commands::Backtest { config, output_dir } => run_backtest_cmd(config.as_deref(), output_dir),
        Commands::Compare { config, output_dir } => run_compare_cmd(config.as_deref(), output_dir),
        Commands::Live {
            config,
            max_cycles,
            simulated,
        } => run_live_cmd(config.as_deref(), max_cycles, simulated),
    }
}

fn load_config(path: Option<&Path>) -> Result<RunConfig> {
    match path {
        Some(p) => RunConfig::from_file(p).with_context(|| format!("loading {}", p.display())),
        None => {
            info!("no config given, using defaults");
            Ok(RunConfig::default())
        }
    }
}

fn run_download(
    instruments: &[String],
    timeframe: Timeframe,
    limit: usize,
    format: StoreFormat,
    data_dir: &Path,
    base_url: String,
) -> Result<()> {
    if limit < 2 {
        bail!("--limit must be at least 2");
    }
    let policy = RetryPolicy::default();
    let breaker = Arc::new(CircuitBreaker::new(Duration::from_secs(30 * 60)));
    let source = BinanceSource::new(base_url, breaker, policy.timeout())?;

    let mut failures = Vec::new();
    for instrument in instruments {
        let fetched = retry_transient(&policy, source.name(), |_| {
            source.get_candles(instrument, timeframe, limit)
        });
        let candles = match fetched {
            Ok(c) if c.is_empty() => {
                failures.push(format!("{instrument}: no closed candles returned"));
                continue;
            }
            Ok(c) => c,
            Err(e) => {
                failures.push(format!("{instrument}: {e}"));
                continue;
            }
        };
        let path = match format {
            StoreFormat::Parquet => ParquetStore::new(data_dir).write(&candles, source.name())?,
            StoreFormat::Csv => CsvStore::new(data_dir).write(&candles)?,
        };
        println!("{instrument}: {} candles -> {}", candles.len(), path.display());
    }

    if !failures.is_empty() {
        for f in &failures {
            eprintln!("Error for {f}");
        }
        std::process::exit(1);
    }
    Ok(())
}

fn run_backtest_cmd(config_path: Option<&Path>, output_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    let data = load_candles(&config)?;
    let predictor = load_predictor(config.model_path.as_deref())?;
    let label = if config.engine.fusion.w_ml > 0.0 { WITH_ML } else { WITHOUT_ML };

    let report = run_backtest(&config.engine, predictor, &data, config.initial_capital, label)?;
    print_summary(&report);

    let out = output_dir.unwrap_or_else(|| config.output_dir.clone());
    let run_dir = save_report(&report, &out, &config.run_id(&data.dataset_hash))?;
    println!("Artifacts saved to: {}", run_dir.display());
    Ok(())
}

fn run_compare_cmd(config_path: Option<&Path>, output_dir: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;
    if config.engine.fusion.w_ml == 0.0 {
        bail!("engine.fusion.w_ml is 0; nothing to compare");
    }
    let data = load_candles(&config)?;
    let predictor = load_predictor(config.model_path.as_deref())?;

    let report = run_comparison(&config.engine, predictor, &data, config.initial_capital)?;
    print_summary(&report.with_ml);
    print_summary(&report.without_ml);
    println!("=== Comparison ===");
    println!("Trade count delta:    {:+}", report.trade_count_delta);
    println!("Win rate delta:       {:+.1}%", report.win_rate_delta * 100.0);
    println!("Total PnL delta:      {:+.2}", report.total_pnl_delta);
    println!("Disagreement candles: {}", report.disagreement_candles);
    if !report.outcomes_differ() {
        println!("The predictor did not change any trade.");
    }
    println!();

    let out = output_dir.unwrap_or_else(|| config.output_dir.clone());
    let run_dir = save_comparison(&report, &out, &config.run_id(&data.dataset_hash))?;
    println!("Artifacts saved to: {}", run_dir.display());
    Ok(())
}

fn run_live_cmd(config_path: Option<&Path>, max_cycles: Option<u64>, simulated: bool) -> Result<()> {
    let mut config = load_config(config_path)?;
    if max_cycles.is_some() {
        config.live.max_cycles = max_cycles;
    }

    let fallback: Arc<dyn MarketDataSource> = Arc::new(SimulatedSource::new());
    let primary = if simulated {
        Arc::clone(&fallback)
    } else {
        binance_source(&config.live)?
    };
    let predictor = load_predictor(config.model_path.as_deref())?;

    let mut runner = LiveRunner::new(
        config.live.clone(),
        config.engine.clone(),
        config.instruments.clone(),
        primary,
        fallback,
        predictor,
    )?;
    if let Some(path) = &config.model_path {
        runner = runner.with_model_path(path.clone());
    }

    // Enter (or EOF on a closed stdin is ignored) requests a graceful stop.
    let flag = runner.shutdown_flag();
    thread::Builder::new().name("stdin-stop".into()).spawn(move || {
        let mut line = String::new();
        if let Ok(n) = std::io::stdin().lock().read_line(&mut line) {
            if n > 0 {
                flag.store(true, Ordering::SeqCst);
            }
        }
    })?;
    println!("Live loop running on {}. Press Enter to stop.", config.instruments.join(", "));

    let (tx, rx) = mpsc::channel();
    let printer = thread::Builder::new()
        .name("cycle-printer".into())
        .spawn(move || rx.iter().for_each(|r| print_cycle(&r)))?;

    let summary = runner.run(config.initial_capital, tx)?;
    if printer.join().is_err() {
        warn!("cycle printer panicked");
    }
    print_live_summary(&summary);
    Ok(())
}

fn print_cycle(report: &CycleReport) {
    let source = if report.degraded {
        format!("{} (degraded)", report.source)
    } else {
        report.source.clone()
    };
    match &report.status {
        CycleStatus::Held { reason, error } => {
            println!("[{} #{}] HOLD {} via {source}: {error}", report.instrument, report.cycle, reason.as_str());
        }
        CycleStatus::Stepped { outcomes } => {
            for o in outcomes.iter().filter(|o| !matches!(o.action, Action::Hold { .. } | Action::Rejected { .. })) {
                println!(
                    "[{} #{}] {} at {} via {source}",
                    report.instrument,
                    report.cycle,
                    o.action.kind(),
                    o.candle_ref.open_time.to_rfc3339()
                );
            }
        }
    }
}

fn print_summary(report: &BacktestReport) {
    let m = &report.metrics;
    println!();
    println!("=== Backtest Result ({}) ===", report.label);
    println!("Instruments:    {}", report.instruments.join(", "));
    if let (Some(first), Some(last)) = (report.first_candle, report.last_candle) {
        println!("Period:         {} to {}", first.to_rfc3339(), last.to_rfc3339());
    }
    println!("Candles:        {} ({})", report.candle_count, report.base_timeframe);
    println!("Model:          {}", report.model_version.as_deref().unwrap_or("none"));
    println!("Trades:         {}", m.trade_count);
    println!();
    println!("--- Performance ---");
    println!("Final Capital:  {:.2}", report.final_capital);
    println!("Total PnL:      {:.2}", m.total_pnl);
    println!("Total Return:   {:.2}%", m.total_return * 100.0);
    println!("Sharpe:         {:.3}", m.sharpe);
    println!("Sortino:        {:.3}", m.sortino);
    println!("Max Drawdown:   {:.2}%", m.max_drawdown * 100.0);
    println!("Win Rate:       {:.1}%", m.win_rate * 100.0);
    println!("Profit Factor:  {:.2}", m.profit_factor);
    println!("Expectancy:     {:.2}", m.expectancy);
    println!("Max Consec Win: {}", m.max_consecutive_wins);
    println!("Max Consec Loss:{}", m.max_consecutive_losses);
    if !report.margin_violations.is_empty() {
        println!();
        println!("WARNING: {} margin violation(s)", report.margin_violations.len());
    }
    if report.degraded_cycles > 0 {
        println!("WARNING: predictor unavailable on {} candle(s)", report.degraded_cycles);
    }
    println!();
}

fn print_live_summary(summary: &LiveSummary) {
    println!();
    println!("=== Live Session ===");
    for (instrument, cycles) in &summary.cycles {
        println!("{instrument}: {cycles} cycle(s)");
    }
    let realized: f64 = summary.trades.iter().map(|t| t.net_pnl).sum();
    println!("Trades:         {}", summary.trades.len());
    println!("Realized PnL:   {realized:.2}");
    println!("Capital:        {:.2}", summary.account.capital());
    for instrument in &summary.degraded_instruments {
        println!("WARNING: {instrument} ran on the simulated fallback");
    }
    println!();
}
