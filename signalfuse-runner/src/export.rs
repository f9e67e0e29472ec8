//! JSON, CSV and Markdown artifacts for reports.
//!
//! - **JSON**: full report serialization with schema versioning
//! - **CSV**: trade tape and equity curve for external plotting
//! - **Markdown**: human-readable single-run report and with/without-ML comparison
//!
//! Artifact directories are named from the run id, so re-running the same
//! config over the same data overwrites the same files with identical bytes.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use signalfuse_core::domain::ClosedTrade;

use crate::report::{BacktestReport, ComparisonReport, SCHEMA_VERSION};

/// Run-id characters used in artifact directory names.
const RUN_ID_PREFIX: usize = 12;

// ─── JSON export ────────────────────────────────────────────────────

pub fn export_json(report: &BacktestReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("failed to serialize BacktestReport to JSON")
}

/// Deserialize a `BacktestReport`, rejecting unknown schema versions.
pub fn import_json(json: &str) -> Result<BacktestReport> {
    let report: BacktestReport =
        serde_json::from_str(json).context("failed to deserialize BacktestReport from JSON")?;
    check_schema(report.schema_version)?;
    Ok(report)
}

pub fn export_comparison_json(report: &ComparisonReport) -> Result<String> {
    serde_json::to_string_pretty(report).context("failed to serialize ComparisonReport to JSON")
}

pub fn import_comparison_json(json: &str) -> Result<ComparisonReport> {
    let report: ComparisonReport =
        serde_json::from_str(json).context("failed to deserialize ComparisonReport from JSON")?;
    check_schema(report.schema_version)?;
    Ok(report)
}

fn check_schema(version: u32) -> Result<()> {
    if version > SCHEMA_VERSION {
        bail!(
            "unsupported schema version {} (max supported: {})",
            version,
            SCHEMA_VERSION
        );
    }
    Ok(())
}

// ─── CSV export ─────────────────────────────────────────────────────

/// Columns: instrument, side, entry_time, exit_time, entry_price, exit_price,
/// size, gross_pnl, fees, net_pnl, return_pct, exit_reason, candles_held, margin_capped
pub fn export_trades_csv(trades: &[ClosedTrade]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);

    wtr.write_record([
        "instrument",
        "side",
        "entry_time",
        "exit_time",
        "entry_price",
        "exit_price",
        "size",
        "gross_pnl",
        "fees",
        "net_pnl",
        "return_pct",
        "exit_reason",
        "candles_held",
        "margin_capped",
    ])?;

    for t in trades {
        let reason = serde_json::to_value(t.exit_reason)?;
        wtr.write_record([
            t.instrument.as_str(),
            &format!("{:?}", t.side).to_uppercase(),
            &t.entry_time.to_rfc3339(),
            &t.exit_time.to_rfc3339(),
            &format!("{:.6}", t.entry_price),
            &format!("{:.6}", t.exit_price),
            &format!("{:.8}", t.size),
            &format!("{:.4}", t.gross_pnl),
            &format!("{:.4}", t.fees),
            &format!("{:.4}", t.net_pnl),
            &format!("{:.6}", t.return_pct),
            reason.as_str().unwrap_or_default(),
            &t.candles_held.to_string(),
            &t.margin_capped.to_string(),
        ])?;
    }

    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

/// Columns: step, equity. Step 0 is the initial capital.
pub fn export_equity_csv(equity_curve: &[f64]) -> Result<String> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    wtr.write_record(["step", "equity"])?;
    for (i, eq) in equity_curve.iter().enumerate() {
        wtr.write_record([&i.to_string(), &format!("{:.2}", eq)])?;
    }
    let data = wtr.into_inner().context("failed to flush CSV writer")?;
    String::from_utf8(data).context("CSV output is not valid UTF-8")
}

// ─── Artifact bundle ────────────────────────────────────────────────

fn short_id(run_id: &str) -> &str {
    run_id.get(..RUN_ID_PREFIX).unwrap_or(run_id)
}

fn write_report_files(report: &BacktestReport, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("failed to create artifact dir: {}", dir.display()))?;
    std::fs::write(dir.join("report.json"), export_json(report)?)?;
    std::fs::write(dir.join("trades.csv"), export_trades_csv(&report.trades)?)?;
    std::fs::write(dir.join("equity.csv"), export_equity_csv(&report.equity_curve)?)?;
    std::fs::write(dir.join("report.md"), generate_report(report))?;
    Ok(())
}

/// Save one replay under `{output_dir}/{label}_{run_id prefix}/`.
///
/// Writes `report.json`, `trades.csv`, `equity.csv` and `report.md`.
pub fn save_report(report: &BacktestReport, output_dir: &Path, run_id: &str) -> Result<PathBuf> {
    let run_dir = output_dir.join(format!("{}_{}", report.label, short_id(run_id)));
    write_report_files(report, &run_dir)?;
    Ok(run_dir)
}

/// Save a comparison under `{output_dir}/compare_{run_id prefix}/`, with one
/// sub-directory per replay.
pub fn save_comparison(report: &ComparisonReport, output_dir: &Path, run_id: &str) -> Result<PathBuf> {
    let run_dir = output_dir.join(format!("compare_{}", short_id(run_id)));
    std::fs::create_dir_all(&run_dir)
        .with_context(|| format!("failed to create artifact dir: {}", run_dir.display()))?;
    std::fs::write(run_dir.join("comparison.json"), export_comparison_json(report)?)?;
    std::fs::write(run_dir.join("comparison.md"), generate_comparison(report))?;
    write_report_files(&report.with_ml, &run_dir.join(&report.with_ml.label))?;
    write_report_files(&report.without_ml, &run_dir.join(&report.without_ml.label))?;
    Ok(run_dir)
}

/// Load a `BacktestReport` from an artifact directory's report.json.
pub fn load_report(dir: &Path) -> Result<BacktestReport> {
    let path = dir.join("report.json");
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    import_json(&json)
}

// ─── Markdown reports ───────────────────────────────────────────────

pub fn generate_report(report: &BacktestReport) -> String {
    let mut md = String::with_capacity(2048);

    md.push_str(&format!("# Backtest Report ({})\n\n", report.label));

    md.push_str("## Metadata\n\n");
    md.push_str("| Field | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Instruments | {} |\n", report.instruments.join(", ")));
    md.push_str(&format!("| Timeframe | {} |\n", report.base_timeframe));
    if let (Some(first), Some(last)) = (report.first_candle, report.last_candle) {
        md.push_str(&format!("| Period | {} to {} |\n", first.to_rfc3339(), last.to_rfc3339()));
    }
    md.push_str(&format!("| Candles | {} |\n", report.candle_count));
    md.push_str(&format!("| Initial Capital | {:.2} |\n", report.initial_capital));
    md.push_str(&format!("| Final Capital | {:.2} |\n", report.final_capital));
    md.push_str(&format!(
        "| Model | {} |\n",
        report.model_version.as_deref().unwrap_or("none (indicators only)")
    ));
    md.push_str(&format!("| Dataset Hash | {} |\n", report.dataset_hash));
    md.push('\n');

    let m = &report.metrics;
    md.push_str("## Performance Summary\n\n");
    md.push_str("| Metric | Value |\n");
    md.push_str("| --- | --- |\n");
    md.push_str(&format!("| Total PnL | {:.2} |\n", m.total_pnl));
    md.push_str(&format!("| Total Return | {:.2}% |\n", m.total_return * 100.0));
    md.push_str(&format!("| Max Drawdown | {:.2}% |\n", m.max_drawdown * 100.0));
    md.push_str(&format!("| Sharpe | {:.3} |\n", m.sharpe));
    md.push_str(&format!("| Sortino | {:.3} |\n", m.sortino));
    md.push_str(&format!("| Win Rate | {:.1}% |\n", m.win_rate * 100.0));
    md.push_str(&format!("| Profit Factor | {:.2} |\n", m.profit_factor));
    md.push_str(&format!("| Expectancy | {:.2} |\n", m.expectancy));
    md.push_str(&format!("| Trades | {} |\n", m.trade_count));
    md.push_str(&format!("| Avg Candles Held | {:.1} |\n", m.avg_candles_held));
    md.push('\n');

    if report.degraded_cycles > 0 || !report.margin_violations.is_empty() {
        md.push_str("## Incidents\n\n");
        if report.degraded_cycles > 0 {
            md.push_str(&format!(
                "- Model unavailable on {} candles (indicator-only fusion)\n",
                report.degraded_cycles
            ));
        }
        for v in &report.margin_violations {
            md.push_str(&format!(
                "- Margin violation on {} at {}: loss {:.2} capped at {:.2}\n",
                v.instrument,
                v.at.to_rfc3339(),
                v.requested_loss,
                v.capped_loss
            ));
        }
        md.push('\n');
    }

    md
}

/// Side-by-side with/without-ML table with deltas.
pub fn generate_comparison(report: &ComparisonReport) -> String {
    let a = &report.with_ml;
    let b = &report.without_ml;
    let mut md = String::with_capacity(2048);

    md.push_str("# Predictor Comparison\n\n");
    md.push_str(&format!(
        "Candles where the predictor disagreed with the indicators: {}\n\n",
        report.disagreement_candles
    ));

    md.push_str("| Metric | With ML | Without ML | Delta |\n");
    md.push_str("| --- | ---: | ---: | ---: |\n");
    md.push_str(&format!(
        "| Trades | {} | {} | {:+} |\n",
        a.metrics.trade_count, b.metrics.trade_count, report.trade_count_delta
    ));
    let rows = [
        ("Win Rate", a.metrics.win_rate * 100.0, b.metrics.win_rate * 100.0, "%"),
        ("Total PnL", a.metrics.total_pnl, b.metrics.total_pnl, ""),
        ("Total Return", a.metrics.total_return * 100.0, b.metrics.total_return * 100.0, "%"),
        ("Max Drawdown", a.metrics.max_drawdown * 100.0, b.metrics.max_drawdown * 100.0, "%"),
        ("Sharpe", a.metrics.sharpe, b.metrics.sharpe, ""),
    ];
    for (name, x, y, unit) in rows {
        md.push_str(&format!("| {name} | {x:.2}{unit} | {y:.2}{unit} | {:+.2}{unit} |\n", x - y));
    }
    md.push('\n');

    if report.identical_trades {
        md.push_str("Both runs took identical trades.\n");
    }
    md
}
