use crate::backtester::BatchBacktester;
use crate::commands::backtest::print_performance;
use crate::commands::{load_market_data, resolve_engine_config, EngineOverrides};
use crate::config::SignalConfig;
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

pub fn run(
    market_data_path: &Path,
    tickers: &[String],
    overrides: &EngineOverrides,
    workers: Option<usize>,
    json: bool,
) -> Result<()> {
    let market_data = load_market_data(market_data_path, tickers)?;
    let config = resolve_engine_config(market_data.settings(), overrides)?;
    let histories = market_data.histories().cloned().collect();

    let mut backtester = BatchBacktester::new(config, SignalConfig::default()).with_progress(!json);
    if let Some(workers) = workers {
        backtester = backtester.with_workers(workers);
    }
    let outcome = backtester.run(histories)?;

    info!(
        "Batch finished: {} succeeded, {} failed, {} trade{}",
        outcome.runs.len(),
        outcome.failures.len(),
        outcome.total_trades(),
        if outcome.total_trades() == 1 { "" } else { "s" }
    );

    if json {
        let rendered =
            serde_json::to_string_pretty(&outcome).context("Failed to render batch as JSON")?;
        println!("{}", rendered);
        return Ok(());
    }

    println!("\n=== BATCH RESULTS ({} instruments) ===\n", outcome.runs.len());
    for run in &outcome.runs {
        println!("{}:", run.ticker);
        print_performance(&run.performance);
        println!();
    }
    if !outcome.failures.is_empty() {
        println!("Failures:");
        for failure in &outcome.failures {
            println!("  {}: {}", failure.ticker, failure.error);
        }
    }
    println!("Combined P&L: {:.2}", outcome.total_pnl());
    Ok(())
}
