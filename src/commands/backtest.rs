use crate::commands::{load_market_data, resolve_engine_config, EngineOverrides};
use crate::config::SignalConfig;
use crate::engine::{BacktestRun, Engine};
use crate::models::PerformanceReport;
use crate::signals::SignalEngine;
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

pub fn run(
    market_data_path: &Path,
    ticker: &str,
    overrides: &EngineOverrides,
    json: bool,
) -> Result<()> {
    let market_data = load_market_data(market_data_path, &[])?;
    let history = market_data.history(ticker)?;
    let config = resolve_engine_config(market_data.settings(), overrides)?;
    info!(
        "Backtesting {} over {} bars ({} exits, entry threshold {:.0}, max hold {} days)",
        history.ticker(),
        history.len(),
        config.exit_mode.label(),
        config.entry_confidence_threshold,
        config.max_hold_days
    );

    let engine = Engine::new(config);
    let signal_engine = SignalEngine::new(SignalConfig::default());
    let run = engine.backtest(history, &signal_engine)?;

    if json {
        let rendered =
            serde_json::to_string_pretty(&run).context("Failed to render backtest as JSON")?;
        println!("{}", rendered);
    } else {
        print_run(&run);
    }
    Ok(())
}

pub(crate) fn print_run(run: &BacktestRun) {
    println!(
        "\n=== BACKTEST {} ({} exits) ===\n",
        run.ticker,
        run.exit_mode.label()
    );
    for trade in &run.trades {
        println!(
            "{} -> {} | {:>10.2} -> {:>10.2} | {:>8} sh | {:>+7.2}% | {:>14.2} | {}",
            trade.entry_date.format("%Y-%m-%d"),
            trade.exit_date.format("%Y-%m-%d"),
            trade.entry_price,
            trade.exit_price,
            trade.shares,
            trade.pnl_pct,
            trade.pnl,
            trade.exit_reason
        );
    }
    println!();
    print_performance(&run.performance);
}

pub(crate) fn print_performance(report: &PerformanceReport) {
    if report.is_empty() {
        println!("  No trades.");
        println!(
            "  Final capital: {:.2} (initial {:.2})",
            report.final_capital, report.initial_capital
        );
        return;
    }
    println!(
        "  Trades: {} ({} wins, {} losses, {} breakeven)",
        report.total_trades, report.winning_trades, report.losing_trades, report.breakeven_trades
    );
    println!("  Win Rate: {:.2}%", report.win_rate);
    println!(
        "  Total P&L: {:.2} ({:+.2}%)",
        report.total_pnl, report.total_return_pct
    );
    println!(
        "  Final capital: {:.2} (initial {:.2})",
        report.final_capital, report.initial_capital
    );
    if report.profit_factor.is_infinite() {
        println!("  Profit Factor: inf");
    } else {
        println!("  Profit Factor: {:.2}", report.profit_factor);
    }
    println!(
        "  Avg win / loss: {:+.2}% / {:+.2}%",
        report.avg_win_pct, report.avg_loss_pct
    );
    println!(
        "  Best / worst: {:+.2}% / {:+.2}%",
        report.best_trade_pct, report.worst_trade_pct
    );
    println!(
        "  Max Drawdown: {:.2} ({:.2}% of initial capital)",
        report.max_drawdown, report.max_drawdown_pct
    );
    println!(
        "  Avg hold: {:.1} days | Avg confidence: {:.1}",
        report.avg_hold_days, report.avg_confidence
    );
    println!(
        "  High-confidence trades: {} (win rate {:.2}%)",
        report.high_confidence_trades, report.high_confidence_win_rate
    );
    println!("  Exit reasons:");
    for (reason, count) in &report.exit_reasons {
        println!("    {}: {}", reason, count);
    }
}
