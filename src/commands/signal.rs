use crate::commands::load_market_data;
use crate::config::SignalConfig;
use crate::models::{SignalDecision, TradingPlan};
use crate::signals::SignalEngine;
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct SignalReport<'a> {
    ticker: &'a str,
    decision: &'a SignalDecision,
    trading_plan: Option<TradingPlan>,
}

pub fn run(market_data_path: &Path, tickers: &[String], json: bool) -> Result<()> {
    let market_data = load_market_data(market_data_path, tickers)?;
    let engine = SignalEngine::new(SignalConfig::default());

    info!(
        "Evaluating latest signals for {} ticker{}",
        market_data.len(),
        if market_data.len() == 1 { "" } else { "s" }
    );
    let results = engine.scan(market_data.histories());

    if json {
        let reports: Vec<SignalReport> = results
            .iter()
            .map(|(ticker, decision)| SignalReport {
                ticker,
                decision,
                trading_plan: engine.trading_plan(decision),
            })
            .collect();
        let rendered =
            serde_json::to_string_pretty(&reports).context("Failed to render signals as JSON")?;
        println!("{}", rendered);
        return Ok(());
    }

    for (ticker, decision) in &results {
        print_decision(ticker, decision);
        if let Some(plan) = engine.trading_plan(decision) {
            print_plan(&plan);
        }
        println!();
    }
    Ok(())
}

fn print_decision(ticker: &str, decision: &SignalDecision) {
    let price = decision
        .snapshot
        .as_ref()
        .map(|snapshot| format!("{:.2}", snapshot.price))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{:<8} {:<4} {:>5.1}% | Price: {:>10} | buy {:.0} / sell {:.0}",
        ticker,
        decision.action,
        decision.confidence,
        price,
        decision.buy_confidence,
        decision.sell_confidence
    );
    println!("  {}", decision.reason());
}

fn print_plan(plan: &TradingPlan) {
    println!(
        "  Entry: {:.2} (range {:.2} - {:.2}, {:.1}%)",
        plan.recommended_entry, plan.entry_range_low, plan.entry_range_high, plan.entry_range_pct
    );
    println!(
        "  Targets: {:.2} / {:.2} / {:.2} (R:R {:.2} / {:.2} / {:.2})",
        plan.take_profit_1,
        plan.take_profit_2,
        plan.take_profit_3,
        plan.risk_reward_1,
        plan.risk_reward_2,
        plan.risk_reward_3
    );
    println!(
        "  Stop: {:.2} ({:.1}%) | Position size: {:.0}% of capital",
        plan.stop_loss,
        plan.stop_loss_pct,
        plan.position_size * 100.0
    );
}
