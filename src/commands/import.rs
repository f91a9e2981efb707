use crate::config::ENGINE_SETTING_KEYS;
use crate::data_context::MarketData;
use crate::models::MIN_BACKTEST_BARS;
use anyhow::Result;
use log::{info, warn};
use std::path::Path;

/// Converts a JSON market-data document into a binary snapshot.
pub fn run(input_path: &Path, output_path: &Path) -> Result<()> {
    info!("Importing market data from {}", input_path.display());
    let market_data = MarketData::load_from_json(input_path)?;

    for history in market_data.histories() {
        let details = history.info();
        match (details.first_date, details.last_date, details.latest_close) {
            (Some(first), Some(last), Some(close)) => info!(
                "{}: {} bars {} - {} (last close {:.2})",
                details.ticker,
                details.bars,
                first.format("%Y-%m-%d"),
                last.format("%Y-%m-%d"),
                close
            ),
            _ => warn!("{}: no bars", details.ticker),
        }
        if let Err(err) = history.ensure_backtestable() {
            warn!("{}", err);
        }
    }
    for key in ENGINE_SETTING_KEYS {
        if let Some(value) = market_data.setting_value(key) {
            info!("Stored setting {} = {}", key, value);
        }
    }
    if !market_data.has_data() {
        warn!("Imported document contains no histories");
    }

    market_data.save_to_file(output_path)?;
    info!(
        "Market data snapshot with {} histor{} written to {} (backtests need {}+ bars)",
        market_data.len(),
        if market_data.len() == 1 { "y" } else { "ies" },
        output_path.display(),
        MIN_BACKTEST_BARS
    );
    Ok(())
}
