pub mod backtest;
pub mod batch;
pub mod import;
pub mod signal;

use crate::config::{
    merge_env_settings, EngineConfig, ExitMode, SETTING_ENTRY_CONFIDENCE, SETTING_EXIT_MODE,
    SETTING_INITIAL_CAPITAL, SETTING_MAX_HOLD_DAYS,
};
use crate::data_context::MarketData;
use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Engine settings given explicitly on the command line. They win over
/// environment variables, which win over the snapshot's stored settings.
#[derive(Debug, Clone, Default)]
pub struct EngineOverrides {
    pub initial_capital: Option<f64>,
    pub entry_confidence_threshold: Option<f64>,
    pub max_hold_days: Option<i64>,
    pub exit_mode: Option<ExitMode>,
}

impl EngineOverrides {
    fn apply(&self, settings: &mut HashMap<String, String>) {
        if let Some(capital) = self.initial_capital {
            settings.insert(SETTING_INITIAL_CAPITAL.to_string(), capital.to_string());
        }
        if let Some(threshold) = self.entry_confidence_threshold {
            settings.insert(SETTING_ENTRY_CONFIDENCE.to_string(), threshold.to_string());
        }
        if let Some(days) = self.max_hold_days {
            settings.insert(SETTING_MAX_HOLD_DAYS.to_string(), days.to_string());
        }
        if let Some(mode) = self.exit_mode {
            settings.insert(SETTING_EXIT_MODE.to_string(), mode.label().to_string());
        }
    }
}

pub fn resolve_engine_config(
    stored_settings: &HashMap<String, String>,
    overrides: &EngineOverrides,
) -> Result<EngineConfig> {
    let mut settings = merge_env_settings(stored_settings);
    overrides.apply(&mut settings);
    EngineConfig::from_settings_map(&settings)
}

/// Loads a snapshot, optionally narrowed to `tickers`.
pub fn load_market_data(path: &Path, tickers: &[String]) -> Result<MarketData> {
    let market_data = MarketData::load_from_file(path)?;
    if tickers.is_empty() {
        return Ok(market_data);
    }
    let allowed: HashSet<String> = tickers
        .iter()
        .map(|ticker| ticker.trim().to_ascii_uppercase())
        .filter(|ticker| !ticker.is_empty())
        .collect();
    market_data.restrict_to_tickers(&allowed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_overrides_win_over_stored_settings() {
        let mut stored = HashMap::new();
        stored.insert(SETTING_MAX_HOLD_DAYS.to_string(), "4".to_string());
        stored.insert(SETTING_ENTRY_CONFIDENCE.to_string(), "70".to_string());

        let overrides = EngineOverrides {
            max_hold_days: Some(12),
            exit_mode: Some(ExitMode::Fixed),
            ..EngineOverrides::default()
        };
        let config = resolve_engine_config(&stored, &overrides).unwrap();
        assert_eq!(config.max_hold_days, 12);
        assert_eq!(config.exit_mode, ExitMode::Fixed);
        if std::env::var(SETTING_ENTRY_CONFIDENCE).is_err() {
            assert_eq!(config.entry_confidence_threshold, 70.0);
        }
    }

    #[test]
    fn invalid_override_is_rejected() {
        let overrides = EngineOverrides {
            entry_confidence_threshold: Some(150.0),
            ..EngineOverrides::default()
        };
        assert!(resolve_engine_config(&HashMap::new(), &overrides).is_err());
    }
}
