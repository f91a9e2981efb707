use crate::scoring::ScoringWeights;
use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::env;

pub const SETTING_INITIAL_CAPITAL: &str = "BACKTEST_INITIAL_CAPITAL";
pub const SETTING_ENTRY_CONFIDENCE: &str = "ENTRY_CONFIDENCE_THRESHOLD";
pub const SETTING_MAX_HOLD_DAYS: &str = "MAX_HOLD_DAYS";
pub const SETTING_EXIT_MODE: &str = "EXIT_MODE";
pub const ENGINE_SETTING_KEYS: [&str; 4] = [
    SETTING_INITIAL_CAPITAL,
    SETTING_ENTRY_CONFIDENCE,
    SETTING_MAX_HOLD_DAYS,
    SETTING_EXIT_MODE,
];

pub const DEFAULT_INITIAL_CAPITAL: f64 = 10_000_000.0;
pub const DEFAULT_ENTRY_CONFIDENCE: f64 = 65.0;
pub const DEFAULT_MAX_HOLD_DAYS: i64 = 10;

/// Which value the low-conviction veto inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LowConvictionBasis {
    /// Evidence points accumulated before any penalty or veto.
    PreVeto,
    /// The running score after the extension and falling-knife penalties.
    PostPenalty,
}

/// Thresholds for the signal scorer.
#[derive(Debug, Clone)]
pub struct SignalConfig {
    pub min_history: usize,
    pub rsi_overbought: f64,
    pub rsi_oversold: f64,
    pub stochastic_overbought: f64,
    pub stochastic_oversold: f64,
    pub reversal_rsi_low: f64,
    pub reversal_rsi_high: f64,
    pub volume_surge_ratio: f64,
    pub support_proximity: f64,
    pub resistance_proximity: f64,
    pub decision_threshold: f64,
    pub low_conviction_ceiling: f64,
    pub sell_extension_cap: f64,
    pub low_conviction_basis: LowConvictionBasis,
    pub weights: ScoringWeights,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            min_history: 100,
            rsi_overbought: 70.0,
            rsi_oversold: 30.0,
            stochastic_overbought: 80.0,
            stochastic_oversold: 20.0,
            reversal_rsi_low: 30.0,
            reversal_rsi_high: 50.0,
            volume_surge_ratio: 1.8,
            support_proximity: 0.02,
            resistance_proximity: 0.01,
            decision_threshold: 50.0,
            low_conviction_ceiling: 80.0,
            sell_extension_cap: 40.0,
            low_conviction_basis: LowConvictionBasis::PreVeto,
            weights: ScoringWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExitMode {
    /// Support/resistance driven stop and three take-profit tiers
    Dynamic,
    /// Fixed percentage take-profit and stop-loss
    Fixed,
}

impl ExitMode {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "dynamic" => Ok(Self::Dynamic),
            "fixed" => Ok(Self::Fixed),
            other => Err(anyhow!(
                "{} must be DYNAMIC or FIXED (value: {})",
                SETTING_EXIT_MODE,
                other
            )),
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Dynamic => "dynamic",
            Self::Fixed => "fixed",
        }
    }
}

/// Backtest simulation parameters
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub initial_capital: f64,
    pub entry_confidence_threshold: f64,
    pub high_confidence_threshold: f64,
    pub high_confidence_allocation: f64,
    pub base_allocation: f64,
    pub max_hold_days: i64,
    pub signal_exit_confidence: f64,
    pub min_signal_exit_hold_days: i64,
    /// First bar index the simulator evaluates (Ichimoku lookback).
    pub start_index: usize,
    pub exit_mode: ExitMode,
    pub fixed_take_profit_pct: f64,
    pub fixed_stop_loss_pct: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_capital: DEFAULT_INITIAL_CAPITAL,
            entry_confidence_threshold: DEFAULT_ENTRY_CONFIDENCE,
            high_confidence_threshold: 75.0,
            high_confidence_allocation: 0.8,
            base_allocation: 0.6,
            max_hold_days: DEFAULT_MAX_HOLD_DAYS,
            signal_exit_confidence: 60.0,
            min_signal_exit_hold_days: 1,
            start_index: 52,
            exit_mode: ExitMode::Dynamic,
            fixed_take_profit_pct: 3.0,
            fixed_stop_loss_pct: 1.5,
        }
    }
}

impl EngineConfig {
    /// Builds a config from optional settings, falling back to defaults for missing keys.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(capital) =
            optional_setting_f64(settings, SETTING_INITIAL_CAPITAL, Some(0.0), None)?
        {
            if capital <= 0.0 {
                return Err(anyhow!(
                    "Setting {} must be > 0 (value: {})",
                    SETTING_INITIAL_CAPITAL,
                    capital
                ));
            }
            config.initial_capital = capital;
        }
        if let Some(threshold) =
            optional_setting_f64(settings, SETTING_ENTRY_CONFIDENCE, Some(0.0), Some(100.0))?
        {
            config.entry_confidence_threshold = threshold;
        }
        if let Some(days) = optional_setting_i64(settings, SETTING_MAX_HOLD_DAYS, 1)? {
            config.max_hold_days = days;
        }
        if let Some(raw) = optional_setting(settings, SETTING_EXIT_MODE) {
            config.exit_mode = ExitMode::parse(raw)?;
        }
        Ok(config)
    }
}

/// Overlays process environment values for the engine keys on top of `settings`.
pub fn merge_env_settings(settings: &HashMap<String, String>) -> HashMap<String, String> {
    let mut merged = settings.clone();
    for key in ENGINE_SETTING_KEYS {
        if let Ok(value) = env::var(key) {
            if !value.trim().is_empty() {
                merged.insert(key.to_string(), value);
            }
        }
    }
    merged
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<Option<f64>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(Some(value))
}

fn optional_setting_i64(
    settings: &HashMap<String, String>,
    key: &str,
    min: i64,
) -> Result<Option<i64>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<i64>()
        .map_err(|_| anyhow!("Setting {} must be an integer (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(Some(value))
}
