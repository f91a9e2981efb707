use anyhow::{anyhow, Result as AnyResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Minimum number of bars a history needs before it can be simulated (Ichimoku lookback).
pub const MIN_BACKTEST_BARS: usize = 52;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceBar {
    pub date: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum HistoryError {
    #[error("no price data found for {ticker}")]
    Empty { ticker: String },
    #[error("insufficient data for {ticker}: need at least {required} bars, got {actual}")]
    Insufficient {
        ticker: String,
        required: usize,
        actual: usize,
    },
    #[error("{ticker}: {field} is not a finite number on {date}")]
    NonFiniteValue {
        ticker: String,
        field: &'static str,
        date: DateTime<Utc>,
    },
    #[error("{ticker}: bar dated {date} is out of chronological order")]
    Unordered { ticker: String, date: DateTime<Utc> },
    #[error("{ticker}: duplicate bar for {date}")]
    DuplicateDate { ticker: String, date: DateTime<Utc> },
}

/// Chronological, date-unique daily bars for one instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PriceHistory {
    ticker: String,
    bars: Vec<PriceBar>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryInfo {
    pub ticker: String,
    pub bars: usize,
    pub first_date: Option<DateTime<Utc>>,
    pub last_date: Option<DateTime<Utc>>,
    pub latest_close: Option<f64>,
}

impl PriceHistory {
    pub fn new(ticker: impl Into<String>, bars: Vec<PriceBar>) -> Result<Self, HistoryError> {
        let ticker = ticker.into();
        for (index, bar) in bars.iter().enumerate() {
            for (field, value) in [
                ("open", bar.open),
                ("high", bar.high),
                ("low", bar.low),
                ("close", bar.close),
            ] {
                if !value.is_finite() {
                    return Err(HistoryError::NonFiniteValue {
                        ticker,
                        field,
                        date: bar.date,
                    });
                }
            }
            if index > 0 {
                let previous = bars[index - 1].date;
                if bar.date == previous {
                    return Err(HistoryError::DuplicateDate {
                        ticker,
                        date: bar.date,
                    });
                }
                if bar.date < previous {
                    return Err(HistoryError::Unordered {
                        ticker,
                        date: bar.date,
                    });
                }
            }
        }
        Ok(Self { ticker, bars })
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn bars(&self) -> &[PriceBar] {
        &self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn last(&self) -> Option<&PriceBar> {
        self.bars.last()
    }

    /// Checks the history is long enough to be replayed by the simulator.
    pub fn ensure_backtestable(&self) -> Result<(), HistoryError> {
        if self.bars.is_empty() {
            return Err(HistoryError::Empty {
                ticker: self.ticker.clone(),
            });
        }
        if self.bars.len() < MIN_BACKTEST_BARS {
            return Err(HistoryError::Insufficient {
                ticker: self.ticker.clone(),
                required: MIN_BACKTEST_BARS,
                actual: self.bars.len(),
            });
        }
        Ok(())
    }

    pub fn info(&self) -> HistoryInfo {
        HistoryInfo {
            ticker: self.ticker.clone(),
            bars: self.bars.len(),
            first_date: self.bars.first().map(|bar| bar.date),
            last_date: self.bars.last().map(|bar| bar.date),
            latest_close: self.bars.last().map(|bar| bar.close),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
        }
    }
}

impl fmt::Display for SignalAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> AnyResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "hold" => Ok(SignalAction::Hold),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MacdOutput {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
    pub previous_histogram: Option<f64>,
}

impl MacdOutput {
    pub fn is_bullish(&self) -> bool {
        self.macd > self.signal
    }

    /// Histogram was negative on the prior bar and the MACD line is now above its signal.
    pub fn is_bullish_cross(&self) -> bool {
        self.is_bullish() && matches!(self.previous_histogram, Some(prev) if prev < 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StochasticOutput {
    pub k: f64,
    pub d: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct BollingerBands {
    pub lower: Option<f64>,
    pub middle: Option<f64>,
    pub upper: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct VolumeProfile {
    pub support: Option<f64>,
    pub resistance: Option<f64>,
    pub point_of_control: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FibonacciLevel {
    pub ratio: f64,
    pub price: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FibonacciLevels {
    pub swing_high: f64,
    pub swing_low: f64,
    pub range: f64,
    pub levels: Vec<FibonacciLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IchimokuCloud {
    pub tenkan_sen: f64,
    pub kijun_sen: f64,
    pub senkou_span_a: Option<f64>,
    pub senkou_span_b: Option<f64>,
    /// Current close, plotted 26 bars back.
    pub chikou_span: f64,
    pub cloud_top: Option<f64>,
    pub cloud_bottom: Option<f64>,
    pub cloud_bullish: bool,
    pub price_above_cloud: bool,
    pub price_below_cloud: bool,
    pub price_in_cloud: bool,
    pub tk_cross_bullish: bool,
    pub tk_cross_bearish: bool,
}

/// Indicator values as of one evaluation bar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    pub date: DateTime<Utc>,
    pub price: f64,
    pub rsi: f64,
    pub sma_5: f64,
    pub sma_10: f64,
    pub sma_20: f64,
    pub sma_50: f64,
    pub sma_100: f64,
    pub ema_20: f64,
    pub ema_50: f64,
    pub macd: MacdOutput,
    pub stochastic: StochasticOutput,
    pub atr: f64,
    pub volume: f64,
    pub avg_volume_20: f64,
    pub volume_ratio: f64,
    pub bollinger: BollingerBands,
    pub bollinger_squeeze: bool,
    pub volume_profile: VolumeProfile,
    pub fibonacci: FibonacciLevels,
    pub ichimoku: Option<IchimokuCloud>,
    pub swing_support: f64,
    pub swing_resistance: f64,
}

impl IndicatorSnapshot {
    /// Moving averages used as support/resistance references, with their labels.
    pub fn support_moving_averages(&self) -> [(&'static str, f64); 4] {
        [
            ("SMA20", self.sma_20),
            ("SMA50", self.sma_50),
            ("EMA20", self.ema_20),
            ("EMA50", self.ema_50),
        ]
    }

    pub fn atr_ratio(&self) -> f64 {
        if self.price > 0.0 {
            self.atr / self.price
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalDecision {
    pub action: SignalAction,
    pub confidence: f64,
    pub buy_confidence: f64,
    pub sell_confidence: f64,
    /// Triggered conditions of the chosen side, in evaluation order.
    pub reasons: Vec<String>,
    /// Every condition that fired on either side.
    pub conditions: Vec<String>,
    pub snapshot: Option<IndicatorSnapshot>,
}

impl SignalDecision {
    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            confidence: 0.0,
            buy_confidence: 0.0,
            sell_confidence: 0.0,
            reasons: vec![reason.into()],
            conditions: Vec::new(),
            snapshot: None,
        }
    }

    pub fn reason(&self) -> String {
        self.reasons.join(" | ")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    pub shares: i64,
    pub entry_price: f64,
    pub entry_date: DateTime<Utc>,
    pub entry_confidence: f64,
    pub entry_reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExitReason {
    TakeProfitTarget { tier: u8 },
    DynamicStopLoss { stop_pct: f64 },
    FixedTakeProfit { pct: f64 },
    FixedStopLoss { pct: f64 },
    MaxHold { days: i64 },
    BearishSignal,
    EndOfPeriod,
}

impl ExitReason {
    /// Stable label without run-specific numbers, used to bucket exits.
    pub fn label(&self) -> String {
        match self {
            ExitReason::TakeProfitTarget { tier } => format!("Take Profit Target {}", tier),
            ExitReason::DynamicStopLoss { .. } => "Dynamic Stop Loss".to_string(),
            ExitReason::FixedTakeProfit { .. } => "Take Profit".to_string(),
            ExitReason::FixedStopLoss { .. } => "Stop Loss".to_string(),
            ExitReason::MaxHold { .. } => "Max Hold".to_string(),
            ExitReason::BearishSignal => "Bearish signal exit".to_string(),
            ExitReason::EndOfPeriod => "End of period".to_string(),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::TakeProfitTarget { tier } => write!(f, "Take Profit Target {}", tier),
            ExitReason::DynamicStopLoss { stop_pct } => {
                write!(f, "Dynamic Stop Loss ({:.1}%)", stop_pct)
            }
            ExitReason::FixedTakeProfit { pct } => write!(f, "Take Profit ({:.1}%)", pct),
            ExitReason::FixedStopLoss { pct } => write!(f, "Stop Loss ({:.1}%)", pct),
            ExitReason::MaxHold { days } => write!(f, "Max Hold ({} days)", days),
            ExitReason::BearishSignal => f.write_str("Bearish signal exit"),
            ExitReason::EndOfPeriod => f.write_str("End of period"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub ticker: String,
    pub entry_date: DateTime<Utc>,
    pub exit_date: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub shares: i64,
    pub pnl: f64,
    pub pnl_pct: f64,
    pub exit_reason: ExitReason,
    pub hold_days: i64,
    pub entry_confidence: f64,
    pub entry_signal_reason: String,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit_targets: Option<[f64; 3]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingPlan {
    pub current_price: f64,
    pub recommended_entry: f64,
    pub entry_range_low: f64,
    pub entry_range_high: f64,
    pub entry_range_pct: f64,
    pub take_profit_1: f64,
    pub take_profit_2: f64,
    pub take_profit_3: f64,
    pub stop_loss: f64,
    pub stop_loss_pct: f64,
    pub risk_reward_1: f64,
    pub risk_reward_2: f64,
    pub risk_reward_3: f64,
    pub position_size: f64,
    pub max_position_value: f64,
    pub dynamic_stop: bool,
    pub weighted_entry: bool,
    pub volatility_adjusted: bool,
    pub support_levels_used: usize,
}

fn serialize_ratio<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if value.is_infinite() {
        serializer.serialize_str("inf")
    } else {
        serializer.serialize_f64(*value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PerformanceReport {
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub breakeven_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub total_return_pct: f64,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub avg_win_pct: f64,
    pub avg_loss_pct: f64,
    #[serde(serialize_with = "serialize_ratio")]
    pub profit_factor: f64,
    pub best_trade_pct: f64,
    pub worst_trade_pct: f64,
    pub pnl_pct_std_dev: f64,
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub avg_hold_days: f64,
    pub avg_confidence: f64,
    pub high_confidence_trades: usize,
    pub high_confidence_win_rate: f64,
    pub exit_reasons: BTreeMap<String, usize>,
}

impl PerformanceReport {
    pub fn is_empty(&self) -> bool {
        self.total_trades == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(day: u32, close: f64) -> PriceBar {
        PriceBar {
            date: Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1_000.0,
        }
    }

    #[test]
    fn history_rejects_duplicate_and_unordered_dates() {
        let duplicate = PriceHistory::new("DUP", vec![bar(1, 10.0), bar(1, 11.0)]);
        assert!(matches!(duplicate, Err(HistoryError::DuplicateDate { .. })));

        let unordered = PriceHistory::new("ORD", vec![bar(2, 10.0), bar(1, 11.0)]);
        assert!(matches!(unordered, Err(HistoryError::Unordered { .. })));
    }

    #[test]
    fn history_rejects_nan_close() {
        let mut broken = bar(3, 10.0);
        broken.close = f64::NAN;
        let err = PriceHistory::new("NAN", vec![bar(1, 10.0), broken]).unwrap_err();
        assert_eq!(
            err,
            HistoryError::NonFiniteValue {
                ticker: "NAN".to_string(),
                field: "close",
                date: broken.date,
            }
        );
    }

    #[test]
    fn short_history_is_not_backtestable() {
        let history = PriceHistory::new("SHORT", (1..=20).map(|d| bar(d, 10.0)).collect()).unwrap();
        let err = history.ensure_backtestable().unwrap_err();
        assert!(err.to_string().contains("need at least 52 bars, got 20"));
    }

    #[test]
    fn exit_reason_display_matches_ledger_wording() {
        assert_eq!(
            ExitReason::TakeProfitTarget { tier: 3 }.to_string(),
            "Take Profit Target 3"
        );
        assert_eq!(
            ExitReason::DynamicStopLoss { stop_pct: -2.04 }.to_string(),
            "Dynamic Stop Loss (-2.0%)"
        );
        assert_eq!(ExitReason::FixedStopLoss { pct: 1.5 }.to_string(), "Stop Loss (1.5%)");
        assert_eq!(ExitReason::MaxHold { days: 10 }.to_string(), "Max Hold (10 days)");
        assert_eq!(
            ExitReason::DynamicStopLoss { stop_pct: -5.0 }.label(),
            "Dynamic Stop Loss"
        );
    }

    #[test]
    fn signal_action_parses_case_insensitively() {
        assert_eq!("buy".parse::<SignalAction>().unwrap(), SignalAction::Buy);
        assert_eq!(" SELL ".parse::<SignalAction>().unwrap(), SignalAction::Sell);
        assert!("short".parse::<SignalAction>().is_err());
    }
}
