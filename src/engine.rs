use crate::config::{EngineConfig, ExitMode};
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::signals::SignalSource;
use crate::trading_rules::{
    determine_position_size, dynamic_stop_loss, dynamic_take_profits, evaluate_exit, ExitCheck,
    ExitLevels, KeyLevels, PositionSizingOutcome, PositionSizingParams,
};
use anyhow::{anyhow, ensure, Result};
use log::{debug, info};
use serde::Serialize;
use uuid::Uuid;

const PNL_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, Serialize)]
pub struct BacktestRun {
    pub id: Uuid,
    pub ticker: String,
    pub source_id: String,
    pub exit_mode: ExitMode,
    pub initial_capital: f64,
    pub final_capital: f64,
    pub bars_evaluated: usize,
    /// BUY signals that cleared the threshold but could not afford one share.
    pub skipped_entries: usize,
    pub trades: Vec<Trade>,
    pub performance: PerformanceReport,
}

pub struct Engine {
    pub config: EngineConfig,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(EngineConfig::default())
    }
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self { config }
    }

    /// Replays `source` bar by bar over `history`, holding at most one position.
    pub fn backtest(&self, history: &PriceHistory, source: &dyn SignalSource) -> Result<BacktestRun> {
        history.ensure_backtestable()?;
        ensure!(
            self.config.initial_capital.is_finite() && self.config.initial_capital > 0.0,
            "Initial capital must be positive (value: {})",
            self.config.initial_capital
        );

        let ticker = history.ticker();
        let bars = history.bars();
        let start = self.config.start_index.min(bars.len());
        let warmup = source.min_data_points();

        let mut capital = self.config.initial_capital;
        let mut position: Option<Position> = None;
        let mut trades: Vec<Trade> = Vec::new();
        let mut skipped_entries = 0usize;

        for index in start..bars.len() {
            if index + 1 < warmup {
                continue;
            }
            let bar = &bars[index];
            let decision = source.generate_signal(&bars[..=index]);

            if let Some(open) = position.as_ref() {
                let levels = self.exit_levels(open.entry_price, decision.snapshot.as_ref());
                let check = ExitCheck {
                    price: bar.close,
                    entry_price: open.entry_price,
                    entry_date: open.entry_date,
                    current_date: bar.date,
                    max_hold_days: self.config.max_hold_days,
                    signal: decision.action,
                    signal_confidence: decision.confidence,
                    signal_exit_confidence: self.config.signal_exit_confidence,
                    min_signal_exit_hold_days: self.config.min_signal_exit_hold_days,
                    levels,
                };
                if let Some(reason) = evaluate_exit(&check) {
                    let trade = close_position(ticker, open, bar, reason, Some(levels));
                    debug!(
                        "{} exit {} @ {:.2} ({}) pnl {:.2}",
                        ticker,
                        bar.date.format("%Y-%m-%d"),
                        bar.close,
                        trade.exit_reason,
                        trade.pnl
                    );
                    capital += trade.pnl;
                    trades.push(trade);
                    position = None;
                }
            }

            if position.is_none() && decision.action == SignalAction::Buy {
                let sizing = determine_position_size(PositionSizingParams {
                    price: bar.close,
                    available_capital: capital,
                    confidence: decision.confidence,
                    entry_threshold: self.config.entry_confidence_threshold,
                    high_confidence_threshold: self.config.high_confidence_threshold,
                    high_confidence_allocation: self.config.high_confidence_allocation,
                    base_allocation: self.config.base_allocation,
                });
                match sizing {
                    PositionSizingOutcome::Sized(allocation) => {
                        debug!(
                            "{} entry {} @ {:.2}: {} shares ({:.0}% of capital, confidence {:.0})",
                            ticker,
                            bar.date.format("%Y-%m-%d"),
                            bar.close,
                            allocation.shares,
                            allocation.allocation_ratio * 100.0,
                            decision.confidence
                        );
                        position = Some(Position {
                            shares: allocation.shares,
                            entry_price: bar.close,
                            entry_date: bar.date,
                            entry_confidence: decision.confidence,
                            entry_reason: decision.reason(),
                        });
                    }
                    PositionSizingOutcome::TooSmall => {
                        skipped_entries += 1;
                        debug!(
                            "{} entry skipped on {}: capital {:.2} buys no shares at {:.2}",
                            ticker,
                            bar.date.format("%Y-%m-%d"),
                            capital,
                            bar.close
                        );
                    }
                    PositionSizingOutcome::BelowThreshold => {}
                }
            }
        }

        if let Some(open) = position.take() {
            let last = bars
                .last()
                .ok_or_else(|| anyhow!("{} has no bars to close the open position", ticker))?;
            let trade = close_position(ticker, &open, last, ExitReason::EndOfPeriod, None);
            capital += trade.pnl;
            trades.push(trade);
        }

        self.validate_trades(&trades, capital)?;

        let performance = PerformanceCalculator::calculate_performance(
            &trades,
            self.config.initial_capital,
            capital,
        );
        info!(
            "{}: {} trade{} over {} bars, final capital {:.2} (P&L {:.2})",
            ticker,
            trades.len(),
            if trades.len() == 1 { "" } else { "s" },
            bars.len().saturating_sub(start),
            capital,
            capital - self.config.initial_capital
        );

        Ok(BacktestRun {
            id: Uuid::new_v4(),
            ticker: ticker.to_string(),
            source_id: source.id().to_string(),
            exit_mode: self.config.exit_mode,
            initial_capital: self.config.initial_capital,
            final_capital: capital,
            bars_evaluated: bars.len().saturating_sub(start),
            skipped_entries,
            trades,
            performance,
        })
    }

    /// Stop and targets in force today. Dynamic levels follow the current
    /// snapshot; without one they fall back to a 2% stop and low-volatility targets.
    fn exit_levels(&self, entry_price: f64, snapshot: Option<&IndicatorSnapshot>) -> ExitLevels {
        match self.config.exit_mode {
            ExitMode::Fixed => ExitLevels::Fixed {
                take_profit_pct: self.config.fixed_take_profit_pct,
                stop_loss_pct: self.config.fixed_stop_loss_pct,
            },
            ExitMode::Dynamic => {
                let levels = snapshot.map(KeyLevels::from_snapshot).unwrap_or_default();
                ExitLevels::Dynamic {
                    take_profits: dynamic_take_profits(entry_price, &levels),
                    stop_loss: dynamic_stop_loss(entry_price, &levels),
                }
            }
        }
    }

    fn validate_trades(&self, trades: &[Trade], final_capital: f64) -> Result<()> {
        let mut previous_exit = None;
        for (index, trade) in trades.iter().enumerate() {
            ensure!(trade.shares > 0, "Trade {} has no shares", index);
            ensure!(
                trade.entry_price.is_finite() && trade.entry_price > 0.0,
                "Trade {} entry price {} is invalid",
                index,
                trade.entry_price
            );
            ensure!(
                trade.exit_price.is_finite(),
                "Trade {} exit price is not finite",
                index
            );
            ensure!(
                trade.exit_date >= trade.entry_date,
                "Trade {} exits on {} before its entry on {}",
                index,
                trade.exit_date,
                trade.entry_date
            );
            if let Some(prev) = previous_exit {
                ensure!(
                    trade.entry_date >= prev,
                    "Trade {} opened on {} while the previous position was open until {}",
                    index,
                    trade.entry_date,
                    prev
                );
            }
            let expected = (trade.exit_price - trade.entry_price) * trade.shares as f64;
            ensure!(
                (trade.pnl - expected).abs() <= PNL_EPSILON * expected.abs().max(1.0),
                "Trade {} pnl {:.6} does not match prices (expected {:.6})",
                index,
                trade.pnl,
                expected
            );
            previous_exit = Some(trade.exit_date);
        }

        let expected_capital = trades
            .iter()
            .fold(self.config.initial_capital, |acc, trade| acc + trade.pnl);
        ensure!(
            (final_capital - expected_capital).abs() <= PNL_EPSILON,
            "Final capital {:.6} differs from initial capital plus realized P&L {:.6}",
            final_capital,
            expected_capital
        );
        Ok(())
    }
}

fn close_position(
    ticker: &str,
    position: &Position,
    bar: &PriceBar,
    exit_reason: ExitReason,
    levels: Option<ExitLevels>,
) -> Trade {
    let exit_price = bar.close;
    let pnl = (exit_price - position.entry_price) * position.shares as f64;
    let (stop_loss, take_profit_targets) = match levels {
        Some(ExitLevels::Dynamic {
            take_profits,
            stop_loss,
        }) => (Some(stop_loss), Some(take_profits)),
        _ => (None, None),
    };
    Trade {
        ticker: ticker.to_string(),
        entry_date: position.entry_date,
        exit_date: bar.date,
        entry_price: position.entry_price,
        exit_price,
        shares: position.shares,
        pnl,
        pnl_pct: (exit_price - position.entry_price) / position.entry_price * 100.0,
        exit_reason,
        hold_days: (bar.date - position.entry_date).num_days(),
        entry_confidence: position.entry_confidence,
        entry_signal_reason: position.entry_reason.clone(),
        stop_loss,
        take_profit_targets,
    }
}
