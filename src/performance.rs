use crate::models::*;
use statrs::statistics::Statistics;
use std::collections::BTreeMap;

/// Entry confidence at or above which a trade counts toward the high-confidence cohort.
pub const HIGH_CONFIDENCE_COHORT: f64 = 70.0;

pub struct PerformanceCalculator;

impl PerformanceCalculator {
    /// Aggregates a closed-trade ledger. An empty ledger yields an empty report.
    pub fn calculate_performance(
        trades: &[Trade],
        initial_capital: f64,
        final_capital: f64,
    ) -> PerformanceReport {
        let mut report = PerformanceReport {
            initial_capital,
            final_capital,
            total_return_pct: Self::percent_change(initial_capital, final_capital),
            ..PerformanceReport::default()
        };
        if trades.is_empty() {
            return report;
        }

        let pnl_percents: Vec<f64> = trades.iter().map(|trade| trade.pnl_pct).collect();
        let winners: Vec<&Trade> = trades.iter().filter(|trade| trade.pnl > 0.0).collect();
        let losers: Vec<&Trade> = trades.iter().filter(|trade| trade.pnl < 0.0).collect();

        report.total_trades = trades.len();
        report.winning_trades = winners.len();
        report.losing_trades = losers.len();
        report.breakeven_trades = trades.len() - winners.len() - losers.len();
        report.win_rate = Self::ratio_pct(winners.len(), trades.len());
        report.total_pnl = trades.iter().map(|trade| trade.pnl).sum();

        report.avg_win_pct = Self::average(winners.iter().map(|trade| trade.pnl_pct));
        report.avg_loss_pct = Self::average(losers.iter().map(|trade| trade.pnl_pct));

        let gross_profit: f64 = winners.iter().map(|trade| trade.pnl).sum();
        let gross_loss: f64 = losers.iter().map(|trade| trade.pnl).sum();
        report.profit_factor = if gross_loss == 0.0 {
            f64::INFINITY
        } else {
            (gross_profit / gross_loss).abs()
        };

        report.best_trade_pct = pnl_percents.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        report.worst_trade_pct = pnl_percents.iter().copied().fold(f64::INFINITY, f64::min);
        report.pnl_pct_std_dev = if pnl_percents.len() > 1 {
            pnl_percents.iter().std_dev()
        } else {
            0.0
        };

        report.max_drawdown = Self::calculate_max_drawdown(trades);
        report.max_drawdown_pct = if initial_capital > 0.0 {
            report.max_drawdown / initial_capital * 100.0
        } else {
            0.0
        };

        report.avg_hold_days = Self::average(trades.iter().map(|trade| trade.hold_days as f64));
        report.avg_confidence = Self::average(trades.iter().map(|trade| trade.entry_confidence));

        let high_confidence: Vec<&Trade> = trades
            .iter()
            .filter(|trade| trade.entry_confidence >= HIGH_CONFIDENCE_COHORT)
            .collect();
        report.high_confidence_trades = high_confidence.len();
        report.high_confidence_win_rate = Self::ratio_pct(
            high_confidence.iter().filter(|trade| trade.pnl > 0.0).count(),
            high_confidence.len(),
        );

        let mut exit_reasons = BTreeMap::new();
        for trade in trades {
            *exit_reasons.entry(trade.exit_reason.label()).or_insert(0) += 1;
        }
        report.exit_reasons = exit_reasons;

        report
    }

    fn average(values: impl Iterator<Item = f64>) -> f64 {
        let mut sum = 0.0;
        let mut count = 0usize;

        for value in values {
            if value.is_finite() {
                sum += value;
                count += 1;
            }
        }

        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    fn ratio_pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            part as f64 / total as f64 * 100.0
        }
    }

    fn percent_change(initial: f64, current: f64) -> f64 {
        if initial > 0.0 && current.is_finite() {
            (current - initial) / initial * 100.0
        } else {
            0.0
        }
    }

    /// Largest drop from the running peak of cumulative realized P&L. The
    /// peak starts at the first trade's cumulative value, not at zero.
    fn calculate_max_drawdown(trades: &[Trade]) -> f64 {
        let mut cumulative = 0.0;
        let mut peak: Option<f64> = None;
        let mut max_drawdown = 0.0;

        for trade in trades {
            cumulative += trade.pnl;
            let current_peak = peak.map_or(cumulative, |value: f64| value.max(cumulative));
            peak = Some(current_peak);
            let drawdown = current_peak - cumulative;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }

        max_drawdown
    }
}
