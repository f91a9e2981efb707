use crate::indicators::round_to_cents;
use crate::models::{ExitReason, IndicatorSnapshot, SignalAction, TradingPlan};
use chrono::{DateTime, Utc};

pub const PRICE_EPSILON: f64 = 1e-6;

pub const SUPPORT_STOP_BUFFER: f64 = 0.995;
pub const MOVING_AVERAGE_STOP_BUFFER: f64 = 0.99;
pub const ATR_STOP_MULTIPLIER: f64 = 1.5;
pub const MAX_STOP_DISTANCE: f64 = 0.08;
pub const MIN_STOP_DISTANCE: f64 = 0.02;
pub const MAX_TARGET_GAIN: f64 = 0.15;

pub const HIGH_VOLATILITY_ATR_RATIO: f64 = 0.03;
pub const MEDIUM_VOLATILITY_ATR_RATIO: f64 = 0.015;
pub const HIGH_VOLATILITY_TARGETS: [f64; 3] = [0.04, 0.07, 0.10];
pub const MEDIUM_VOLATILITY_TARGETS: [f64; 3] = [0.03, 0.05, 0.08];
pub const LOW_VOLATILITY_TARGETS: [f64; 3] = [0.02, 0.04, 0.06];
/// Plan targets when ATR is unavailable.
pub const FALLBACK_PLAN_TARGETS: [f64; 3] = [0.03, 0.05, 0.07];

#[derive(Debug, Clone, PartialEq)]
pub struct PositionAllocation {
    pub shares: i64,
    pub allocation: f64,
    pub allocation_ratio: f64,
}

#[derive(Debug, PartialEq)]
pub enum PositionSizingOutcome {
    Sized(PositionAllocation),
    BelowThreshold,
    TooSmall,
}

pub struct PositionSizingParams {
    pub price: f64,
    pub available_capital: f64,
    pub confidence: f64,
    pub entry_threshold: f64,
    pub high_confidence_threshold: f64,
    pub high_confidence_allocation: f64,
    pub base_allocation: f64,
}

/// Confidence-tiered allocation, rounded down to whole shares.
pub fn determine_position_size(params: PositionSizingParams) -> PositionSizingOutcome {
    let PositionSizingParams {
        price,
        available_capital,
        confidence,
        entry_threshold,
        high_confidence_threshold,
        high_confidence_allocation,
        base_allocation,
    } = params;

    if price <= 0.0 || !price.is_finite() || !available_capital.is_finite() {
        return PositionSizingOutcome::TooSmall;
    }

    if confidence < entry_threshold {
        return PositionSizingOutcome::BelowThreshold;
    }
    let allocation_ratio = if confidence >= high_confidence_threshold {
        high_confidence_allocation
    } else {
        base_allocation
    };

    let allocation = available_capital.max(0.0) * allocation_ratio;
    let shares = (allocation / price).floor();
    if shares < 1.0 {
        return PositionSizingOutcome::TooSmall;
    }

    PositionSizingOutcome::Sized(PositionAllocation {
        shares: shares as i64,
        allocation,
        allocation_ratio,
    })
}

/// Support and resistance references for stop and target placement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyLevels {
    pub bollinger_lower: Option<f64>,
    pub bollinger_upper: Option<f64>,
    pub volume_support: Option<f64>,
    pub volume_resistance: Option<f64>,
    pub cloud_top: Option<f64>,
    pub moving_averages: Vec<f64>,
    pub fibonacci: Vec<f64>,
    pub atr: f64,
}

impl KeyLevels {
    pub fn from_snapshot(snapshot: &IndicatorSnapshot) -> Self {
        Self {
            bollinger_lower: snapshot.bollinger.lower,
            bollinger_upper: snapshot.bollinger.upper,
            volume_support: snapshot.volume_profile.support,
            volume_resistance: snapshot.volume_profile.resistance,
            cloud_top: snapshot.ichimoku.and_then(|cloud| cloud.cloud_top),
            moving_averages: snapshot
                .support_moving_averages()
                .iter()
                .map(|(_, value)| *value)
                .collect(),
            fibonacci: snapshot
                .fibonacci
                .levels
                .iter()
                .map(|level| level.price)
                .collect(),
            atr: snapshot.atr,
        }
    }
}

fn positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

pub fn volatility_targets(atr_ratio: f64) -> [f64; 3] {
    if atr_ratio > HIGH_VOLATILITY_ATR_RATIO {
        HIGH_VOLATILITY_TARGETS
    } else if atr_ratio > MEDIUM_VOLATILITY_ATR_RATIO {
        MEDIUM_VOLATILITY_TARGETS
    } else {
        LOW_VOLATILITY_TARGETS
    }
}

/// Lowest candidate stop, kept between 2% and 8% below entry.
pub fn dynamic_stop_loss(entry_price: f64, levels: &KeyLevels) -> f64 {
    let mut candidates = Vec::new();

    if let Some(lower) = positive(levels.bollinger_lower) {
        candidates.push(lower * SUPPORT_STOP_BUFFER);
    }
    if let Some(support) = positive(levels.volume_support) {
        candidates.push(support * SUPPORT_STOP_BUFFER);
    }
    if let Some(strongest) = levels
        .moving_averages
        .iter()
        .copied()
        .filter(|&ma| ma > 0.0 && ma < entry_price)
        .reduce(f64::max)
    {
        candidates.push(strongest * MOVING_AVERAGE_STOP_BUFFER);
    }
    if levels.atr > 0.0 {
        candidates.push(entry_price - levels.atr * ATR_STOP_MULTIPLIER);
    }
    if let Some(strongest) = levels
        .fibonacci
        .iter()
        .copied()
        .filter(|&price| price > 0.0 && price < entry_price)
        .reduce(f64::max)
    {
        candidates.push(strongest * SUPPORT_STOP_BUFFER);
    }

    match candidates.into_iter().reduce(f64::min) {
        Some(stop) => stop
            .max(entry_price * (1.0 - MAX_STOP_DISTANCE))
            .min(entry_price * (1.0 - MIN_STOP_DISTANCE)),
        None => entry_price * (1.0 - MIN_STOP_DISTANCE),
    }
}

/// Three ascending-tier targets: the closest resistances above entry, each
/// averaged with its volatility base, capped at 15% above entry.
pub fn dynamic_take_profits(entry_price: f64, levels: &KeyLevels) -> [f64; 3] {
    let mut resistances: Vec<f64> = [
        levels.bollinger_upper,
        levels.volume_resistance,
        levels.cloud_top,
    ]
    .iter()
    .flatten()
    .copied()
    .chain(levels.fibonacci.iter().copied())
    .filter(|&level| level.is_finite() && level > entry_price)
    .collect();
    resistances.sort_by(|a, b| a.total_cmp(b));

    let atr_ratio = if entry_price > 0.0 {
        levels.atr / entry_price
    } else {
        0.0
    };
    let base = volatility_targets(atr_ratio);

    let mut targets = [0.0; 3];
    for (tier, target) in targets.iter_mut().enumerate() {
        let pct = match resistances.get(tier) {
            Some(&resistance) => ((resistance - entry_price) / entry_price + base[tier]) / 2.0,
            None => base[tier],
        };
        *target = (entry_price * (1.0 + pct)).min(entry_price * (1.0 + MAX_TARGET_GAIN));
    }
    targets
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitLevels {
    Dynamic {
        take_profits: [f64; 3],
        stop_loss: f64,
    },
    Fixed {
        take_profit_pct: f64,
        stop_loss_pct: f64,
    },
}

pub struct ExitCheck {
    pub price: f64,
    pub entry_price: f64,
    pub entry_date: DateTime<Utc>,
    pub current_date: DateTime<Utc>,
    pub max_hold_days: i64,
    pub signal: SignalAction,
    pub signal_confidence: f64,
    pub signal_exit_confidence: f64,
    pub min_signal_exit_hold_days: i64,
    pub levels: ExitLevels,
}

/// First exit condition that holds, in priority order: targets (highest tier
/// first), stop, max hold, bearish signal.
pub fn evaluate_exit(check: &ExitCheck) -> Option<ExitReason> {
    let held_days = (check.current_date - check.entry_date).num_days();
    let price = check.price;

    match check.levels {
        ExitLevels::Dynamic {
            take_profits,
            stop_loss,
        } => {
            for tier in (0..3).rev() {
                if price >= take_profits[tier] {
                    return Some(ExitReason::TakeProfitTarget {
                        tier: tier as u8 + 1,
                    });
                }
            }
            if price <= stop_loss {
                return Some(ExitReason::DynamicStopLoss {
                    stop_pct: (stop_loss - check.entry_price) / check.entry_price * 100.0,
                });
            }
        }
        ExitLevels::Fixed {
            take_profit_pct,
            stop_loss_pct,
        } => {
            if price >= check.entry_price * (1.0 + take_profit_pct / 100.0) {
                return Some(ExitReason::FixedTakeProfit {
                    pct: take_profit_pct,
                });
            }
            if price <= check.entry_price * (1.0 - stop_loss_pct / 100.0) {
                return Some(ExitReason::FixedStopLoss { pct: stop_loss_pct });
            }
        }
    }

    if held_days >= check.max_hold_days {
        return Some(ExitReason::MaxHold {
            days: check.max_hold_days,
        });
    }
    if held_days >= check.min_signal_exit_hold_days
        && check.signal == SignalAction::Sell
        && check.signal_confidence >= check.signal_exit_confidence
    {
        return Some(ExitReason::BearishSignal);
    }
    None
}

fn average(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Entry range, targets, stop and sizing for a buy setup at the snapshot's close.
pub fn build_trading_plan(snapshot: &IndicatorSnapshot, confidence: f64) -> TradingPlan {
    let price = snapshot.price;
    let mut entry_candidates: Vec<(f64, f64)> = Vec::new();

    if let Some(lower) = positive(snapshot.bollinger.lower) {
        if price <= lower * 1.02 {
            entry_candidates.push((lower, 3.0));
        }
    }
    if let Some(support) = positive(snapshot.volume_profile.support) {
        if price <= support * 1.02 {
            entry_candidates.push((support, 3.0));
        }
    }
    let ma_supports: Vec<f64> = snapshot
        .support_moving_averages()
        .iter()
        .map(|(_, value)| *value)
        .filter(|&ma| ma > 0.0 && price <= ma * 1.01)
        .collect();
    if let Some(avg) = average(&ma_supports) {
        entry_candidates.push((avg, 2.0));
    }
    let fib_supports: Vec<f64> = snapshot
        .fibonacci
        .levels
        .iter()
        .map(|level| level.price)
        .filter(|&level| level < price && price <= level * 1.02)
        .collect();
    if let Some(avg) = average(&fib_supports) {
        entry_candidates.push((avg, 2.0));
    }
    let support_levels_used = entry_candidates.len();
    if entry_candidates.is_empty() {
        entry_candidates.push((price, 1.0));
    }

    let weighted_entry = entry_candidates.len() > 1;
    let (recommended_entry, range_low, range_high) = if weighted_entry {
        let total_weight: f64 = entry_candidates.iter().map(|(_, weight)| weight).sum();
        let optimal = entry_candidates
            .iter()
            .map(|(level, weight)| level * weight)
            .sum::<f64>()
            / total_weight;
        (optimal, optimal * 0.99, optimal * 1.01)
    } else {
        let single = entry_candidates[0].0;
        (single, single * 0.99, single * 1.02)
    };
    let entry_range_low = range_low.min(price * 0.98);
    let entry_range_high = range_high.max(price * 1.02);

    let atr = snapshot.atr;
    let target_pcts = if atr > 0.0 {
        volatility_targets(atr / price)
    } else {
        FALLBACK_PLAN_TARGETS
    };
    let targets = target_pcts.map(|pct| recommended_entry * (1.0 + pct));

    let mut stop_candidates = Vec::new();
    if let Some(lower) = positive(snapshot.bollinger.lower) {
        stop_candidates.push(lower * SUPPORT_STOP_BUFFER);
    }
    if let Some(support) = positive(snapshot.volume_profile.support) {
        stop_candidates.push(support * SUPPORT_STOP_BUFFER);
    }
    if atr > 0.0 {
        stop_candidates.push(recommended_entry - atr * ATR_STOP_MULTIPLIER);
    }
    let dynamic_stop = !stop_candidates.is_empty();
    let stop_loss = match stop_candidates.into_iter().reduce(f64::min) {
        Some(stop) => stop.min(recommended_entry * 0.99),
        None => recommended_entry * (1.0 - MIN_STOP_DISTANCE),
    };

    let risk = recommended_entry - stop_loss;
    let risk_reward = targets.map(|target| {
        if risk > 0.0 {
            (target - recommended_entry) / risk
        } else {
            0.0
        }
    });

    let mut position_size = if confidence >= 75.0 {
        0.7
    } else if confidence >= 65.0 {
        0.5
    } else {
        0.3
    };
    let avg_risk_reward = risk_reward.iter().sum::<f64>() / 3.0;
    if avg_risk_reward >= 3.0 {
        position_size = (position_size * 1.2_f64).min(0.8);
    } else if avg_risk_reward < 1.5 {
        position_size *= 0.7;
    }

    let entry_range_pct = if entry_range_low > 0.0 {
        (entry_range_high - entry_range_low) / entry_range_low * 100.0
    } else {
        0.0
    };
    let stop_loss_pct = if recommended_entry > 0.0 {
        (stop_loss - recommended_entry) / recommended_entry * 100.0
    } else {
        0.0
    };

    TradingPlan {
        current_price: price,
        recommended_entry: round_to_cents(recommended_entry),
        entry_range_low: round_to_cents(entry_range_low),
        entry_range_high: round_to_cents(entry_range_high),
        entry_range_pct,
        take_profit_1: round_to_cents(targets[0]),
        take_profit_2: round_to_cents(targets[1]),
        take_profit_3: round_to_cents(targets[2]),
        stop_loss: round_to_cents(stop_loss),
        stop_loss_pct,
        risk_reward_1: round_to_cents(risk_reward[0]),
        risk_reward_2: round_to_cents(risk_reward[1]),
        risk_reward_3: round_to_cents(risk_reward[2]),
        position_size: round_to_cents(position_size),
        max_position_value: round_to_cents(position_size * price),
        dynamic_stop,
        weighted_entry,
        volatility_adjusted: atr > 0.0,
        support_levels_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        BollingerBands, FibonacciLevels, MacdOutput, StochasticOutput, VolumeProfile,
    };
    use chrono::{Duration, TimeZone};

    fn sizing(confidence: f64, price: f64, capital: f64) -> PositionSizingOutcome {
        determine_position_size(PositionSizingParams {
            price,
            available_capital: capital,
            confidence,
            entry_threshold: 65.0,
            high_confidence_threshold: 75.0,
            high_confidence_allocation: 0.8,
            base_allocation: 0.6,
        })
    }

    #[test]
    fn sizing_uses_confidence_tiers_and_whole_shares() {
        match sizing(80.0, 3_000.0, 10_000_000.0) {
            PositionSizingOutcome::Sized(allocation) => {
                assert_eq!(allocation.shares, 2_666);
                assert_eq!(allocation.allocation_ratio, 0.8);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        match sizing(70.0, 3_000.0, 10_000_000.0) {
            PositionSizingOutcome::Sized(allocation) => assert_eq!(allocation.shares, 2_000),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(
            sizing(60.0, 3_000.0, 10_000_000.0),
            PositionSizingOutcome::BelowThreshold
        );
        assert_eq!(sizing(90.0, 5_000.0, 1_000.0), PositionSizingOutcome::TooSmall);
    }

    #[test]
    fn take_profits_without_resistance_follow_low_volatility_base() {
        let levels = KeyLevels {
            atr: 100.0,
            ..KeyLevels::default()
        };
        let targets = dynamic_take_profits(10_000.0, &levels);
        assert!((targets[0] - 10_200.0).abs() < 1e-9);
        assert!((targets[1] - 10_400.0).abs() < 1e-9);
        assert!((targets[2] - 10_600.0).abs() < 1e-9);
    }

    #[test]
    fn take_profits_blend_closest_resistances_and_cap() {
        let levels = KeyLevels {
            bollinger_upper: Some(105.0),
            fibonacci: vec![98.0, 130.0],
            atr: 4.0,
            ..KeyLevels::default()
        };
        let targets = dynamic_take_profits(100.0, &levels);
        // high volatility base: 4%, 7%, 10%
        assert!((targets[0] - 104.5).abs() < 1e-9);
        assert!((targets[1] - 115.0).abs() < 1e-9);
        assert!((targets[2] - 110.0).abs() < 1e-9);
    }

    #[test]
    fn stop_loss_takes_lowest_candidate_within_band() {
        let levels = KeyLevels {
            bollinger_lower: Some(97.0),
            volume_support: Some(96.0),
            moving_averages: vec![99.0, 101.0],
            atr: 1.0,
            fibonacci: vec![95.0, 104.0],
            ..KeyLevels::default()
        };
        // candidates: 96.515, 95.52, 98.01, 98.5, 94.525
        assert!((dynamic_stop_loss(100.0, &levels) - 94.525).abs() < 1e-9);

        let deep = KeyLevels {
            bollinger_lower: Some(50.0),
            ..KeyLevels::default()
        };
        assert!((dynamic_stop_loss(100.0, &deep) - 92.0).abs() < 1e-9);

        let shallow = KeyLevels {
            moving_averages: vec![99.9],
            ..KeyLevels::default()
        };
        assert!((dynamic_stop_loss(100.0, &shallow) - 98.0).abs() < 1e-9);
        assert!((dynamic_stop_loss(100.0, &KeyLevels::default()) - 98.0).abs() < 1e-9);
    }

    fn exit_check(price: f64, days_held: i64, levels: ExitLevels) -> ExitCheck {
        let entry_date = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        ExitCheck {
            price,
            entry_price: 100.0,
            entry_date,
            current_date: entry_date + Duration::days(days_held),
            max_hold_days: 10,
            signal: SignalAction::Sell,
            signal_confidence: 90.0,
            signal_exit_confidence: 60.0,
            min_signal_exit_hold_days: 1,
            levels,
        }
    }

    #[test]
    fn highest_take_profit_tier_wins_over_stop() {
        let levels = ExitLevels::Dynamic {
            take_profits: [101.0, 102.0, 103.0],
            stop_loss: 110.0,
        };
        let reason = evaluate_exit(&exit_check(105.0, 20, levels));
        assert_eq!(reason, Some(ExitReason::TakeProfitTarget { tier: 3 }));

        let reason = evaluate_exit(&exit_check(102.5, 20, levels));
        assert_eq!(reason, Some(ExitReason::TakeProfitTarget { tier: 2 }));
    }

    #[test]
    fn stop_then_max_hold_then_signal() {
        let levels = ExitLevels::Dynamic {
            take_profits: [104.0, 107.0, 110.0],
            stop_loss: 97.0,
        };
        match evaluate_exit(&exit_check(96.0, 20, levels)) {
            Some(ExitReason::DynamicStopLoss { stop_pct }) => {
                assert!((stop_pct + 3.0).abs() < 1e-9)
            }
            other => panic!("unexpected exit {:?}", other),
        }
        assert_eq!(
            evaluate_exit(&exit_check(100.0, 10, levels)),
            Some(ExitReason::MaxHold { days: 10 })
        );
        assert_eq!(
            evaluate_exit(&exit_check(100.0, 1, levels)),
            Some(ExitReason::BearishSignal)
        );
        assert_eq!(evaluate_exit(&exit_check(100.0, 0, levels)), None);
    }

    #[test]
    fn fixed_levels_use_percentages() {
        let levels = ExitLevels::Fixed {
            take_profit_pct: 3.0,
            stop_loss_pct: 1.5,
        };
        assert_eq!(
            evaluate_exit(&exit_check(103.5, 0, levels)),
            Some(ExitReason::FixedTakeProfit { pct: 3.0 })
        );
        assert_eq!(
            evaluate_exit(&exit_check(98.0, 0, levels)),
            Some(ExitReason::FixedStopLoss { pct: 1.5 })
        );
    }

    fn plan_snapshot(price: f64, atr: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            date: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            price,
            rsi: 45.0,
            sma_5: price,
            sma_10: price,
            sma_20: price * 0.8,
            sma_50: price * 0.8,
            sma_100: price * 0.8,
            ema_20: price * 0.8,
            ema_50: price * 0.8,
            macd: MacdOutput {
                macd: 0.0,
                signal: 0.0,
                histogram: 0.0,
                previous_histogram: None,
            },
            stochastic: StochasticOutput { k: 50.0, d: 50.0 },
            atr,
            volume: 1_000.0,
            avg_volume_20: 1_000.0,
            volume_ratio: 1.0,
            bollinger: BollingerBands::default(),
            bollinger_squeeze: false,
            volume_profile: VolumeProfile::default(),
            fibonacci: FibonacciLevels {
                swing_high: price,
                swing_low: price,
                range: 0.0,
                levels: Vec::new(),
            },
            ichimoku: None,
            swing_support: price,
            swing_resistance: price,
        }
    }

    #[test]
    fn plan_without_supports_uses_current_price() {
        let plan = build_trading_plan(&plan_snapshot(100.0, 0.0), 70.0);
        assert_eq!(plan.recommended_entry, 100.0);
        assert_eq!(plan.entry_range_low, 98.0);
        assert_eq!(plan.entry_range_high, 102.0);
        assert_eq!(plan.take_profit_1, 103.0);
        assert_eq!(plan.take_profit_3, 107.0);
        assert_eq!(plan.stop_loss, 98.0);
        assert!(!plan.dynamic_stop);
        // rewards 3/5/7 over risk 2 average 2.5, so size stays at the 65+ tier
        assert_eq!(plan.position_size, 0.5);
        assert_eq!(plan.support_levels_used, 0);
    }

    #[test]
    fn plan_weights_nearby_supports() {
        let mut snapshot = plan_snapshot(100.0, 1.0);
        snapshot.bollinger.lower = Some(99.0);
        snapshot.volume_profile.support = Some(99.5);
        let plan = build_trading_plan(&snapshot, 80.0);
        // (99 * 3 + 99.5 * 3) / 6
        assert_eq!(plan.recommended_entry, 99.25);
        assert!(plan.weighted_entry);
        assert!(plan.dynamic_stop);
        assert_eq!(plan.support_levels_used, 2);
        // stop = min(98.505, 99.0025, 97.75) = 97.75, risk 1.5; average reward/risk ~2.6
        assert_eq!(plan.stop_loss, 97.75);
        assert_eq!(plan.position_size, 0.7);
        assert!(plan.volatility_adjusted);
    }
}
