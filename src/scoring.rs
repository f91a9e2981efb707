//! Ordered rule tables for the buy and sell confidence scores.
//!
//! Each rule either adds or subtracts points, vetoes the side to zero (which
//! stops evaluation of that side), or caps the running score.

use crate::config::{LowConvictionBasis, SignalConfig};
use crate::models::IndicatorSnapshot;

pub const LONG_TERM_UPTREND_POINTS: f64 = 30.0;
pub const MEDIUM_TERM_UPTREND_POINTS: f64 = 10.0;
pub const DIP_SUPPORT_POINTS: f64 = 35.0;
pub const MOVING_AVERAGE_SUPPORT_POINTS: f64 = 5.0;
pub const REVERSAL_POINTS: f64 = 20.0;
pub const MACD_CROSS_POINTS: f64 = 25.0;
pub const MACD_BULLISH_POINTS: f64 = 10.0;
pub const VOLUME_SURGE_POINTS: f64 = 10.0;
pub const SQUEEZE_POINTS: f64 = 5.0;
pub const EXTENSION_PENALTY: f64 = 45.0;
pub const FALLING_KNIFE_PENALTY: f64 = 15.0;

pub const LONG_TERM_DOWNTREND_POINTS: f64 = 50.0;
pub const MEDIUM_TERM_DOWNTREND_POINTS: f64 = 15.0;
pub const OVERBOUGHT_SELL_POINTS: f64 = 40.0;
pub const RESISTANCE_POINTS: f64 = 25.0;
pub const MACD_BEARISH_POINTS: f64 = 15.0;
pub const DIP_SUPPORT_SELL_PENALTY: f64 = 25.0;

pub const MAX_CONFIDENCE: f64 = 100.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    pub long_term_uptrend: f64,
    pub medium_term_uptrend: f64,
    pub dip_support: f64,
    pub moving_average_support: f64,
    pub reversal: f64,
    pub macd_cross: f64,
    pub macd_bullish: f64,
    pub volume_surge: f64,
    pub squeeze: f64,
    pub extension_penalty: f64,
    pub falling_knife_penalty: f64,
    pub long_term_downtrend: f64,
    pub medium_term_downtrend: f64,
    pub overbought_sell: f64,
    pub resistance: f64,
    pub macd_bearish: f64,
    pub dip_support_sell_penalty: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            long_term_uptrend: LONG_TERM_UPTREND_POINTS,
            medium_term_uptrend: MEDIUM_TERM_UPTREND_POINTS,
            dip_support: DIP_SUPPORT_POINTS,
            moving_average_support: MOVING_AVERAGE_SUPPORT_POINTS,
            reversal: REVERSAL_POINTS,
            macd_cross: MACD_CROSS_POINTS,
            macd_bullish: MACD_BULLISH_POINTS,
            volume_surge: VOLUME_SURGE_POINTS,
            squeeze: SQUEEZE_POINTS,
            extension_penalty: EXTENSION_PENALTY,
            falling_knife_penalty: FALLING_KNIFE_PENALTY,
            long_term_downtrend: LONG_TERM_DOWNTREND_POINTS,
            medium_term_downtrend: MEDIUM_TERM_DOWNTREND_POINTS,
            overbought_sell: OVERBOUGHT_SELL_POINTS,
            resistance: RESISTANCE_POINTS,
            macd_bearish: MACD_BEARISH_POINTS,
            dip_support_sell_penalty: DIP_SUPPORT_SELL_PENALTY,
        }
    }
}

/// Boolean market conditions derived from one snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketContext {
    pub price: f64,
    pub rsi: f64,
    pub stochastic_k: f64,
    pub stochastic_d: f64,
    pub volume_ratio: f64,
    pub long_term_uptrend: bool,
    pub medium_term_uptrend: bool,
    pub long_term_downtrend: bool,
    pub medium_term_downtrend: bool,
    pub extended: bool,
    pub below_short_ma: bool,
    /// Labels of support levels within proximity of price.
    pub nearby_supports: Vec<String>,
    pub moving_average_support: bool,
    pub near_bollinger_support: bool,
    pub at_resistance: bool,
    pub overbought: bool,
    pub oversold: bool,
    pub reversal_confirmed: bool,
    pub macd_bullish: bool,
    pub macd_bullish_cross: bool,
    pub volume_surge: bool,
    pub bollinger_squeeze: bool,
}

fn within(price: f64, level: f64, proximity: f64) -> bool {
    level > 0.0 && ((price - level).abs() / level) <= proximity
}

impl MarketContext {
    pub fn classify(snapshot: &IndicatorSnapshot, config: &SignalConfig) -> Self {
        let price = snapshot.price;
        let rsi = snapshot.rsi;
        let stoch = snapshot.stochastic;

        let mut nearby_supports = Vec::new();
        let mut moving_average_support = false;
        for (label, level) in snapshot.support_moving_averages() {
            if within(price, level, config.support_proximity) {
                nearby_supports.push(label.to_string());
                moving_average_support = true;
            }
        }
        let near_bollinger_support = snapshot
            .bollinger
            .lower
            .map_or(false, |lower| lower > 0.0 && price <= lower * (1.0 + config.support_proximity));
        if near_bollinger_support {
            nearby_supports.push("Bollinger lower band".to_string());
        }
        if let Some(level) = snapshot.volume_profile.support {
            if within(price, level, config.support_proximity) {
                nearby_supports.push("Volume profile support".to_string());
            }
        }

        let resistance_floor = 1.0 - config.resistance_proximity;
        let at_resistance = [snapshot.bollinger.upper, snapshot.volume_profile.resistance]
            .iter()
            .flatten()
            .any(|&level| level > 0.0 && price >= level * resistance_floor);

        Self {
            price,
            rsi,
            stochastic_k: stoch.k,
            stochastic_d: stoch.d,
            volume_ratio: snapshot.volume_ratio,
            long_term_uptrend: price > snapshot.sma_50 && snapshot.sma_50 > snapshot.sma_100,
            medium_term_uptrend: price > snapshot.sma_20 && snapshot.sma_20 > snapshot.sma_50,
            long_term_downtrend: price < snapshot.sma_50 && snapshot.sma_50 < snapshot.sma_100,
            medium_term_downtrend: price < snapshot.sma_20 && snapshot.sma_20 < snapshot.sma_50,
            extended: price > snapshot.sma_5
                && snapshot.sma_5 > snapshot.sma_10
                && snapshot.sma_10 > snapshot.sma_20
                && snapshot.sma_20 > snapshot.sma_50,
            below_short_ma: price < snapshot.sma_10,
            nearby_supports,
            moving_average_support,
            near_bollinger_support,
            at_resistance,
            overbought: rsi > config.rsi_overbought || stoch.k > config.stochastic_overbought,
            oversold: rsi < config.rsi_oversold || stoch.k < config.stochastic_oversold,
            reversal_confirmed: rsi >= config.reversal_rsi_low
                && rsi <= config.reversal_rsi_high
                && stoch.k > stoch.d,
            macd_bullish: snapshot.macd.is_bullish(),
            macd_bullish_cross: snapshot.macd.is_bullish_cross(),
            volume_surge: snapshot.volume_ratio > config.volume_surge_ratio,
            bollinger_squeeze: snapshot.bollinger_squeeze,
        }
    }

    pub fn at_dip_support(&self) -> bool {
        !self.nearby_supports.is_empty() && self.below_short_ma
    }

    pub fn raging_bull(&self) -> bool {
        self.long_term_uptrend && self.medium_term_uptrend && self.macd_bullish
    }

    pub fn strong_bullish_extension(&self) -> bool {
        self.long_term_uptrend && self.extended
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleId {
    LongTermUptrend,
    MediumTermUptrend,
    DipSupport,
    MovingAverageSupport,
    ReversalConfirmed,
    MacdBullishCross,
    MacdBullish,
    VolumeSurge,
    BollingerSqueeze,
    OverboughtVeto,
    Extended,
    FallingKnife,
    LowConviction,
    RagingBull,
    LongTermDowntrend,
    MediumTermDowntrend,
    Overbought,
    AtResistance,
    MacdNotBullish,
    OversoldVeto,
    DipSupportSell,
    StrongExtensionCap,
}

impl RuleId {
    pub fn describe(self, ctx: &MarketContext) -> String {
        match self {
            RuleId::LongTermUptrend => "Long-term uptrend (price > SMA50 > SMA100)".to_string(),
            RuleId::MediumTermUptrend => "Medium-term uptrend (price > SMA20 > SMA50)".to_string(),
            RuleId::DipSupport => format!(
                "Pullback into support below SMA10 ({})",
                ctx.nearby_supports.join(", ")
            ),
            RuleId::MovingAverageSupport => "Support sits on a moving average".to_string(),
            RuleId::ReversalConfirmed => format!(
                "Reversal confirmed (RSI {:.1}, %K {:.1} > %D {:.1})",
                ctx.rsi, ctx.stochastic_k, ctx.stochastic_d
            ),
            RuleId::MacdBullishCross => "MACD bullish crossover".to_string(),
            RuleId::MacdBullish => "MACD above signal line".to_string(),
            RuleId::VolumeSurge => format!("Volume surge ({:.1}x average)", ctx.volume_ratio),
            RuleId::BollingerSqueeze => "Bollinger squeeze".to_string(),
            RuleId::OverboughtVeto | RuleId::Overbought => format!(
                "Overbought (RSI {:.1}, %K {:.1})",
                ctx.rsi, ctx.stochastic_k
            ),
            RuleId::Extended => "Over-extended above short moving averages".to_string(),
            RuleId::FallingKnife => "Falling knife at lower Bollinger band".to_string(),
            RuleId::LowConviction => "Low conviction without volume confirmation".to_string(),
            RuleId::RagingBull => "Raging bull (uptrends with bullish MACD)".to_string(),
            RuleId::LongTermDowntrend => {
                "Long-term downtrend (price < SMA50 < SMA100)".to_string()
            }
            RuleId::MediumTermDowntrend => {
                "Medium-term downtrend (price < SMA20 < SMA50)".to_string()
            }
            RuleId::AtResistance => "Price at resistance".to_string(),
            RuleId::MacdNotBullish => "MACD below signal line".to_string(),
            RuleId::OversoldVeto => format!(
                "Oversold (RSI {:.1}, %K {:.1})",
                ctx.rsi, ctx.stochastic_k
            ),
            RuleId::DipSupportSell => "Price sits on dip support".to_string(),
            RuleId::StrongExtensionCap => "Strong bullish extension".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RuleEffect {
    Add(f64),
    Subtract(f64),
    /// Forces the score to zero and stops evaluating the side.
    Veto,
    /// Limits the running score.
    Cap(f64),
}

/// Score state visible to rule predicates.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RuleState {
    pub score: f64,
    /// Score accumulated before the first non-additive rule ran.
    pub evidence: f64,
}

pub type RulePredicate = fn(&MarketContext, &RuleState, &SignalConfig) -> bool;

#[derive(Clone)]
pub struct ScoringRule {
    pub id: RuleId,
    pub effect: RuleEffect,
    pub applies: RulePredicate,
}

impl ScoringRule {
    fn new(id: RuleId, effect: RuleEffect, applies: RulePredicate) -> Self {
        Self {
            id,
            effect,
            applies,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScoreOutcome {
    pub score: f64,
    /// Positively weighted conditions, in evaluation order.
    pub supporting: Vec<String>,
    /// Every rule that fired, with its effect.
    pub fired: Vec<String>,
    pub veto: Option<String>,
}

fn low_conviction(ctx: &MarketContext, state: &RuleState, config: &SignalConfig) -> bool {
    let basis = match config.low_conviction_basis {
        LowConvictionBasis::PreVeto => state.evidence,
        LowConvictionBasis::PostPenalty => state.score,
    };
    basis > 0.0 && basis < config.low_conviction_ceiling && !ctx.volume_surge
}

pub fn buy_rules(config: &SignalConfig) -> Vec<ScoringRule> {
    use RuleEffect::*;
    let weights = &config.weights;
    vec![
        ScoringRule::new(RuleId::LongTermUptrend, Add(weights.long_term_uptrend), |c, _, _| {
            c.long_term_uptrend
        }),
        ScoringRule::new(
            RuleId::MediumTermUptrend,
            Add(weights.medium_term_uptrend),
            |c, _, _| c.medium_term_uptrend,
        ),
        ScoringRule::new(RuleId::DipSupport, Add(weights.dip_support), |c, _, _| {
            c.at_dip_support()
        }),
        ScoringRule::new(
            RuleId::MovingAverageSupport,
            Add(weights.moving_average_support),
            |c, _, _| c.at_dip_support() && c.moving_average_support,
        ),
        ScoringRule::new(RuleId::ReversalConfirmed, Add(weights.reversal), |c, _, _| {
            c.reversal_confirmed
        }),
        ScoringRule::new(RuleId::MacdBullishCross, Add(weights.macd_cross), |c, _, _| {
            c.macd_bullish_cross
        }),
        ScoringRule::new(RuleId::MacdBullish, Add(weights.macd_bullish), |c, _, _| {
            c.macd_bullish && !c.macd_bullish_cross
        }),
        ScoringRule::new(RuleId::VolumeSurge, Add(weights.volume_surge), |c, _, _| {
            c.volume_surge
        }),
        ScoringRule::new(RuleId::BollingerSqueeze, Add(weights.squeeze), |c, _, _| {
            c.bollinger_squeeze
        }),
        ScoringRule::new(RuleId::OverboughtVeto, Veto, |c, _, _| c.overbought),
        ScoringRule::new(
            RuleId::Extended,
            Subtract(weights.extension_penalty),
            |c, _, _| c.extended,
        ),
        ScoringRule::new(
            RuleId::FallingKnife,
            Subtract(weights.falling_knife_penalty),
            |c, _, _| c.near_bollinger_support && c.oversold,
        ),
        ScoringRule::new(RuleId::LowConviction, Veto, low_conviction),
    ]
}

pub fn sell_rules(config: &SignalConfig) -> Vec<ScoringRule> {
    use RuleEffect::*;
    let weights = &config.weights;
    vec![
        ScoringRule::new(RuleId::RagingBull, Veto, |c, _, _| c.raging_bull()),
        ScoringRule::new(
            RuleId::LongTermDowntrend,
            Add(weights.long_term_downtrend),
            |c, _, _| c.long_term_downtrend,
        ),
        ScoringRule::new(
            RuleId::MediumTermDowntrend,
            Add(weights.medium_term_downtrend),
            |c, _, _| c.medium_term_downtrend && !c.long_term_downtrend,
        ),
        ScoringRule::new(RuleId::Overbought, Add(weights.overbought_sell), |c, _, _| {
            c.overbought
        }),
        ScoringRule::new(RuleId::AtResistance, Add(weights.resistance), |c, _, _| {
            c.at_resistance
        }),
        ScoringRule::new(RuleId::MacdNotBullish, Add(weights.macd_bearish), |c, _, _| {
            !c.macd_bullish
        }),
        ScoringRule::new(RuleId::OversoldVeto, Veto, |c, _, _| c.oversold),
        ScoringRule::new(
            RuleId::DipSupportSell,
            Subtract(weights.dip_support_sell_penalty),
            |c, _, _| c.at_dip_support(),
        ),
        ScoringRule::new(
            RuleId::StrongExtensionCap,
            Cap(config.sell_extension_cap),
            |c, s, cfg| c.strong_bullish_extension() && s.score > cfg.sell_extension_cap,
        ),
    ]
}

/// Runs the rules in order and clamps the result to [0, 100].
pub fn evaluate_rules(
    rules: &[ScoringRule],
    ctx: &MarketContext,
    config: &SignalConfig,
) -> ScoreOutcome {
    let mut state = RuleState::default();
    let mut outcome = ScoreOutcome::default();
    let mut evidence_closed = false;

    for rule in rules {
        if !evidence_closed && !matches!(rule.effect, RuleEffect::Add(_)) {
            state.evidence = state.score;
            evidence_closed = true;
        }
        if !(rule.applies)(ctx, &state, config) {
            continue;
        }
        let description = rule.id.describe(ctx);
        match rule.effect {
            RuleEffect::Add(points) => {
                state.score += points;
                if points > 0.0 {
                    outcome.supporting.push(description.clone());
                }
                outcome.fired.push(format!("+{:.0} {}", points, description));
            }
            RuleEffect::Subtract(points) => {
                state.score -= points;
                outcome.fired.push(format!("-{:.0} {}", points, description));
            }
            RuleEffect::Veto => {
                state.score = 0.0;
                outcome.fired.push(format!("VETO {}", description));
                outcome.veto = Some(format!("VETO: {}", description));
                break;
            }
            RuleEffect::Cap(cap) => {
                state.score = state.score.min(cap);
                outcome.fired.push(format!("CAP {:.0} {}", cap, description));
                outcome.veto = Some(format!("VETO: {} (capped at {:.0})", description, cap));
            }
        }
    }

    outcome.score = state.score.clamp(0.0, MAX_CONFIDENCE);
    outcome
}
