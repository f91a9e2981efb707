use crate::config::SignalConfig;
use crate::indicators::compute_snapshot;
use crate::models::{IndicatorSnapshot, PriceBar, PriceHistory, SignalAction, SignalDecision, TradingPlan};
use crate::scoring::{buy_rules, evaluate_rules, sell_rules, MarketContext, ScoreOutcome, ScoringRule};
use crate::trading_rules::build_trading_plan;
use log::debug;
use rayon::prelude::*;

pub const INSUFFICIENT_DATA_REASON: &str = "Insufficient data";

/// Anything that can turn a history prefix into a decision. The backtest
/// engine only sees this seam, so tests can drive it with scripted signals.
pub trait SignalSource: Send + Sync {
    fn id(&self) -> &str;
    fn min_data_points(&self) -> usize;
    /// `bars` ends at the evaluation bar; implementations must not look past it.
    fn generate_signal(&self, bars: &[PriceBar]) -> SignalDecision;
}

pub struct SignalEngine {
    config: SignalConfig,
    buy_rules: Vec<ScoringRule>,
    sell_rules: Vec<ScoringRule>,
}

impl Default for SignalEngine {
    fn default() -> Self {
        Self::new(SignalConfig::default())
    }
}

impl SignalEngine {
    pub fn new(config: SignalConfig) -> Self {
        let buy_rules = buy_rules(&config);
        let sell_rules = sell_rules(&config);
        Self {
            config,
            buy_rules,
            sell_rules,
        }
    }

    pub fn config(&self) -> &SignalConfig {
        &self.config
    }

    pub fn evaluate(&self, bars: &[PriceBar]) -> SignalDecision {
        if bars.len() < self.config.min_history {
            return SignalDecision::hold(INSUFFICIENT_DATA_REASON);
        }
        match compute_snapshot(bars) {
            Some(snapshot) => self.score_snapshot(snapshot),
            None => SignalDecision::hold(INSUFFICIENT_DATA_REASON),
        }
    }

    /// Scores an already computed snapshot.
    pub fn score_snapshot(&self, snapshot: IndicatorSnapshot) -> SignalDecision {
        let ctx = MarketContext::classify(&snapshot, &self.config);
        let buy = evaluate_rules(&self.buy_rules, &ctx, &self.config);
        let sell = evaluate_rules(&self.sell_rules, &ctx, &self.config);
        let (action, confidence) = decide(buy.score, sell.score, self.config.decision_threshold);

        debug!(
            "{}: buy {:.0} sell {:.0} -> {} ({:.0})",
            snapshot.date.format("%Y-%m-%d"),
            buy.score,
            sell.score,
            action,
            confidence
        );

        SignalDecision {
            action,
            confidence,
            buy_confidence: buy.score,
            sell_confidence: sell.score,
            reasons: surfaced_reasons(action, &buy, &sell),
            conditions: buy
                .fired
                .iter()
                .map(|condition| format!("BUY {}", condition))
                .chain(sell.fired.iter().map(|condition| format!("SELL {}", condition)))
                .collect(),
            snapshot: Some(snapshot),
        }
    }

    /// Entry plan for a BUY decision; other actions have none.
    pub fn trading_plan(&self, decision: &SignalDecision) -> Option<TradingPlan> {
        if decision.action != SignalAction::Buy {
            return None;
        }
        decision
            .snapshot
            .as_ref()
            .map(|snapshot| build_trading_plan(snapshot, decision.confidence))
    }

    /// Latest decision for every history, evaluated in parallel and returned
    /// in input order.
    pub fn scan<'a, I>(&self, histories: I) -> Vec<(String, SignalDecision)>
    where
        I: IntoIterator<Item = &'a PriceHistory>,
    {
        let histories: Vec<&PriceHistory> = histories.into_iter().collect();
        histories
            .par_iter()
            .map(|history| (history.ticker().to_string(), self.evaluate(history.bars())))
            .collect()
    }
}

impl SignalSource for SignalEngine {
    fn id(&self) -> &str {
        "swing_score"
    }

    fn min_data_points(&self) -> usize {
        self.config.min_history
    }

    fn generate_signal(&self, bars: &[PriceBar]) -> SignalDecision {
        self.evaluate(bars)
    }
}

/// A side wins only with a strictly higher score that also reaches the
/// threshold. HOLD reports the stronger of the two scores.
pub fn decide(buy: f64, sell: f64, threshold: f64) -> (SignalAction, f64) {
    if buy > sell && buy >= threshold {
        (SignalAction::Buy, buy)
    } else if sell > buy && sell >= threshold {
        (SignalAction::Sell, sell)
    } else {
        (SignalAction::Hold, buy.max(sell))
    }
}

fn surfaced_reasons(action: SignalAction, buy: &ScoreOutcome, sell: &ScoreOutcome) -> Vec<String> {
    let mut reasons = match action {
        SignalAction::Buy => buy.supporting.clone(),
        SignalAction::Sell => sell.supporting.clone(),
        SignalAction::Hold => vec![format!(
            "No clear setup (buy {:.0}, sell {:.0})",
            buy.score, sell.score
        )],
    };
    reasons.extend(buy.veto.iter().cloned());
    reasons.extend(sell.veto.iter().cloned());
    reasons
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BollingerBands, FibonacciLevels, MacdOutput, StochasticOutput, VolumeProfile};
    use chrono::{Duration, TimeZone, Utc};

    fn snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            date: Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap(),
            price: 100.0,
            rsi: 55.0,
            sma_5: 101.0,
            sma_10: 99.0,
            sma_20: 105.0,
            sma_50: 95.0,
            sma_100: 90.0,
            ema_20: 80.0,
            ema_50: 80.0,
            macd: MacdOutput {
                macd: 0.0,
                signal: 0.0,
                histogram: 0.0,
                previous_histogram: Some(0.0),
            },
            stochastic: StochasticOutput { k: 60.0, d: 50.0 },
            atr: 2.0,
            volume: 1_000.0,
            avg_volume_20: 1_000.0,
            volume_ratio: 1.0,
            bollinger: BollingerBands::default(),
            bollinger_squeeze: false,
            volume_profile: VolumeProfile::default(),
            fibonacci: FibonacciLevels {
                swing_high: 110.0,
                swing_low: 90.0,
                range: 20.0,
                levels: Vec::new(),
            },
            ichimoku: None,
            swing_support: 92.0,
            swing_resistance: 108.0,
        }
    }

    fn dip_snapshot() -> IndicatorSnapshot {
        IndicatorSnapshot {
            rsi: 45.0,
            sma_10: 102.0,
            sma_20: 99.0,
            stochastic: StochasticOutput { k: 40.0, d: 35.0 },
            macd: MacdOutput {
                macd: 1.0,
                signal: 0.5,
                histogram: 0.5,
                previous_histogram: Some(0.3),
            },
            volume: 2_000.0,
            volume_ratio: 2.0,
            ..snapshot()
        }
    }

    fn wave_bars(count: usize) -> Vec<PriceBar> {
        let start = Utc.with_ymd_and_hms(2023, 1, 2, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| {
                let close = 100.0 + (i as f64 * 0.3).sin() * 5.0 + i as f64 * 0.05;
                PriceBar {
                    date: start + Duration::days(i as i64),
                    open: close - 0.5,
                    high: close + 1.0,
                    low: close - 1.0,
                    close,
                    volume: 1_000.0 + (i % 7) as f64 * 100.0,
                }
            })
            .collect()
    }

    #[test]
    fn short_history_returns_neutral_hold() {
        let engine = SignalEngine::default();
        let decision = engine.evaluate(&wave_bars(99));
        assert_eq!(decision.action, SignalAction::Hold);
        assert_eq!(decision.confidence, 0.0);
        assert_eq!(decision.reason(), INSUFFICIENT_DATA_REASON);
        assert!(decision.snapshot.is_none());
        assert!(engine.trading_plan(&decision).is_none());
    }

    #[test]
    fn evaluation_is_deterministic() {
        let engine = SignalEngine::default();
        let bars = wave_bars(160);
        let first = engine.evaluate(&bars);
        let second = engine.evaluate(&bars);
        assert_eq!(first.action, second.action);
        assert_eq!(first.confidence, second.confidence);
        assert_eq!(first.reasons, second.reasons);
        assert!(first.snapshot.is_some());
        assert!((0.0..=100.0).contains(&first.confidence));
    }

    #[test]
    fn dip_into_support_produces_buy_with_ordered_reasons() {
        let engine = SignalEngine::default();
        let decision = engine.score_snapshot(dip_snapshot());
        assert_eq!(decision.action, SignalAction::Buy);
        assert_eq!(decision.confidence, 100.0);
        assert_eq!(decision.sell_confidence, 0.0);
        assert!(decision.reasons[0].starts_with("Long-term uptrend"));
        assert!(decision.reasons[2].contains("SMA20"));
        let last = decision.reasons.last().unwrap();
        assert!(last.starts_with("VETO: Raging bull"), "{}", last);
        assert!(decision.conditions.iter().any(|c| c.starts_with("SELL VETO")));
        assert!(engine.trading_plan(&decision).is_some());
    }

    #[test]
    fn unconfirmed_79_point_buy_collapses_to_hold() {
        let mut config = SignalConfig::default();
        config.weights.long_term_uptrend = 79.0;
        let engine = SignalEngine::new(config.clone());

        let decision = engine.score_snapshot(snapshot());
        assert_eq!(decision.action, SignalAction::Hold);
        assert_eq!(decision.buy_confidence, 0.0);
        // MACD not bullish is the only sell evidence
        assert!((decision.sell_confidence - 15.0).abs() < 1e-9);
        assert!((decision.confidence - 15.0).abs() < 1e-9);
        assert!(decision.reasons.iter().any(|r| r.starts_with("VETO: Low conviction")));

        let confirmed = IndicatorSnapshot {
            volume_ratio: 2.0,
            ..snapshot()
        };
        let decision = SignalEngine::new(config).score_snapshot(confirmed);
        assert_eq!(decision.action, SignalAction::Buy);
        assert!((decision.confidence - 89.0).abs() < 1e-9);
    }

    #[test]
    fn decision_requires_strict_lead_and_threshold() {
        assert_eq!(decide(60.0, 60.0, 50.0), (SignalAction::Hold, 60.0));
        assert_eq!(decide(49.0, 10.0, 50.0), (SignalAction::Hold, 49.0));
        assert_eq!(decide(20.0, 70.0, 50.0), (SignalAction::Sell, 70.0));
        assert_eq!(decide(50.0, 0.0, 50.0), (SignalAction::Buy, 50.0));
    }

    #[test]
    fn scan_keeps_input_order() {
        let engine = SignalEngine::default();
        let histories = vec![
            PriceHistory::new("BBCA", wave_bars(120)).unwrap(),
            PriceHistory::new("ASII", wave_bars(80)).unwrap(),
        ];
        let results = engine.scan(&histories);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "BBCA");
        assert!(results[0].1.snapshot.is_some());
        assert_eq!(results[1].0, "ASII");
        assert_eq!(results[1].1.reason(), INSUFFICIENT_DATA_REASON);
    }
}
