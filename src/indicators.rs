use crate::models::{
    BollingerBands, FibonacciLevel, FibonacciLevels, IchimokuCloud, IndicatorSnapshot, MacdOutput,
    PriceBar, StochasticOutput, VolumeProfile,
};

pub const RSI_PERIOD: usize = 14;
pub const MACD_FAST: usize = 12;
pub const MACD_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const STOCHASTIC_K: usize = 14;
pub const STOCHASTIC_D: usize = 3;
pub const ATR_PERIOD: usize = 14;
pub const FIBONACCI_PERIOD: usize = 60;
pub const FIBONACCI_RATIOS: [f64; 5] = [0.236, 0.382, 0.5, 0.618, 0.786];
pub const ICHIMOKU_TENKAN: usize = 9;
pub const ICHIMOKU_KIJUN: usize = 26;
pub const ICHIMOKU_SENKOU_B: usize = 52;
pub const ICHIMOKU_DISPLACEMENT: usize = 26;
pub const ICHIMOKU_MIN_BARS: usize = 52;
pub const BOLLINGER_PERIOD: usize = 20;
pub const BOLLINGER_STD_DEV: f64 = 2.0;
pub const BOLLINGER_SQUEEZE_WIDTH: f64 = 0.04;
pub const VOLUME_PROFILE_PERIOD: usize = 20;
pub const VOLUME_PROFILE_BINS: usize = 10;
pub const VOLUME_AVERAGE_PERIOD: usize = 20;
pub const SWING_LOOKBACK: usize = 20;
/// Longest window in the snapshot (SMA100).
pub const SNAPSHOT_MIN_BARS: usize = 100;

pub fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// SMA of the trailing window only, summed directly.
pub fn latest_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }
    let window = &prices[prices.len() - period..];
    Some(window.iter().sum::<f64>() / period as f64)
}

/// Recursive EMA seeded with the first price (no bias adjustment).
pub fn calculate_ema(prices: &[f64], period: usize) -> Vec<f64> {
    if prices.is_empty() {
        return Vec::new();
    }

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut ema_values = Vec::with_capacity(prices.len());
    ema_values.push(prices[0]);

    for i in 1..prices.len() {
        let ema = (prices[i] * alpha) + (ema_values[i - 1] * (1.0 - alpha));
        ema_values.push(ema);
    }

    ema_values
}

pub fn calculate_macd(
    prices: &[f64],
    fast_period: usize,
    slow_period: usize,
    signal_period: usize,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let fast_ema = calculate_ema(prices, fast_period);
    let slow_ema = calculate_ema(prices, slow_period);

    let macd_line: Vec<f64> = fast_ema
        .iter()
        .zip(slow_ema.iter())
        .map(|(fast, slow)| fast - slow)
        .collect();
    let signal_line = calculate_ema(&macd_line, signal_period);
    let histogram = macd_line
        .iter()
        .zip(signal_line.iter())
        .map(|(macd, signal)| macd - signal)
        .collect();

    (macd_line, signal_line, histogram)
}

pub fn latest_macd(prices: &[f64]) -> Option<MacdOutput> {
    let (macd_line, signal_line, histogram) =
        calculate_macd(prices, MACD_FAST, MACD_SLOW, MACD_SIGNAL);
    let last = prices.len().checked_sub(1)?;
    Some(MacdOutput {
        macd: macd_line[last],
        signal: signal_line[last],
        histogram: histogram[last],
        previous_histogram: last.checked_sub(1).map(|prev| histogram[prev]),
    })
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// RSI over rolling-mean gains and losses. Bars without a full window read 50.
pub fn calculate_rsi(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return vec![50.0; prices.len()];
    }

    // The first bar has no prior close and contributes a flat move.
    let mut gains = Vec::with_capacity(prices.len());
    let mut losses = Vec::with_capacity(prices.len());
    gains.push(0.0);
    losses.push(0.0);
    for i in 1..prices.len() {
        let delta = prices[i] - prices[i - 1];
        gains.push(if delta > 0.0 { delta } else { 0.0 });
        losses.push(if delta < 0.0 { -delta } else { 0.0 });
    }

    let mut rsi_values = vec![50.0; prices.len()];
    for i in (period - 1)..prices.len() {
        let window_start = i + 1 - period;
        let avg_gain = gains[window_start..=i].iter().sum::<f64>() / period as f64;
        let avg_loss = losses[window_start..=i].iter().sum::<f64>() / period as f64;
        let rsi = rsi_from_avgs(avg_gain, avg_loss);
        rsi_values[i] = if rsi.is_finite() { rsi } else { 50.0 };
    }

    rsi_values
}

fn window_extremes(highs: &[f64], lows: &[f64], end: usize, period: usize) -> Option<(f64, f64)> {
    if period == 0 || end + 1 < period || end >= highs.len() || end >= lows.len() {
        return None;
    }
    let start = end + 1 - period;
    let highest = highs[start..=end]
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let lowest = lows[start..=end].iter().copied().fold(f64::INFINITY, f64::min);
    Some((highest, lowest))
}

/// Latest %K/%D. Undefined values (short history or a flat window) read 50.
pub fn calculate_stochastic(
    highs: &[f64],
    lows: &[f64],
    closes: &[f64],
    k_period: usize,
    d_period: usize,
) -> StochasticOutput {
    let neutral = StochasticOutput { k: 50.0, d: 50.0 };
    let n = closes.len();
    if k_period == 0 || n < k_period {
        return neutral;
    }

    let percent_k_at = |end: usize| -> Option<f64> {
        let (highest, lowest) = window_extremes(highs, lows, end, k_period)?;
        let range = highest - lowest;
        if range > 0.0 {
            Some(100.0 * (closes[end] - lowest) / range)
        } else {
            None
        }
    };

    let k = percent_k_at(n - 1);
    let d = if d_period > 0 && n + 1 >= k_period + d_period {
        (0..d_period)
            .map(|offset| percent_k_at(n - 1 - offset))
            .collect::<Option<Vec<f64>>>()
            .map(|values| values.iter().sum::<f64>() / d_period as f64)
    } else {
        None
    };

    StochasticOutput {
        k: k.unwrap_or(neutral.k),
        d: d.unwrap_or(neutral.d),
    }
}

/// Rolling mean of true range at the last bar; 0 when undefined.
pub fn calculate_atr(highs: &[f64], lows: &[f64], closes: &[f64], period: usize) -> f64 {
    let n = closes.len();
    if period == 0 || n < period || highs.len() != n || lows.len() != n {
        return 0.0;
    }

    let true_range = |i: usize| -> f64 {
        let range = highs[i] - lows[i];
        if i == 0 {
            return range;
        }
        range
            .max((highs[i] - closes[i - 1]).abs())
            .max((lows[i] - closes[i - 1]).abs())
    };

    let atr = (n - period..n).map(true_range).sum::<f64>() / period as f64;
    if atr.is_finite() {
        atr
    } else {
        0.0
    }
}

pub fn calculate_fibonacci_levels(
    highs: &[f64],
    lows: &[f64],
    period: usize,
) -> Option<FibonacciLevels> {
    let n = highs.len().min(lows.len());
    if n == 0 {
        return None;
    }
    let period = period.clamp(1, n);
    let (swing_high, swing_low) = window_extremes(highs, lows, n - 1, period)?;
    let range = swing_high - swing_low;

    let levels = FIBONACCI_RATIOS
        .iter()
        .map(|&ratio| FibonacciLevel {
            ratio,
            price: round_to_cents(swing_high - range * ratio),
        })
        .collect();

    Some(FibonacciLevels {
        swing_high,
        swing_low,
        range,
        levels,
    })
}

fn midpoint(highs: &[f64], lows: &[f64], end: usize, period: usize) -> Option<f64> {
    window_extremes(highs, lows, end, period).map(|(highest, lowest)| (highest + lowest) / 2.0)
}

/// Ichimoku lines at the last bar. The spans in force today were projected
/// from the bar `ICHIMOKU_DISPLACEMENT` sessions earlier.
pub fn calculate_ichimoku(highs: &[f64], lows: &[f64], closes: &[f64]) -> Option<IchimokuCloud> {
    let n = closes.len();
    if n < ICHIMOKU_MIN_BARS || highs.len() != n || lows.len() != n {
        return None;
    }
    let last = n - 1;

    let tenkan_sen = midpoint(highs, lows, last, ICHIMOKU_TENKAN)?;
    let kijun_sen = midpoint(highs, lows, last, ICHIMOKU_KIJUN)?;
    let prev_tenkan = midpoint(highs, lows, last - 1, ICHIMOKU_TENKAN)?;
    let prev_kijun = midpoint(highs, lows, last - 1, ICHIMOKU_KIJUN)?;

    let projected = last - ICHIMOKU_DISPLACEMENT;
    let senkou_span_a = match (
        midpoint(highs, lows, projected, ICHIMOKU_TENKAN),
        midpoint(highs, lows, projected, ICHIMOKU_KIJUN),
    ) {
        (Some(tenkan), Some(kijun)) => Some((tenkan + kijun) / 2.0),
        _ => None,
    };
    let senkou_span_b = midpoint(highs, lows, projected, ICHIMOKU_SENKOU_B);

    let (cloud_top, cloud_bottom) = match (senkou_span_a, senkou_span_b) {
        (Some(a), Some(b)) => (Some(a.max(b)), Some(a.min(b))),
        (Some(span), None) | (None, Some(span)) => (Some(span), Some(span)),
        (None, None) => (None, None),
    };

    let price = closes[last];
    let price_above_cloud = cloud_top.map_or(false, |top| price > top);
    let price_below_cloud = cloud_bottom.map_or(false, |bottom| price < bottom);
    let price_in_cloud = matches!(
        (cloud_bottom, cloud_top),
        (Some(bottom), Some(top)) if bottom <= price && price <= top
    );

    Some(IchimokuCloud {
        tenkan_sen,
        kijun_sen,
        senkou_span_a,
        senkou_span_b,
        chikou_span: price,
        cloud_top,
        cloud_bottom,
        cloud_bullish: matches!((senkou_span_a, senkou_span_b), (Some(a), Some(b)) if a > b),
        price_above_cloud,
        price_below_cloud,
        price_in_cloud,
        tk_cross_bullish: tenkan_sen > kijun_sen && prev_tenkan <= prev_kijun,
        tk_cross_bearish: tenkan_sen < kijun_sen && prev_tenkan >= prev_kijun,
    })
}

/// Bands at the last bar using the sample standard deviation. A lower band
/// above price (or upper below it) is pulled to 2% under (over) price.
pub fn calculate_bollinger_bands(prices: &[f64], period: usize, std_dev: f64) -> BollingerBands {
    if period < 2 || prices.len() < period {
        return BollingerBands::default();
    }

    let window = &prices[prices.len() - period..];
    let mean = window.iter().sum::<f64>() / period as f64;
    let variance =
        window.iter().map(|&val| (val - mean).powi(2)).sum::<f64>() / (period as f64 - 1.0);
    let standard_deviation = variance.sqrt();
    if !mean.is_finite() || !standard_deviation.is_finite() {
        return BollingerBands::default();
    }

    let price = prices[prices.len() - 1];
    let mut lower = mean - std_dev * standard_deviation;
    let mut upper = mean + std_dev * standard_deviation;
    if lower > price {
        lower = price * 0.98;
    }
    if upper < price {
        upper = price * 1.02;
    }

    BollingerBands {
        lower: Some(lower),
        middle: Some(mean),
        upper: Some(upper),
    }
}

pub fn is_bollinger_squeeze(bands: &BollingerBands, max_width: f64) -> bool {
    match (bands.lower, bands.middle, bands.upper) {
        (Some(lower), Some(middle), Some(upper))
            if lower != 0.0 && middle != 0.0 && upper != 0.0 =>
        {
            (upper - lower) / middle < max_width
        }
        _ => false,
    }
}

/// Volume-by-price over the trailing window. Each bar's volume is spread
/// evenly over the bins its high-low range touches.
pub fn calculate_volume_profile(bars: &[PriceBar], period: usize, bins: usize) -> VolumeProfile {
    if bars.is_empty() || bins == 0 {
        return VolumeProfile::default();
    }
    let period = period.clamp(1, bars.len());
    let recent = &bars[bars.len() - period..];
    let current_price = recent[recent.len() - 1].close;

    let range_high = recent
        .iter()
        .map(|bar| bar.high)
        .fold(f64::NEG_INFINITY, f64::max);
    let range_low = recent.iter().map(|bar| bar.low).fold(f64::INFINITY, f64::min);
    let price_range = range_high - range_low;
    if !(price_range > 0.0) || !price_range.is_finite() {
        return VolumeProfile::default();
    }

    let bin_size = price_range / bins as f64;
    let mut volume_by_bin = vec![0.0f64; bins];
    // Bins in the order they were first touched; ties resolve to the earliest.
    let mut touch_order: Vec<usize> = Vec::with_capacity(bins);

    for bar in recent {
        if !bar.high.is_finite() || !bar.low.is_finite() || !bar.volume.is_finite() {
            continue;
        }
        let low_bin = (((bar.low - range_low) / bin_size) as i64).max(0) as usize;
        let high_bin = (((bar.high - range_low) / bin_size) as i64).max(0) as usize;
        // A low at the window high lands past the last bin and adds nothing.
        let high_bin = high_bin.min(bins - 1);
        let touched = (high_bin as i64 - low_bin as i64 + 1).max(1) as f64;
        let volume_per_bin = bar.volume / touched;

        for bin in low_bin..=high_bin {
            if !touch_order.contains(&bin) {
                touch_order.push(bin);
            }
            volume_by_bin[bin] += volume_per_bin;
        }
    }

    if touch_order.is_empty() {
        return VolumeProfile::default();
    }

    let level_of =
        |bin: usize| round_to_cents(range_low + bin as f64 * bin_size + bin_size / 2.0);
    let heaviest = |filter: &dyn Fn(f64) -> bool| -> Option<f64> {
        let mut best: Option<(f64, f64)> = None;
        for &bin in &touch_order {
            let level = level_of(bin);
            if !filter(level) {
                continue;
            }
            let volume = volume_by_bin[bin];
            if best.map_or(true, |(_, best_volume)| volume > best_volume) {
                best = Some((level, volume));
            }
        }
        best.map(|(level, _)| level)
    };

    VolumeProfile {
        support: heaviest(&|level| level < current_price),
        resistance: heaviest(&|level| level > current_price),
        point_of_control: heaviest(&|_| true),
    }
}

/// Lowest low of the trailing window.
pub fn find_support_level(lows: &[f64], lookback: usize) -> Option<f64> {
    if lows.is_empty() {
        return None;
    }
    let start = lows.len().saturating_sub(lookback.max(1));
    lows[start..]
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .reduce(f64::min)
}

/// Highest high of the trailing window.
pub fn find_resistance_level(highs: &[f64], lookback: usize) -> Option<f64> {
    if highs.is_empty() {
        return None;
    }
    let start = highs.len().saturating_sub(lookback.max(1));
    highs[start..]
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .reduce(f64::max)
}

fn trailing_average_volume(volumes: &[f64], period: usize) -> f64 {
    let start = volumes.len().saturating_sub(period);
    let finite: Vec<f64> = volumes[start..]
        .iter()
        .copied()
        .filter(|value| value.is_finite())
        .collect();
    if finite.is_empty() {
        0.0
    } else {
        finite.iter().sum::<f64>() / finite.len() as f64
    }
}

/// Computes every indicator for the last bar of `bars`. Returns `None` when
/// the history is shorter than the longest moving-average window.
pub fn compute_snapshot(bars: &[PriceBar]) -> Option<IndicatorSnapshot> {
    if bars.len() < SNAPSHOT_MIN_BARS {
        return None;
    }

    let closes: Vec<f64> = bars.iter().map(|bar| bar.close).collect();
    let highs: Vec<f64> = bars.iter().map(|bar| bar.high).collect();
    let lows: Vec<f64> = bars.iter().map(|bar| bar.low).collect();
    let volumes: Vec<f64> = bars.iter().map(|bar| bar.volume).collect();
    let last_bar = bars.last()?;
    let price = last_bar.close;

    let ema_20 = *calculate_ema(&closes, 20).last()?;
    let ema_50 = *calculate_ema(&closes, 50).last()?;
    let rsi = *calculate_rsi(&closes, RSI_PERIOD).last()?;
    let bollinger = calculate_bollinger_bands(&closes, BOLLINGER_PERIOD, BOLLINGER_STD_DEV);

    let volume = if last_bar.volume.is_finite() {
        last_bar.volume
    } else {
        0.0
    };
    let avg_volume_20 = trailing_average_volume(&volumes, VOLUME_AVERAGE_PERIOD);
    let volume_ratio = if avg_volume_20 > 0.0 {
        volume / avg_volume_20
    } else {
        0.0
    };

    Some(IndicatorSnapshot {
        date: last_bar.date,
        price,
        rsi,
        sma_5: latest_sma(&closes, 5)?,
        sma_10: latest_sma(&closes, 10)?,
        sma_20: latest_sma(&closes, 20)?,
        sma_50: latest_sma(&closes, 50)?,
        sma_100: latest_sma(&closes, 100)?,
        ema_20,
        ema_50,
        macd: latest_macd(&closes)?,
        stochastic: calculate_stochastic(&highs, &lows, &closes, STOCHASTIC_K, STOCHASTIC_D),
        atr: calculate_atr(&highs, &lows, &closes, ATR_PERIOD),
        volume,
        avg_volume_20,
        volume_ratio,
        bollinger_squeeze: is_bollinger_squeeze(&bollinger, BOLLINGER_SQUEEZE_WIDTH),
        bollinger,
        volume_profile: calculate_volume_profile(bars, VOLUME_PROFILE_PERIOD, VOLUME_PROFILE_BINS),
        fibonacci: calculate_fibonacci_levels(&highs, &lows, FIBONACCI_PERIOD)?,
        ichimoku: calculate_ichimoku(&highs, &lows, &closes),
        swing_support: find_support_level(&lows, SWING_LOOKBACK)?,
        swing_resistance: find_resistance_level(&highs, SWING_LOOKBACK)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};

    fn make_bar(day: i64, low: f64, high: f64, close: f64, volume: f64) -> PriceBar {
        PriceBar {
            date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(day),
            open: close,
            high,
            low,
            close,
            volume,
        }
    }

    fn flat_bars(count: usize, price: f64) -> Vec<PriceBar> {
        (0..count)
            .map(|i| make_bar(i as i64, price, price, price, 1_000.0))
            .collect()
    }

    #[test]
    fn sma_is_undefined_until_window_fills() {
        assert_eq!(latest_sma(&[1.0, 2.0], 3), None);
        assert_eq!(latest_sma(&[1.0, 2.0, 3.0], 0), None);
        assert!((latest_sma(&[1.0, 2.0, 3.0], 3).unwrap() - 2.0).abs() < 1e-9);
        assert!((latest_sma(&[1.0, 2.0, 3.0, 4.0], 3).unwrap() - 3.0).abs() < 1e-9);
    }

    #[test]
    fn ema_uses_recursive_form_seeded_with_first_price() {
        let ema = calculate_ema(&[10.0, 20.0, 30.0], 3);
        assert!((ema[0] - 10.0).abs() < 1e-9);
        assert!((ema[1] - 15.0).abs() < 1e-9);
        assert!((ema[2] - 22.5).abs() < 1e-9);
    }

    #[test]
    fn rsi_is_neutral_for_short_history() {
        let rsi = calculate_rsi(&[1.0, 2.0, 3.0], RSI_PERIOD);
        assert_eq!(rsi, vec![50.0; 3]);
    }

    #[test]
    fn rsi_saturates_on_monotonic_moves() {
        let rising: Vec<f64> = (0..30).map(|i| 100.0 + i as f64).collect();
        assert!((calculate_rsi(&rising, RSI_PERIOD)[29] - 100.0).abs() < 1e-9);

        let falling: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        assert!(calculate_rsi(&falling, RSI_PERIOD)[29].abs() < 1e-9);

        let flat = vec![100.0; 30];
        assert!((calculate_rsi(&flat, RSI_PERIOD)[29] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_balances_equal_gains_and_losses() {
        let prices: Vec<f64> = (0..30)
            .map(|i| if i % 2 == 0 { 100.0 } else { 101.0 })
            .collect();
        let rsi = calculate_rsi(&prices, RSI_PERIOD);
        assert!((rsi[29] - 50.0).abs() < 1e-9);
    }

    #[test]
    fn macd_is_flat_for_constant_prices() {
        let macd = latest_macd(&vec![50.0; 60]).unwrap();
        assert!(macd.macd.abs() < 1e-12);
        assert!(macd.histogram.abs() < 1e-12);
        assert!(!macd.is_bullish());
        assert!(latest_macd(&[]).is_none());
    }

    #[test]
    fn stochastic_reads_position_in_range() {
        let highs = vec![110.0; 20];
        let lows = vec![100.0; 20];
        let mut closes = vec![105.0; 20];
        closes[19] = 107.5;
        let stoch = calculate_stochastic(&highs, &lows, &closes, STOCHASTIC_K, STOCHASTIC_D);
        assert!((stoch.k - 75.0).abs() < 1e-9);
        assert!((stoch.d - (75.0 + 50.0 + 50.0) / 3.0).abs() < 1e-9);
    }

    #[test]
    fn stochastic_is_neutral_when_undefined() {
        let short = calculate_stochastic(&[1.0; 5], &[1.0; 5], &[1.0; 5], 14, 3);
        assert_eq!(short, StochasticOutput { k: 50.0, d: 50.0 });

        let flat = calculate_stochastic(&[1.0; 20], &[1.0; 20], &[1.0; 20], 14, 3);
        assert_eq!(flat, StochasticOutput { k: 50.0, d: 50.0 });
    }

    #[test]
    fn atr_averages_true_range_including_gaps() {
        let highs = vec![11.0, 12.0, 15.0];
        let lows = vec![9.0, 10.0, 13.0];
        let closes = vec![10.0, 11.0, 14.0];
        // TR: 2, max(2, 1, 0) = 2, max(2, 4, 2) = 4
        assert!((calculate_atr(&highs, &lows, &closes, 3) - 8.0 / 3.0).abs() < 1e-9);
        assert_eq!(calculate_atr(&highs, &lows, &closes, 14), 0.0);
    }

    #[test]
    fn fibonacci_levels_are_rounded_retracements() {
        let highs = vec![105.0, 110.0, 108.0];
        let lows = vec![100.0, 104.0, 102.0];
        let fib = calculate_fibonacci_levels(&highs, &lows, FIBONACCI_PERIOD).unwrap();
        assert!((fib.swing_high - 110.0).abs() < 1e-9);
        assert!((fib.swing_low - 100.0).abs() < 1e-9);
        let prices: Vec<f64> = fib.levels.iter().map(|level| level.price).collect();
        let expected = [107.64, 106.18, 105.0, 103.82, 102.14];
        for (actual, wanted) in prices.iter().zip(expected.iter()) {
            assert!((actual - wanted).abs() < 1e-9, "{} vs {}", actual, wanted);
        }
    }

    #[test]
    fn ichimoku_requires_52_bars() {
        let closes = vec![10.0; 51];
        assert!(calculate_ichimoku(&closes, &closes, &closes).is_none());
    }

    #[test]
    fn ichimoku_uses_available_span_when_span_b_is_not_projected_yet() {
        let closes: Vec<f64> = (0..60).map(|i| 100.0 + i as f64).collect();
        let cloud = calculate_ichimoku(&closes, &closes, &closes).unwrap();
        assert!(cloud.senkou_span_b.is_none());
        let span_a = cloud.senkou_span_a.unwrap();
        assert_eq!(cloud.cloud_top, Some(span_a));
        assert!(cloud.price_above_cloud);
        assert!(!cloud.tk_cross_bullish);
        assert!((cloud.chikou_span - 159.0).abs() < 1e-9);
    }

    #[test]
    fn ichimoku_detects_tenkan_kijun_cross() {
        let mut closes = vec![100.0; 60];
        closes.extend(vec![80.0; 10]);
        closes.extend(vec![85.0; 10]);
        closes.push(120.0);
        let cloud = calculate_ichimoku(&closes, &closes, &closes).unwrap();
        assert!(cloud.tk_cross_bullish);
        assert!(cloud.senkou_span_b.is_some());
    }

    #[test]
    fn bollinger_bands_use_sample_deviation_and_clamp_degenerate_lower_band() {
        let mut prices = vec![100.0; 19];
        prices.push(50.0);
        let bands = calculate_bollinger_bands(&prices, BOLLINGER_PERIOD, BOLLINGER_STD_DEV);
        assert!((bands.middle.unwrap() - 97.5).abs() < 1e-9);
        assert!((bands.lower.unwrap() - 49.0).abs() < 1e-9);
        let expected_upper = 97.5 + 2.0 * (2375.0_f64 / 19.0).sqrt();
        assert!((bands.upper.unwrap() - expected_upper).abs() < 1e-9);
    }

    #[test]
    fn flat_prices_form_a_squeeze() {
        let bands = calculate_bollinger_bands(&vec![10.0; 25], 20, 2.0);
        assert!(is_bollinger_squeeze(&bands, BOLLINGER_SQUEEZE_WIDTH));
        assert!(!is_bollinger_squeeze(
            &BollingerBands::default(),
            BOLLINGER_SQUEEZE_WIDTH
        ));
    }

    #[test]
    fn volume_profile_with_zero_range_is_absent() {
        let profile = calculate_volume_profile(&flat_bars(20, 250.0), 20, 10);
        assert_eq!(profile, VolumeProfile::default());
        assert_eq!(profile.support, None);
        assert_eq!(profile.resistance, None);
        assert_eq!(profile.point_of_control, None);
    }

    #[test]
    fn volume_profile_spreads_volume_across_touched_bins() {
        let bars = vec![
            make_bar(0, 100.0, 110.0, 105.0, 1_000.0),
            make_bar(1, 100.0, 101.0, 100.5, 500.0),
            make_bar(2, 108.0, 110.0, 109.0, 300.0),
        ];
        let profile = calculate_volume_profile(&bars, 20, 10);
        assert_eq!(profile.point_of_control, Some(100.5));
        assert_eq!(profile.support, Some(100.5));
        assert_eq!(profile.resistance, Some(109.5));
    }

    #[test]
    fn bar_resting_on_window_high_is_left_out_of_profile() {
        let bars = vec![
            make_bar(0, 100.0, 110.0, 105.0, 1_000.0),
            make_bar(1, 110.0, 110.0, 110.0, 5_000.0),
        ];
        let profile = calculate_volume_profile(&bars, 20, 10);
        // Only the first bar counts, spread evenly, so the earliest bin wins the tie.
        assert_eq!(profile.point_of_control, Some(100.5));
        assert_eq!(profile.support, Some(100.5));
        assert_eq!(profile.resistance, None);
    }

    #[test]
    fn swing_levels_use_trailing_window() {
        let lows = vec![1.0, 5.0, 6.0, 7.0];
        let highs = vec![20.0, 8.0, 9.0, 10.0];
        assert_eq!(find_support_level(&lows, 3), Some(5.0));
        assert_eq!(find_resistance_level(&highs, 3), Some(10.0));
        assert_eq!(find_support_level(&[], 3), None);
    }

    #[test]
    fn snapshot_requires_full_long_window() {
        assert!(compute_snapshot(&flat_bars(99, 10.0)).is_none());
        let snapshot = compute_snapshot(&flat_bars(100, 10.0)).unwrap();
        assert!((snapshot.sma_100 - 10.0).abs() < 1e-9);
        assert!((snapshot.volume_ratio - 1.0).abs() < 1e-9);
        assert_eq!(snapshot.volume_profile, VolumeProfile::default());
        assert!(snapshot.ichimoku.is_some());
    }
}
