//! Moving average, RSI, and pivot helpers shared by the pattern predicates.
//!
//! All functions are pure over in-memory bar slices. Indicator series are
//! returned aligned to the input with `None` where the value is undefined.

use crate::models::Kline;

/// Exponential moving average, seeded from the simple average of the first
/// `period` closes, then recursive with alpha = 2 / (period + 1).
pub fn ema_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period {
        return out;
    }

    let seed: f64 = closes[..period].iter().sum::<f64>() / period as f64;
    out[period - 1] = Some(seed);

    let alpha = 2.0 / (period as f64 + 1.0);
    let mut prev = seed;
    for i in period..closes.len() {
        let next = (closes[i] - prev) * alpha + prev;
        out[i] = Some(next);
        prev = next;
    }

    out
}

/// Wilder's RSI. The first `period` deltas form the seed average gain/loss;
/// subsequent steps use smoothed averaging `(prev * (period - 1) + new) / period`.
pub fn rsi_series(closes: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; closes.len()];
    if period == 0 || closes.len() < period + 1 {
        return out;
    }

    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta > 0.0 {
            avg_gain += delta;
        } else {
            avg_loss += -delta;
        }
    }
    avg_gain /= period as f64;
    avg_loss /= period as f64;
    out[period] = Some(rsi_value(avg_gain, avg_loss));

    for i in (period + 1)..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let (gain, loss) = if delta > 0.0 {
            (delta, 0.0)
        } else {
            (0.0, -delta)
        };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        out[i] = Some(rsi_value(avg_gain, avg_loss));
    }

    out
}

fn rsi_value(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        return 100.0;
    }
    if avg_gain == 0.0 {
        return 0.0;
    }
    100.0 - 100.0 / (1.0 + avg_gain / avg_loss)
}

/// Fixed neighbourhood for pivot detection.
pub const PIVOT_SPAN: usize = 2;

/// A local extremum: absolute index into the bar slice plus its price.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pivot {
    pub idx: usize,
    pub price: f64,
}

/// Pivot highs with up to `lookback` candidate centers, taken from the last
/// `lookback + 2 * PIVOT_SPAN` bars so each center has a full neighbourhood.
/// Returned in ascending index order.
pub fn pivot_highs(bars: &[Kline], lookback: usize) -> Vec<Pivot> {
    find_pivots(bars, lookback, |b| b.high, |center, neighbour| {
        center > neighbour
    })
}

/// Pivot lows, symmetric to [`pivot_highs`].
pub fn pivot_lows(bars: &[Kline], lookback: usize) -> Vec<Pivot> {
    find_pivots(bars, lookback, |b| b.low, |center, neighbour| {
        center < neighbour
    })
}

fn find_pivots(
    bars: &[Kline],
    lookback: usize,
    value: impl Fn(&Kline) -> f64,
    beats: impl Fn(f64, f64) -> bool,
) -> Vec<Pivot> {
    let len = bars.len();
    if len < 2 * PIVOT_SPAN + 1 {
        return Vec::new();
    }

    let window_start = len.saturating_sub(lookback + 2 * PIVOT_SPAN);
    let first = window_start + PIVOT_SPAN;
    let last = len - PIVOT_SPAN; // exclusive

    let mut pivots = Vec::new();
    for i in first..last {
        let center = value(&bars[i]);
        let is_pivot = (1..=PIVOT_SPAN).all(|d| {
            beats(center, value(&bars[i - d])) && beats(center, value(&bars[i + d]))
        });
        if is_pivot {
            pivots.push(Pivot {
                idx: i,
                price: center,
            });
        }
    }

    pivots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64) -> Kline {
        Kline {
            open_time: 0,
            close_time: 0,
            open: (high + low) / 2.0,
            high,
            low,
            close: (high + low) / 2.0,
            volume: 0.0,
            trades_count: None,
        }
    }

    #[test]
    fn test_ema_seed_is_simple_average() {
        let closes = [2.0, 4.0, 6.0];
        let ema = ema_series(&closes, 3);
        assert_eq!(ema[0], None);
        assert_eq!(ema[1], None);
        assert_eq!(ema[2], Some(4.0));
    }

    #[test]
    fn test_ema_recursion() {
        let closes = [1.0, 2.0, 3.0, 10.0];
        let ema = ema_series(&closes, 3);
        // seed 2.0, alpha 0.5 -> (10 - 2) * 0.5 + 2 = 6.0
        assert_eq!(ema[3], Some(6.0));
    }

    #[test]
    fn test_ema_insufficient_data() {
        let closes = [1.0, 2.0];
        assert!(ema_series(&closes, 3).iter().all(|v| v.is_none()));
    }

    #[test]
    fn test_rsi_all_gains_is_100() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 + i as f64).collect();
        let rsi = rsi_series(&closes, 14);
        assert_eq!(rsi[14], Some(100.0));
        assert_eq!(rsi[19], Some(100.0));
    }

    #[test]
    fn test_rsi_all_losses_is_0() {
        let closes: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        let rsi = rsi_series(&closes, 14);
        assert_eq!(rsi[14], Some(0.0));
    }

    #[test]
    fn test_rsi_balanced_is_50() {
        // Alternating +1/-1 deltas give equal avg gain and loss at the seed.
        let mut closes = vec![100.0];
        for i in 0..14 {
            let last = *closes.last().unwrap();
            closes.push(if i % 2 == 0 { last + 1.0 } else { last - 1.0 });
        }
        let rsi = rsi_series(&closes, 14);
        let v = rsi[14].unwrap();
        assert!((v - 50.0).abs() < 1e-9, "rsi {}", v);
    }

    #[test]
    fn test_pivot_high_detection() {
        // Highs: 1 2 3 9 3 2 1 -> single pivot at idx 3.
        let highs = [1.0, 2.0, 3.0, 9.0, 3.0, 2.0, 1.0];
        let bars: Vec<Kline> = highs.iter().map(|&h| bar(h, h - 1.0)).collect();
        let pivots = pivot_highs(&bars, 10);
        assert_eq!(pivots.len(), 1);
        assert_eq!(pivots[0].idx, 3);
        assert_eq!(pivots[0].price, 9.0);
    }

    #[test]
    fn test_pivot_requires_strict_dominance() {
        // Plateau: equal neighbour means no pivot.
        let highs = [1.0, 2.0, 9.0, 9.0, 3.0, 2.0, 1.0];
        let bars: Vec<Kline> = highs.iter().map(|&h| bar(h, h - 1.0)).collect();
        assert!(pivot_highs(&bars, 10).is_empty());
    }

    #[test]
    fn test_pivot_low_detection() {
        let lows = [5.0, 4.0, 1.0, 4.0, 5.0, 6.0, 7.0];
        let bars: Vec<Kline> = lows.iter().map(|&l| bar(l + 1.0, l)).collect();
        let pivots = pivot_lows(&bars, 10);
        assert_eq!(pivots.len(), 1);
        assert_eq!(pivots[0].idx, 2);
    }

    #[test]
    fn test_pivot_outermost_bars_excluded() {
        // Highest bar sits at the edge of the slice; span bars there are not
        // eligible centers.
        let highs = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 9.0];
        let bars: Vec<Kline> = highs.iter().map(|&h| bar(h, h - 1.0)).collect();
        assert!(pivot_highs(&bars, 10).is_empty());
    }
}
