//! Breakout and multi-pivot structure predicates.
//!
//! Structure patterns search pivots over a trailing window and compare the
//! last close against a neckline derived from the pivot geometry.

use crate::models::Kline;
use crate::patterns::indicators::{pivot_highs, pivot_lows, Pivot};

/// Shoulder/top tolerance: two peaks count as "equal" within 1%.
const LEVEL_TOLERANCE: f64 = 0.01;
/// Minimum bar distance between the two tops/bottoms of a double pattern.
const MIN_PEAK_GAP: usize = 5;

/// Current close strictly above the max high of the previous `n` bars.
pub fn close_gt_high(bars: &[Kline], n: usize) -> bool {
    let len = bars.len();
    if len < n + 1 {
        return false;
    }
    let prior_high = bars[len - 1 - n..len - 1]
        .iter()
        .map(|b| b.high)
        .fold(f64::MIN, f64::max);
    bars[len - 1].close > prior_high
}

/// Current close strictly below the min low of the previous `n` bars.
pub fn close_lt_low(bars: &[Kline], n: usize) -> bool {
    let len = bars.len();
    if len < n + 1 {
        return false;
    }
    let prior_low = bars[len - 1 - n..len - 1]
        .iter()
        .map(|b| b.low)
        .fold(f64::MAX, f64::min);
    bars[len - 1].close < prior_low
}

/// Double top over the last `lookback` pivot-eligible bars: the two most
/// recent pivot highs at least `MIN_PEAK_GAP` bars apart and within 1% of each
/// other, with the close broken below the neckline (min low between them).
pub fn double_top(bars: &[Kline], lookback: usize) -> bool {
    let pivots = pivot_highs(bars, lookback);
    let Some((p1, p2)) = most_recent_pair(&pivots) else {
        return false;
    };
    if !within_tolerance(p1.price, p2.price) {
        return false;
    }
    let neckline = bars[p1.idx + 1..p2.idx]
        .iter()
        .map(|b| b.low)
        .fold(f64::MAX, f64::min);
    last_close(bars) < neckline
}

/// Double bottom, symmetric to [`double_top`]: pivot lows, neckline is the max
/// high strictly between them, close broken above.
pub fn double_bottom(bars: &[Kline], lookback: usize) -> bool {
    let pivots = pivot_lows(bars, lookback);
    let Some((p1, p2)) = most_recent_pair(&pivots) else {
        return false;
    };
    if !within_tolerance(p1.price, p2.price) {
        return false;
    }
    let neckline = bars[p1.idx + 1..p2.idx]
        .iter()
        .map(|b| b.high)
        .fold(f64::MIN, f64::max);
    last_close(bars) > neckline
}

/// Head and shoulders: three pivot highs (LS < Head < RS) with shoulders
/// within 1% of each other and the head at least 1% above the greater
/// shoulder; neckline is the mean of the most recent pivot low inside each of
/// the (LS, Head) and (Head, RS) gaps; holds iff the close broke below it.
/// Iteration starts from the most recent candidates; any valid triple
/// suffices.
pub fn head_and_shoulders(bars: &[Kline], lookback: usize) -> bool {
    let highs = pivot_highs(bars, lookback);
    let lows = pivot_lows(bars, lookback);

    scan_triples(&highs, |ls, head, rs| {
        if !within_tolerance(ls.price, rs.price) {
            return None;
        }
        if head.price < ls.price.max(rs.price) * (1.0 + LEVEL_TOLERANCE) {
            return None;
        }
        let left_trough = most_recent_between(&lows, ls.idx, head.idx)?;
        let right_trough = most_recent_between(&lows, head.idx, rs.idx)?;
        Some((left_trough.price + right_trough.price) / 2.0)
    })
    .map(|neckline| last_close(bars) < neckline)
    .unwrap_or(false)
}

/// Inverse head and shoulders: mirror of [`head_and_shoulders`] on pivot lows,
/// head at least 1% below the lesser shoulder, troughs become pivot highs, and
/// the close must break above the neckline.
pub fn inverse_head_and_shoulders(bars: &[Kline], lookback: usize) -> bool {
    let lows = pivot_lows(bars, lookback);
    let highs = pivot_highs(bars, lookback);

    scan_triples(&lows, |ls, head, rs| {
        if !within_tolerance(ls.price, rs.price) {
            return None;
        }
        if head.price > ls.price.min(rs.price) * (1.0 - LEVEL_TOLERANCE) {
            return None;
        }
        let left_peak = most_recent_between(&highs, ls.idx, head.idx)?;
        let right_peak = most_recent_between(&highs, head.idx, rs.idx)?;
        Some((left_peak.price + right_peak.price) / 2.0)
    })
    .map(|neckline| last_close(bars) > neckline)
    .unwrap_or(false)
}

fn last_close(bars: &[Kline]) -> f64 {
    bars[bars.len() - 1].close
}

fn within_tolerance(a: f64, b: f64) -> bool {
    let avg = (a + b) / 2.0;
    avg != 0.0 && ((a - b).abs() / avg) <= LEVEL_TOLERANCE
}

/// Most recent pivot pair (p1 earlier, p2 later) at least `MIN_PEAK_GAP`
/// apart: p2 is the latest pivot, p1 the latest earlier pivot satisfying the
/// gap.
fn most_recent_pair(pivots: &[Pivot]) -> Option<(Pivot, Pivot)> {
    let p2 = *pivots.last()?;
    let p1 = pivots[..pivots.len() - 1]
        .iter()
        .rev()
        .find(|p| p2.idx - p.idx >= MIN_PEAK_GAP)?;
    Some((*p1, p2))
}

/// Try (LS, Head, RS) triples newest-first; first candidate accepted by
/// `judge` wins.
fn scan_triples(
    pivots: &[Pivot],
    judge: impl Fn(Pivot, Pivot, Pivot) -> Option<f64>,
) -> Option<f64> {
    let n = pivots.len();
    for rs_i in (2..n).rev() {
        for head_i in (1..rs_i).rev() {
            for ls_i in (0..head_i).rev() {
                if let Some(neckline) = judge(pivots[ls_i], pivots[head_i], pivots[rs_i]) {
                    return Some(neckline);
                }
            }
        }
    }
    None
}

/// Most recent pivot strictly inside (start, end).
fn most_recent_between(pivots: &[Pivot], start: usize, end: usize) -> Option<Pivot> {
    pivots
        .iter()
        .rev()
        .find(|p| p.idx > start && p.idx < end)
        .copied()
}
