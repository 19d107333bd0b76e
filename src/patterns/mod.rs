//! Deterministic pattern engine.
//!
//! A closed whitelist of pattern ids drives both evaluation and the minimum
//! bar requirement, so validation and the evaluator can never disagree about
//! which patterns exist. Evaluation is pure: bars in, bool out, no clock, no
//! I/O. Insufficient history is `false`, not an error.

pub mod candles;
pub mod indicators;
pub mod structure;

use crate::models::Kline;
use indicators::{ema_series, rsi_series};

/// Whitelisted pattern ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pattern {
    BullishEngulfing,
    BearishEngulfing,
    Hammer,
    ShootingStar,
    Doji,
    InsideBar,
    OutsideBar,
    MorningStar,
    EveningStar,
    ThreeWhiteSoldiers,
    ThreeBlackCrows,
    Ema20GtEma50,
    Ema20LtEma50,
    Ema20CrossUpEma50,
    Ema20CrossDownEma50,
    Rsi14Lt30,
    Rsi14Gt70,
    CloseGtHigh20,
    CloseLtLow20,
    CloseGtHigh55,
    CloseLtLow55,
    DoubleTop60,
    DoubleBottom60,
    HeadAndShoulders90,
    InverseHeadAndShoulders90,
}

pub const ALL_PATTERNS: [Pattern; 25] = [
    Pattern::BullishEngulfing,
    Pattern::BearishEngulfing,
    Pattern::Hammer,
    Pattern::ShootingStar,
    Pattern::Doji,
    Pattern::InsideBar,
    Pattern::OutsideBar,
    Pattern::MorningStar,
    Pattern::EveningStar,
    Pattern::ThreeWhiteSoldiers,
    Pattern::ThreeBlackCrows,
    Pattern::Ema20GtEma50,
    Pattern::Ema20LtEma50,
    Pattern::Ema20CrossUpEma50,
    Pattern::Ema20CrossDownEma50,
    Pattern::Rsi14Lt30,
    Pattern::Rsi14Gt70,
    Pattern::CloseGtHigh20,
    Pattern::CloseLtLow20,
    Pattern::CloseGtHigh55,
    Pattern::CloseLtLow55,
    Pattern::DoubleTop60,
    Pattern::DoubleBottom60,
    Pattern::HeadAndShoulders90,
    Pattern::InverseHeadAndShoulders90,
];

impl Pattern {
    pub fn id(&self) -> &'static str {
        match self {
            Pattern::BullishEngulfing => "candle.bullish_engulfing.v1",
            Pattern::BearishEngulfing => "candle.bearish_engulfing.v1",
            Pattern::Hammer => "candle.hammer.v1",
            Pattern::ShootingStar => "candle.shooting_star.v1",
            Pattern::Doji => "candle.doji.v1",
            Pattern::InsideBar => "candle.inside_bar.v1",
            Pattern::OutsideBar => "candle.outside_bar.v1",
            Pattern::MorningStar => "candle.morning_star.v1",
            Pattern::EveningStar => "candle.evening_star.v1",
            Pattern::ThreeWhiteSoldiers => "candle.three_white_soldiers.v1",
            Pattern::ThreeBlackCrows => "candle.three_black_crows.v1",
            Pattern::Ema20GtEma50 => "indicator.ema20_gt_ema50.v1",
            Pattern::Ema20LtEma50 => "indicator.ema20_lt_ema50.v1",
            Pattern::Ema20CrossUpEma50 => "indicator.ema20_cross_up_ema50.v1",
            Pattern::Ema20CrossDownEma50 => "indicator.ema20_cross_down_ema50.v1",
            Pattern::Rsi14Lt30 => "indicator.rsi14_lt_30.v1",
            Pattern::Rsi14Gt70 => "indicator.rsi14_gt_70.v1",
            Pattern::CloseGtHigh20 => "breakout.close_gt_high_20.v1",
            Pattern::CloseLtLow20 => "breakout.close_lt_low_20.v1",
            Pattern::CloseGtHigh55 => "breakout.close_gt_high_55.v1",
            Pattern::CloseLtLow55 => "breakout.close_lt_low_55.v1",
            Pattern::DoubleTop60 => "structure.double_top_60.v1",
            Pattern::DoubleBottom60 => "structure.double_bottom_60.v1",
            Pattern::HeadAndShoulders90 => "structure.head_and_shoulders_90.v1",
            Pattern::InverseHeadAndShoulders90 => "structure.inverse_head_and_shoulders_90.v1",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        ALL_PATTERNS.iter().copied().find(|p| p.id() == id)
    }

    /// Minimum number of bars needed before the pattern can hold.
    pub fn required_bars(&self) -> usize {
        match self {
            Pattern::Hammer | Pattern::ShootingStar | Pattern::Doji => 1,
            Pattern::BullishEngulfing
            | Pattern::BearishEngulfing
            | Pattern::InsideBar
            | Pattern::OutsideBar => 2,
            Pattern::MorningStar
            | Pattern::EveningStar
            | Pattern::ThreeWhiteSoldiers
            | Pattern::ThreeBlackCrows => 3,
            Pattern::Ema20GtEma50 | Pattern::Ema20LtEma50 => 50,
            Pattern::Ema20CrossUpEma50 | Pattern::Ema20CrossDownEma50 => 51,
            Pattern::Rsi14Lt30 | Pattern::Rsi14Gt70 => 15,
            Pattern::CloseGtHigh20 | Pattern::CloseLtLow20 => 21,
            Pattern::CloseGtHigh55 | Pattern::CloseLtLow55 => 56,
            Pattern::DoubleTop60 | Pattern::DoubleBottom60 => 64,
            Pattern::HeadAndShoulders90 | Pattern::InverseHeadAndShoulders90 => 94,
        }
    }

    /// Whether the pattern holds at the last bar of `bars`.
    pub fn evaluate(&self, bars: &[Kline]) -> bool {
        if bars.len() < self.required_bars() {
            return false;
        }

        match self {
            Pattern::BullishEngulfing => candles::bullish_engulfing(bars),
            Pattern::BearishEngulfing => candles::bearish_engulfing(bars),
            Pattern::Hammer => candles::hammer(bars),
            Pattern::ShootingStar => candles::shooting_star(bars),
            Pattern::Doji => candles::doji(bars),
            Pattern::InsideBar => candles::inside_bar(bars),
            Pattern::OutsideBar => candles::outside_bar(bars),
            Pattern::MorningStar => candles::morning_star(bars),
            Pattern::EveningStar => candles::evening_star(bars),
            Pattern::ThreeWhiteSoldiers => candles::three_white_soldiers(bars),
            Pattern::ThreeBlackCrows => candles::three_black_crows(bars),
            Pattern::Ema20GtEma50 => ema_relation(bars, |e20, e50| e20 > e50),
            Pattern::Ema20LtEma50 => ema_relation(bars, |e20, e50| e20 < e50),
            Pattern::Ema20CrossUpEma50 => ema_cross(bars, true),
            Pattern::Ema20CrossDownEma50 => ema_cross(bars, false),
            Pattern::Rsi14Lt30 => rsi_threshold(bars, |rsi| rsi < 30.0),
            Pattern::Rsi14Gt70 => rsi_threshold(bars, |rsi| rsi > 70.0),
            Pattern::CloseGtHigh20 => structure::close_gt_high(bars, 20),
            Pattern::CloseLtLow20 => structure::close_lt_low(bars, 20),
            Pattern::CloseGtHigh55 => structure::close_gt_high(bars, 55),
            Pattern::CloseLtLow55 => structure::close_lt_low(bars, 55),
            Pattern::DoubleTop60 => structure::double_top(bars, 60),
            Pattern::DoubleBottom60 => structure::double_bottom(bars, 60),
            Pattern::HeadAndShoulders90 => structure::head_and_shoulders(bars, 90),
            Pattern::InverseHeadAndShoulders90 => structure::inverse_head_and_shoulders(bars, 90),
        }
    }
}

fn closes(bars: &[Kline]) -> Vec<f64> {
    bars.iter().map(|b| b.close).collect()
}

fn ema_relation(bars: &[Kline], holds: impl Fn(f64, f64) -> bool) -> bool {
    let closes = closes(bars);
    let e20 = ema_series(&closes, 20);
    let e50 = ema_series(&closes, 50);
    match (e20.last().copied().flatten(), e50.last().copied().flatten()) {
        (Some(a), Some(b)) => holds(a, b),
        _ => false,
    }
}

fn ema_cross(bars: &[Kline], up: bool) -> bool {
    let closes = closes(bars);
    let e20 = ema_series(&closes, 20);
    let e50 = ema_series(&closes, 50);
    let n = closes.len();
    let at = |series: &[Option<f64>], i: usize| series[i];
    match (
        at(&e20, n - 2),
        at(&e50, n - 2),
        at(&e20, n - 1),
        at(&e50, n - 1),
    ) {
        (Some(p20), Some(p50), Some(c20), Some(c50)) => {
            if up {
                p20 <= p50 && c20 > c50
            } else {
                p20 >= p50 && c20 < c50
            }
        }
        _ => false,
    }
}

fn rsi_threshold(bars: &[Kline], holds: impl Fn(f64) -> bool) -> bool {
    let closes = closes(bars);
    let rsi = rsi_series(&closes, 14);
    matches!(rsi.last().copied().flatten(), Some(v) if holds(v))
}
