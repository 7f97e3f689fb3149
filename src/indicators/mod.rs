// =============================================================================
// Technical Indicators Module
// =============================================================================
//
// Pure, side-effect-free computation over buffer snapshots. Every public
// function returns `Option<T>` so callers are forced to handle
// insufficient-data and numerical-edge-case scenarios; a missing indicator is
// a value, never an error.

pub mod adx;
pub mod atr;
pub mod ema;
pub mod macd;
pub mod micro;
pub mod rsi;

pub use macd::MacdPoint;
pub use micro::{compute_micro, MicroSet};

use crate::market_data::Candle;

pub const EMA_FAST: usize = 12;
pub const EMA_SLOW: usize = 26;
pub const MACD_SIGNAL: usize = 9;
pub const RSI_PERIOD: usize = 14;
pub const ADX_PERIOD: usize = 14;
pub const ATR_PERIOD: usize = 14;

/// Complete candle-derived indicator set for one (symbol, timeframe).
///
/// An `IndicatorSet` is all-or-nothing: it only exists when every component
/// is defined, so consumers never observe a partially computed set.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndicatorSet {
    pub ema12: f64,
    pub ema26: f64,
    pub rsi14: f64,
    pub adx14: f64,
    pub atr14: f64,
    pub macd: f64,
    pub macd_signal: f64,
    pub macd_hist: f64,
}

/// Row floor below which no computation is attempted.
pub fn min_rows() -> usize {
    EMA_SLOW.max(2 * ADX_PERIOD)
}

/// Compute the full indicator set from a candle snapshot (oldest first).
///
/// Returns `None` when the snapshot is below the validation floor or any
/// component is individually undefined (the MACD signal line needs 34 rows,
/// ADX needs `2 * period + 1`).
pub fn compute(candles: &[Candle]) -> Option<IndicatorSet> {
    if candles.len() < min_rows() {
        return None;
    }

    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();

    let ema12 = ema::latest_ema(&closes, EMA_FAST)?;
    let ema26 = ema::latest_ema(&closes, EMA_SLOW)?;
    let rsi14 = rsi::latest_rsi(&closes, RSI_PERIOD)?;
    let adx14 = adx::calculate_adx(candles, ADX_PERIOD)?;
    let atr14 = atr::calculate_atr(candles, ATR_PERIOD)?;
    let macd_point = macd::calculate_macd(&closes, EMA_FAST, EMA_SLOW, MACD_SIGNAL)?;

    Some(IndicatorSet {
        ema12,
        ema26,
        rsi14,
        adx14,
        atr14,
        macd: macd_point.macd,
        macd_signal: macd_point.signal,
        macd_hist: macd_point.histogram,
    })
}
