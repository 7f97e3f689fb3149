// =============================================================================
// Microstructure Metrics — spread, book imbalance, short-horizon volatility
// =============================================================================
//
// Unlike the candle-derived indicators, missing microstructure inputs are not
// an error: every field has a defined default, and the computation fills in
// whatever the ticker / depth / 1m-candle snapshots can support.
// =============================================================================

use crate::indicators::atr::calculate_atr;
use crate::indicators::ema::latest_ema;
use crate::market_data::{Candle, DepthSnapshot, TickerTick};

/// Book levels per side summed for the imbalance ratio.
pub const IMBALANCE_DEPTH: usize = 10;

/// Candles of history behind the volume-surge baseline.
pub const SURGE_LOOKBACK: usize = 20;

/// Microstructure snapshot for one symbol.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MicroSet {
    /// (best_ask - best_bid) / best_bid.
    pub bid_ask_spread: f64,
    /// Sum of top-N bid quantities over total top-N quantity, in [0, 1].
    pub order_book_imbalance: f64,
    /// Fast EMA of 1m closes.
    pub ema5: f64,
    /// ATR of 1m candles.
    pub atr14: f64,
    /// Latest 1m volume over the mean of the prior lookback window.
    pub volume_surge_ratio: f64,
    pub best_ask: f64,
}

impl Default for MicroSet {
    fn default() -> Self {
        Self {
            bid_ask_spread: 0.0,
            order_book_imbalance: 0.5,
            ema5: 0.0,
            atr14: 0.0001,
            volume_surge_ratio: 1.0,
            best_ask: 0.0,
        }
    }
}

/// Compute the microstructure set from whatever inputs are available.
pub fn compute_micro(
    ticker: Option<&TickerTick>,
    depth: Option<&DepthSnapshot>,
    candles_1m: &[Candle],
) -> MicroSet {
    let mut out = MicroSet::default();

    // Spread and best ask: ticker first, top-of-book depth as fallback.
    let quote = match ticker {
        Some(t) if t.best_bid > 0.0 && t.best_ask > 0.0 => Some((t.best_bid, t.best_ask)),
        _ => depth.and_then(|d| match (d.best_bid(), d.best_ask()) {
            (Some((bid, _)), Some((ask, _))) if bid > 0.0 && ask > 0.0 => Some((bid, ask)),
            _ => None,
        }),
    };
    if let Some((bid, ask)) = quote {
        out.bid_ask_spread = (ask - bid) / bid;
        out.best_ask = ask;
    }

    if let Some(d) = depth {
        let bid_qty: f64 = d.bids.iter().take(IMBALANCE_DEPTH).map(|(_, q)| q).sum();
        let ask_qty: f64 = d.asks.iter().take(IMBALANCE_DEPTH).map(|(_, q)| q).sum();
        let total = bid_qty + ask_qty;
        if total > 0.0 {
            out.order_book_imbalance = bid_qty / total;
        }
    }

    let closes: Vec<f64> = candles_1m.iter().map(|c| c.close).collect();
    if let Some(ema5) = latest_ema(&closes, 5) {
        out.ema5 = ema5;
    }
    if let Some(atr) = calculate_atr(candles_1m, 14) {
        if atr > 0.0 {
            out.atr14 = atr;
        }
    }

    if candles_1m.len() > SURGE_LOOKBACK {
        let latest = candles_1m[candles_1m.len() - 1].volume;
        let prior = &candles_1m[candles_1m.len() - 1 - SURGE_LOOKBACK..candles_1m.len() - 1];
        let mean: f64 = prior.iter().map(|c| c.volume).sum::<f64>() / SURGE_LOOKBACK as f64;
        if mean > 0.0 {
            out.volume_surge_ratio = latest / mean;
        }
    }

    out
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tick(bid: f64, ask: f64) -> TickerTick {
        TickerTick {
            event_time_ms: 1,
            last_price: (bid + ask) / 2.0,
            best_bid: bid,
            best_bid_qty: 3.0,
            best_ask: ask,
            best_ask_qty: 2.0,
            volume_24h: 500.0,
        }
    }

    fn depth(bid_qty: f64, ask_qty: f64) -> DepthSnapshot {
        DepthSnapshot {
            event_time_ms: 1,
            last_update_id: 1,
            bids: vec![(100.0, bid_qty)],
            asks: vec![(100.1, ask_qty)],
        }
    }

    fn candle_1m(i: i64, close: f64, volume: f64) -> Candle {
        Candle::new(i * 60_000, close, close + 0.5, close - 0.5, close, volume, i * 60_000 + 59_999)
    }

    #[test]
    fn empty_inputs_yield_defaults() {
        let set = compute_micro(None, None, &[]);
        assert_eq!(set, MicroSet::default());
        assert!((set.atr14 - 0.0001).abs() < f64::EPSILON);
        assert!((set.order_book_imbalance - 0.5).abs() < f64::EPSILON);
        assert!((set.volume_surge_ratio - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn spread_from_ticker() {
        let t = tick(100.0, 100.2);
        let set = compute_micro(Some(&t), None, &[]);
        assert!((set.bid_ask_spread - 0.002).abs() < 1e-12);
        assert!((set.best_ask - 100.2).abs() < f64::EPSILON);
    }

    #[test]
    fn spread_falls_back_to_depth() {
        let d = depth(1.0, 1.0);
        let set = compute_micro(None, Some(&d), &[]);
        assert!(set.bid_ask_spread > 0.0);
        assert!((set.best_ask - 100.1).abs() < f64::EPSILON);
    }

    #[test]
    fn imbalance_reflects_bid_dominance() {
        let d = depth(9.0, 1.0);
        let set = compute_micro(None, Some(&d), &[]);
        assert!((set.order_book_imbalance - 0.9).abs() < 1e-12);
    }

    #[test]
    fn volume_surge_detected() {
        // 20 quiet candles then a 5x volume spike.
        let mut candles: Vec<Candle> = (0..20).map(|i| candle_1m(i, 100.0, 10.0)).collect();
        candles.push(candle_1m(20, 100.0, 50.0));
        let set = compute_micro(None, None, &candles);
        assert!((set.volume_surge_ratio - 5.0).abs() < 1e-9);
    }

    #[test]
    fn ema_and_atr_from_candles() {
        let candles: Vec<Candle> = (0..30).map(|i| candle_1m(i, 100.0, 10.0)).collect();
        let set = compute_micro(None, None, &candles);
        assert!((set.ema5 - 100.0).abs() < 1e-9);
        // Constant 1.0 range per bar.
        assert!((set.atr14 - 1.0).abs() < 0.1);
    }
}
