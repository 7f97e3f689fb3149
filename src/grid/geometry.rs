// =============================================================================
// Grid geometry — volatility-driven level derivation
// =============================================================================
//
// Spacing S = max(atr_multiplier * atr14, min_spacing_pct * P). The level set
// holds `n` prices at P + k*S for k in [levels_above - (n-1), levels_above],
// so at construction `levels_above` levels sit above the current price, one
// level sits at P itself, and the remainder extend below. All prices are
// quantized to the exchange tick; the generator is deterministic.
// =============================================================================

use serde::{Deserialize, Serialize};

/// A grid price quantized to integer tick units, so equality and ordering are
/// exact. The ledger is keyed by this type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PriceLevel(i64);

impl PriceLevel {
    pub fn from_price(price: f64, tick_size: f64) -> Self {
        Self((price / tick_size).round() as i64)
    }

    pub fn price(&self, tick_size: f64) -> f64 {
        self.0 as f64 * tick_size
    }

    pub fn ticks(&self) -> i64 {
        self.0
    }
}

/// Grid spacing from current price and volatility.
pub fn grid_spacing(price: f64, atr14: f64, atr_multiplier: f64, min_spacing_pct: f64) -> f64 {
    (atr_multiplier * atr14).max(min_spacing_pct * price)
}

/// Generate the level set, ascending. Two source prices that quantize to the
/// same tick collapse into one level (the lower source wins); non-positive
/// prices are dropped.
pub fn build_levels(
    price: f64,
    spacing: f64,
    n: usize,
    levels_above: usize,
    tick_size: f64,
) -> Vec<PriceLevel> {
    if n == 0 || spacing <= 0.0 || price <= 0.0 {
        return Vec::new();
    }

    let k_max = levels_above as i64;
    let k_min = k_max - (n as i64 - 1);

    let mut levels = Vec::with_capacity(n);
    for k in k_min..=k_max {
        let raw = price + k as f64 * spacing;
        if raw <= 0.0 {
            continue;
        }
        let level = PriceLevel::from_price(raw, tick_size);
        if level.ticks() <= 0 {
            continue;
        }
        if levels.last() == Some(&level) {
            continue;
        }
        levels.push(level);
    }
    levels
}

/// The grid level immediately above `level`, if any.
pub fn next_level_above(levels: &[PriceLevel], level: PriceLevel) -> Option<PriceLevel> {
    levels.iter().copied().find(|l| *l > level)
}

/// Quantize a quantity down to the lot step. A small epsilon absorbs binary
/// representation error so exact multiples are not floored away.
pub fn quantize_qty(qty: f64, step_size: f64) -> f64 {
    if step_size <= 0.0 {
        return qty;
    }
    (qty / step_size + 1e-9).floor() * step_size
}
