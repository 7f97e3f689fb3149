// =============================================================================
// Average Directional Index (ADX)
// =============================================================================
//
// ADX quantifies trend strength regardless of direction:
//   1. +DM / -DM and True Range per bar.
//   2. Wilder's smoothing (period) of +DM, -DM, TR.
//   3. +DI = smoothed(+DM) / smoothed(TR) * 100; -DI analogous.
//   4. DX  = |+DI - -DI| / (+DI + -DI) * 100.
//   5. ADX = Wilder's smoothed average of DX over `period` bars.
// =============================================================================

use crate::market_data::Candle;

/// Compute the most recent ADX value from a slice of closed candles.
///
/// Returns `None` when `period` is zero, when fewer than `2 * period + 1`
/// candles are available (`period` bars seed the directional smoothing and
/// another `period` DX values seed the ADX average, plus the first bar with no
/// predecessor), or when any intermediate value is non-finite.
pub fn calculate_adx(candles: &[Candle], period: usize) -> Option<f64> {
    if period == 0 || candles.len() < 2 * period + 1 {
        return None;
    }

    let period_f = period as f64;

    // Raw +DM, -DM, TR per bar-to-bar transition.
    let transitions: Vec<(f64, f64, f64)> = candles
        .windows(2)
        .map(|w| {
            let (prev, bar) = (&w[0], &w[1]);

            let tr = (bar.high - bar.low)
                .max((bar.high - prev.close).abs())
                .max((bar.low - prev.close).abs());

            let up_move = bar.high - prev.high;
            let down_move = prev.low - bar.low;

            let pdm = if up_move > down_move && up_move > 0.0 {
                up_move
            } else {
                0.0
            };
            let mdm = if down_move > up_move && down_move > 0.0 {
                down_move
            } else {
                0.0
            };

            (pdm, mdm, tr)
        })
        .collect();

    // Initial Wilder sums over the first `period` transitions.
    let mut smooth_pdm: f64 = transitions[..period].iter().map(|t| t.0).sum();
    let mut smooth_mdm: f64 = transitions[..period].iter().map(|t| t.1).sum();
    let mut smooth_tr: f64 = transitions[..period].iter().map(|t| t.2).sum();

    let mut dx_values = Vec::with_capacity(transitions.len() - period + 1);
    dx_values.push(compute_dx(smooth_pdm, smooth_mdm, smooth_tr)?);

    for &(pdm, mdm, tr) in &transitions[period..] {
        smooth_pdm = smooth_pdm - smooth_pdm / period_f + pdm;
        smooth_mdm = smooth_mdm - smooth_mdm / period_f + mdm;
        smooth_tr = smooth_tr - smooth_tr / period_f + tr;

        dx_values.push(compute_dx(smooth_pdm, smooth_mdm, smooth_tr)?);
    }

    if dx_values.len() < period {
        return None;
    }

    // ADX: SMA seed over the first `period` DX values, then Wilder smoothing.
    let seed: f64 = dx_values[..period].iter().sum::<f64>() / period_f;
    if !seed.is_finite() {
        return None;
    }

    let mut adx = seed;
    for &dx in &dx_values[period..] {
        adx = (adx * (period_f - 1.0) + dx) / period_f;
        if !adx.is_finite() {
            return None;
        }
    }

    adx.is_finite().then_some(adx)
}

/// DX from smoothed +DM, -DM, TR. Zero directional movement yields 0.
fn compute_dx(smooth_pdm: f64, smooth_mdm: f64, smooth_tr: f64) -> Option<f64> {
    if smooth_tr == 0.0 {
        return None;
    }

    let plus_di = (smooth_pdm / smooth_tr) * 100.0;
    let minus_di = (smooth_mdm / smooth_tr) * 100.0;

    let di_sum = plus_di + minus_di;
    if di_sum == 0.0 {
        return Some(0.0);
    }

    let dx = ((plus_di - minus_di).abs() / di_sum) * 100.0;
    dx.is_finite().then_some(dx)
}
