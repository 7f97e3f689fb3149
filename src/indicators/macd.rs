// =============================================================================
// Moving Average Convergence Divergence (MACD)
// =============================================================================
//
//   MACD line  = EMA(fast) - EMA(slow)
//   Signal     = EMA(signal) of the MACD line
//   Histogram  = MACD - Signal
//
// With the conventional (12, 26, 9) parameters the signal line needs
// slow + signal - 1 = 34 closes before it is defined.
// =============================================================================

use crate::indicators::ema::calculate_ema;

/// Latest MACD reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdPoint {
    pub macd: f64,
    pub signal: f64,
    pub histogram: f64,
}

/// Compute the most recent MACD point over `closes`.
///
/// Returns `None` when `fast >= slow`, any period is zero, or the series is
/// too short for the signal line to be defined.
pub fn calculate_macd(
    closes: &[f64],
    fast: usize,
    slow: usize,
    signal: usize,
) -> Option<MacdPoint> {
    if fast == 0 || slow == 0 || signal == 0 || fast >= slow {
        return None;
    }

    let fast_series = calculate_ema(closes, fast);
    let slow_series = calculate_ema(closes, slow);
    if slow_series.is_empty() {
        return None;
    }

    // fast_series starts at close index fast-1, slow_series at slow-1; align
    // both to the slow start so the MACD line covers indices slow-1 onward.
    let offset = slow - fast;
    if fast_series.len() <= offset {
        return None;
    }
    let macd_line: Vec<f64> = fast_series[offset..]
        .iter()
        .zip(slow_series.iter())
        .map(|(f, s)| f - s)
        .collect();

    let signal_series = calculate_ema(&macd_line, signal);
    let signal_val = *signal_series.last()?;
    let macd_val = *macd_line.last()?;

    let point = MacdPoint {
        macd: macd_val,
        signal: signal_val,
        histogram: macd_val - signal_val,
    };

    (point.macd.is_finite() && point.signal.is_finite()).then_some(point)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn macd_insufficient_data() {
        let closes: Vec<f64> = (1..=33).map(|x| x as f64).collect();
        // 12/26/9 needs 34 closes.
        assert!(calculate_macd(&closes, 12, 26, 9).is_none());
    }

    #[test]
    fn macd_exact_minimum_data() {
        let closes: Vec<f64> = (1..=34).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 12, 26, 9).is_some());
    }

    #[test]
    fn macd_degenerate_periods() {
        let closes: Vec<f64> = (1..=60).map(|x| x as f64).collect();
        assert!(calculate_macd(&closes, 0, 26, 9).is_none());
        assert!(calculate_macd(&closes, 12, 0, 9).is_none());
        assert!(calculate_macd(&closes, 12, 26, 0).is_none());
        assert!(calculate_macd(&closes, 26, 12, 9).is_none());
    }

    #[test]
    fn macd_positive_in_uptrend() {
        let closes: Vec<f64> = (1..=80).map(|x| x as f64).collect();
        let point = calculate_macd(&closes, 12, 26, 9).unwrap();
        // Fast EMA leads in a steady rise.
        assert!(point.macd > 0.0);
        assert!(point.signal > 0.0);
    }

    #[test]
    fn macd_negative_in_downtrend() {
        let closes: Vec<f64> = (1..=80).rev().map(|x| x as f64).collect();
        let point = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(point.macd < 0.0);
    }

    #[test]
    fn macd_flat_market_is_zero() {
        let closes = vec![100.0; 60];
        let point = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!(point.macd.abs() < 1e-10);
        assert!(point.signal.abs() < 1e-10);
        assert!(point.histogram.abs() < 1e-10);
    }

    #[test]
    fn histogram_is_macd_minus_signal() {
        let closes: Vec<f64> = (0..80).map(|i| 100.0 + (i as f64 * 0.4).sin() * 5.0).collect();
        let point = calculate_macd(&closes, 12, 26, 9).unwrap();
        assert!((point.histogram - (point.macd - point.signal)).abs() < 1e-12);
    }
}
