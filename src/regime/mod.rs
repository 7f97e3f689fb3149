// =============================================================================
// Market Regime Classifier
// =============================================================================
//
// Maps an indicator set onto a discrete per-timeframe state. Rules are
// evaluated top-to-bottom; first match wins:
//
//   1. UNKNOWN   — the indicator set is missing (insufficient buffer)
//   2. SIDEWAYS  — ADX below the trend threshold
//   3. UPTREND   — ADX >= threshold, EMA12 > EMA26, RSI below the upper gate
//   4. DOWNTREND — ADX >= threshold, EMA12 < EMA26, RSI above the lower gate
//   5. SIDEWAYS  — anything else
//
// The mapping is total: every defined indicator set produces a state.
// Thresholds come from configuration with defaults ADX=20, RSI=70/30.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::RegimeThresholds;
use crate::indicators::{self, IndicatorSet};
use crate::market_data::{CandleBuffer, SeriesKey, Timeframe};

/// Discrete market state for one timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Regime {
    Uptrend,
    Downtrend,
    Sideways,
    Unknown,
}

impl Regime {
    /// Gate recovery accepts any observed non-downtrend state.
    pub fn permits_recovery(&self) -> bool {
        matches!(self, Self::Uptrend | Self::Sideways)
    }
}

impl std::fmt::Display for Regime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Uptrend => write!(f, "UPTREND"),
            Self::Downtrend => write!(f, "DOWNTREND"),
            Self::Sideways => write!(f, "SIDEWAYS"),
            Self::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

/// Classify a single indicator set. Pure and total.
pub fn classify_set(set: Option<&IndicatorSet>, thresholds: &RegimeThresholds) -> Regime {
    let Some(set) = set else {
        return Regime::Unknown;
    };

    if set.adx14 < thresholds.adx_threshold {
        return Regime::Sideways;
    }
    if set.ema12 > set.ema26 && set.rsi14 < thresholds.rsi_upper {
        return Regime::Uptrend;
    }
    if set.ema12 < set.ema26 && set.rsi14 > thresholds.rsi_lower {
        return Regime::Downtrend;
    }
    Regime::Sideways
}

/// Threshold-parameterised classifier over the candle buffers.
pub struct RegimeClassifier {
    thresholds: RegimeThresholds,
}

impl RegimeClassifier {
    pub fn new(thresholds: RegimeThresholds) -> Self {
        Self { thresholds }
    }

    /// Classify one (symbol, timeframe) from the current buffer snapshot.
    pub fn classify(&self, buffer: &CandleBuffer, symbol: &str, timeframe: Timeframe) -> Regime {
        let snapshot = buffer.snapshot(&SeriesKey::new(symbol, timeframe));
        let set = indicators::compute(&snapshot);
        let regime = classify_set(set.as_ref(), &self.thresholds);
        debug!(symbol, timeframe = %timeframe, regime = %regime, "timeframe classified");
        regime
    }

    /// Classify the core gate timeframes (1h, 1d), plus 15m/6h when those
    /// buffers are populated. Only 1h and 1d drive the trade gates; the rest
    /// are advisory.
    pub fn classify_all(&self, buffer: &CandleBuffer, symbol: &str) -> HashMap<Timeframe, Regime> {
        let mut out = HashMap::new();
        out.insert(Timeframe::H1, self.classify(buffer, symbol, Timeframe::H1));
        out.insert(Timeframe::D1, self.classify(buffer, symbol, Timeframe::D1));

        for tf in [Timeframe::M15, Timeframe::H6] {
            if buffer.len(&SeriesKey::new(symbol, tf)) > 0 {
                out.insert(tf, self.classify(buffer, symbol, tf));
            }
        }
        out
    }
}
