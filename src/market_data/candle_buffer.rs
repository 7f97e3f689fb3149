use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::RetentionConfig;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// Candle timeframes the engine ingests.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "6h")]
    H6,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    /// All timeframes the engine manages, shortest first.
    pub const ALL: [Timeframe; 5] = [
        Timeframe::M1,
        Timeframe::M15,
        Timeframe::H1,
        Timeframe::H6,
        Timeframe::D1,
    ];

    /// Venue interval string.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::M1 => "1m",
            Self::M15 => "15m",
            Self::H1 => "1h",
            Self::H6 => "6h",
            Self::D1 => "1d",
        }
    }

    /// Parse a venue interval string.
    pub fn from_venue(s: &str) -> Option<Self> {
        match s {
            "1m" => Some(Self::M1),
            "15m" => Some(Self::M15),
            "1h" => Some(Self::H1),
            "6h" => Some(Self::H6),
            "1d" => Some(Self::D1),
            _ => None,
        }
    }

    /// Candle duration in milliseconds. Open timestamps are aligned to this
    /// boundary.
    pub fn duration_ms(&self) -> i64 {
        match self {
            Self::M1 => 60_000,
            Self::M15 => 900_000,
            Self::H1 => 3_600_000,
            Self::H6 => 21_600_000,
            Self::D1 => 86_400_000,
        }
    }

    /// Number of historical candles fetched when a buffer is preloaded.
    pub fn preload_horizon(&self) -> usize {
        match self {
            Self::M1 => 60,
            Self::M15 => 100,
            Self::H1 => 72,
            Self::H6 => 100,
            Self::D1 => 60,
        }
    }

    /// Timeframes refreshed by periodic REST polls rather than trusted to the
    /// stream alone.
    pub fn rest_refreshed(&self) -> bool {
        matches!(self, Self::H1 | Self::D1)
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single closed OHLCV candle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    /// Open time in epoch milliseconds, aligned to the timeframe boundary.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub close_time: i64,
}

impl Candle {
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        close_time: i64,
    ) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
            close_time,
        }
    }
}

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub timeframe: Timeframe,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe,
        }
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.timeframe)
    }
}

// ---------------------------------------------------------------------------
// CandleBuffer -- thread-safe ring buffer per (symbol, timeframe)
// ---------------------------------------------------------------------------

/// Thread-safe ring buffer that stores the most recent closed candles per
/// `(symbol, timeframe)` pair. Only closed candles are admitted; timestamps
/// are strictly increasing and timeframe-aligned. Readers take value
/// snapshots, so a writer can never expose a torn view.
pub struct CandleBuffer {
    buffers: RwLock<HashMap<SeriesKey, VecDeque<Candle>>>,
    retention: RetentionConfig,
}

impl CandleBuffer {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            buffers: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// Replace the buffer contents for `key` with a historical window.
    ///
    /// Candles arriving out of order or duplicated are dropped; the ring is
    /// trimmed to the retention cap from the oldest end.
    pub fn preload(&self, key: SeriesKey, candles: Vec<Candle>) {
        let cap = self.retention.for_timeframe(key.timeframe);
        let align = key.timeframe.duration_ms();

        let mut ring: VecDeque<Candle> = VecDeque::with_capacity(cap);
        for candle in candles {
            if candle.open_time % align != 0 {
                warn!(key = %key, open_time = candle.open_time, "dropping misaligned candle");
                continue;
            }
            if let Some(last) = ring.back() {
                if candle.open_time <= last.open_time {
                    continue;
                }
            }
            ring.push_back(candle);
            while ring.len() > cap {
                ring.pop_front();
            }
        }

        debug!(key = %key, count = ring.len(), "candle buffer preloaded");
        self.buffers.write().insert(key, ring);
    }

    /// Idempotent append of a closed candle.
    ///
    /// Duplicates (same open time) and stale items (earlier open time) are
    /// dropped. Returns `true` when the candle was admitted.
    pub fn append(&self, key: SeriesKey, candle: Candle) -> bool {
        let cap = self.retention.for_timeframe(key.timeframe);

        if candle.open_time % key.timeframe.duration_ms() != 0 {
            warn!(key = %key, open_time = candle.open_time, "rejecting misaligned candle");
            return false;
        }

        let mut map = self.buffers.write();
        let ring = map.entry(key).or_insert_with(|| VecDeque::with_capacity(cap + 1));

        if let Some(last) = ring.back() {
            if candle.open_time <= last.open_time {
                return false;
            }
        }

        ring.push_back(candle);
        while ring.len() > cap {
            ring.pop_front();
        }
        true
    }

    /// Return a consistent read-only copy of the series (oldest first).
    pub fn snapshot(&self, key: &SeriesKey) -> Vec<Candle> {
        let map = self.buffers.read();
        map.get(key)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Close price of the most recent candle, if any.
    pub fn last_close(&self, key: &SeriesKey) -> Option<f64> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| ring.back().map(|c| c.close))
    }

    /// Open time of the most recent candle, if any. Used by the periodic
    /// refresh task to decide whether a fetched candle is new.
    pub fn last_open_time(&self, key: &SeriesKey) -> Option<i64> {
        let map = self.buffers.read();
        map.get(key).and_then(|ring| ring.back().map(|c| c.open_time))
    }

    /// Number of candles stored for `key`.
    pub fn len(&self, key: &SeriesKey) -> usize {
        let map = self.buffers.read();
        map.get(key).map_or(0, VecDeque::len)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_candle(open_time: i64, close: f64) -> Candle {
        Candle::new(
            open_time,
            close,
            close + 1.0,
            close - 1.0,
            close,
            100.0,
            open_time + 59_999,
        )
    }

    fn make_key(sym: &str, tf: Timeframe) -> SeriesKey {
        SeriesKey::new(sym, tf)
    }

    fn small_retention() -> RetentionConfig {
        RetentionConfig {
            candles_1m: 3,
            candles_15m: 3,
            candles_1h: 3,
            candles_6h: 3,
            candles_1d: 3,
            ticker: 10,
        }
    }

    #[test]
    fn ring_buffer_trimming() {
        let buf = CandleBuffer::new(small_retention());
        let key = make_key("BTCUSDT", Timeframe::M1);

        for i in 0..5 {
            assert!(buf.append(key.clone(), sample_candle(i * 60_000, 100.0 + i as f64)));
        }

        assert_eq!(buf.len(&key), 3);
        let closes: Vec<f64> = buf.snapshot(&key).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![102.0, 103.0, 104.0]);
    }

    #[test]
    fn append_is_idempotent_by_timestamp() {
        let buf = CandleBuffer::new(RetentionConfig::default());
        let key = make_key("ETHUSDT", Timeframe::M1);

        assert!(buf.append(key.clone(), sample_candle(60_000, 50.0)));
        // Same open_time -- duplicate, dropped.
        assert!(!buf.append(key.clone(), sample_candle(60_000, 51.0)));
        // Earlier open_time -- stale, dropped.
        assert!(!buf.append(key.clone(), sample_candle(0, 49.0)));

        assert_eq!(buf.len(&key), 1);
        assert_eq!(buf.last_close(&key), Some(50.0));
    }

    #[test]
    fn misaligned_candle_rejected() {
        let buf = CandleBuffer::new(RetentionConfig::default());
        let key = make_key("BTCUSDT", Timeframe::H1);
        // 1h candles must open on the hour boundary.
        assert!(!buf.append(key.clone(), sample_candle(60_000, 100.0)));
        assert!(buf.append(key.clone(), sample_candle(3_600_000, 100.0)));
    }

    #[test]
    fn preload_replaces_contents() {
        let buf = CandleBuffer::new(RetentionConfig::default());
        let key = make_key("BTCUSDT", Timeframe::M1);

        buf.append(key.clone(), sample_candle(0, 1.0));
        buf.preload(
            key.clone(),
            vec![sample_candle(60_000, 2.0), sample_candle(120_000, 3.0)],
        );

        let closes: Vec<f64> = buf.snapshot(&key).iter().map(|c| c.close).collect();
        assert_eq!(closes, vec![2.0, 3.0]);
    }

    #[test]
    fn preload_drops_out_of_order_rows() {
        let buf = CandleBuffer::new(RetentionConfig::default());
        let key = make_key("BTCUSDT", Timeframe::M1);

        buf.preload(
            key.clone(),
            vec![
                sample_candle(120_000, 2.0),
                sample_candle(60_000, 1.0), // out of order
                sample_candle(180_000, 3.0),
            ],
        );

        let times: Vec<i64> = buf.snapshot(&key).iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![120_000, 180_000]);
    }

    #[test]
    fn snapshot_of_missing_key_is_empty() {
        let buf = CandleBuffer::new(RetentionConfig::default());
        let key = make_key("XYZUSDT", Timeframe::D1);
        assert!(buf.snapshot(&key).is_empty());
        assert_eq!(buf.last_close(&key), None);
    }

    #[test]
    fn timeframe_strings_roundtrip() {
        for tf in Timeframe::ALL {
            let json = serde_json::to_string(&tf).unwrap();
            assert_eq!(json, format!("\"{}\"", tf.as_str()));
            let back: Timeframe = serde_json::from_str(&json).unwrap();
            assert_eq!(back, tf);
        }
    }

    #[test]
    fn preload_horizons_cover_indicator_floors() {
        assert!(Timeframe::M1.preload_horizon() >= 60);
        assert!(Timeframe::M15.preload_horizon() >= 100);
        assert!(Timeframe::H1.preload_horizon() >= 72);
        assert!(Timeframe::H6.preload_horizon() >= 100);
        assert!(Timeframe::D1.preload_horizon() >= 60);
    }
}
