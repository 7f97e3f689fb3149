// =============================================================================
// Ticker Buffer — rolling per-symbol store of ticker ticks
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// A single ticker update from the venue's rolling-stats stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickerTick {
    /// Event time in epoch milliseconds.
    pub event_time_ms: i64,
    pub last_price: f64,
    pub best_bid: f64,
    pub best_bid_qty: f64,
    pub best_ask: f64,
    pub best_ask_qty: f64,
    /// Rolling 24 h base-asset volume.
    pub volume_24h: f64,
}

/// Per-symbol ring of the most recent ticker ticks. Event times are monotone
/// non-decreasing; out-of-order ticks are dropped.
pub struct TickerBuffer {
    ticks: RwLock<HashMap<String, VecDeque<TickerTick>>>,
    cap: usize,
}

impl TickerBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            ticks: RwLock::new(HashMap::new()),
            cap,
        }
    }

    /// Append a tick. Returns `false` when the tick is older than the latest
    /// stored one (stale delivery after a reconnect).
    pub fn append(&self, symbol: &str, tick: TickerTick) -> bool {
        let mut map = self.ticks.write();
        let ring = map
            .entry(symbol.to_string())
            .or_insert_with(|| VecDeque::with_capacity(self.cap + 1));

        if let Some(last) = ring.back() {
            if tick.event_time_ms < last.event_time_ms {
                return false;
            }
        }

        ring.push_back(tick);
        while ring.len() > self.cap {
            ring.pop_front();
        }
        true
    }

    /// Most recent tick for `symbol`.
    pub fn latest(&self, symbol: &str) -> Option<TickerTick> {
        let map = self.ticks.read();
        map.get(symbol).and_then(|ring| ring.back().cloned())
    }

    /// Consistent read-only copy (oldest first).
    pub fn snapshot(&self, symbol: &str) -> Vec<TickerTick> {
        let map = self.ticks.read();
        map.get(symbol)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self, symbol: &str) -> usize {
        let map = self.ticks.read();
        map.get(symbol).map_or(0, VecDeque::len)
    }
}
