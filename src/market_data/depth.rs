// =============================================================================
// Depth Buffer — latest order-book snapshot per symbol
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Top-of-book depth snapshot: up to 20 levels per side.
/// Bids are ordered descending by price, asks ascending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepthSnapshot {
    pub event_time_ms: i64,
    pub last_update_id: u64,
    /// (price, quantity) pairs, best bid first.
    pub bids: Vec<(f64, f64)>,
    /// (price, quantity) pairs, best ask first.
    pub asks: Vec<(f64, f64)>,
}

impl DepthSnapshot {
    pub fn best_bid(&self) -> Option<(f64, f64)> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<(f64, f64)> {
        self.asks.first().copied()
    }
}

/// Latest-only depth store per symbol. Partial-depth streams supersede
/// themselves, so only the newest snapshot is retained; updates with a
/// non-increasing `last_update_id` are dropped.
pub struct DepthBuffer {
    books: RwLock<HashMap<String, DepthSnapshot>>,
}

impl DepthBuffer {
    pub fn new() -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
        }
    }

    /// Store a new snapshot. Returns `false` when it is stale.
    pub fn update(&self, symbol: &str, snapshot: DepthSnapshot) -> bool {
        let mut map = self.books.write();
        if let Some(existing) = map.get(symbol) {
            if snapshot.last_update_id <= existing.last_update_id {
                return false;
            }
        }
        map.insert(symbol.to_string(), snapshot);
        true
    }

    /// Consistent read-only copy of the latest snapshot.
    pub fn snapshot(&self, symbol: &str) -> Option<DepthSnapshot> {
        self.books.read().get(symbol).cloned()
    }
}

impl Default for DepthBuffer {
    fn default() -> Self {
        Self::new()
    }
}
