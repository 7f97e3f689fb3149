// =============================================================================
// Rate-Limit Tracker — monitors venue API usage to avoid 429s
// =============================================================================
//
// The venue enforces a request-weight budget per minute and an order rate per
// 10-second window. The tracker reads the `X-MBX-USED-WEIGHT-1M` /
// `X-MBX-ORDER-COUNT-10S` response headers after every request and keeps
// atomic counters that any task may query lock-free. Header values overwrite
// the counters, so they self-correct as windows roll over.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

/// Hard ceiling at which the client refuses to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;
/// Maximum orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 10;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
        }
    }

    /// Update counters from the venue's response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(w) = header_u32(headers, "X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
            if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(
                    used_weight = w,
                    hard_limit = WEIGHT_HARD_LIMIT,
                    "request weight crossed warning threshold"
                );
            }
            debug!(used_weight_1m = w, "request weight updated from header");
        }

        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-10S") {
            self.order_count_10s.store(c, Ordering::Relaxed);
        }
    }

    /// Whether `weight` more request weight fits under the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                "request deferred — would exceed weight limit"
            );
        }
        allowed
    }

    /// Whether another order fits in the 10-second window.
    pub fn can_place_order(&self) -> bool {
        let count = self.order_count_10s.load(Ordering::Relaxed);
        if count >= ORDER_10S_LIMIT {
            warn!(count, limit = ORDER_10S_LIMIT, "order deferred — 10s order limit reached");
            return false;
        }
        true
    }

    /// Bump the order counter locally before the venue's headers confirm it.
    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight_1m.load(Ordering::Relaxed))
            .field("order_count_10s", &self.order_count_10s.load(Ordering::Relaxed))
            .finish()
    }
}

fn header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse().ok())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn fresh_tracker_allows_everything() {
        let tracker = RateLimitTracker::new();
        assert!(tracker.can_send_request(10));
        assert!(tracker.can_place_order());
    }

    #[test]
    fn header_updates_gate_requests() {
        let tracker = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("995"));
        tracker.update_from_headers(&headers);

        assert!(tracker.can_send_request(5));
        assert!(!tracker.can_send_request(6));
    }

    #[test]
    fn order_window_gates_placements() {
        let tracker = RateLimitTracker::new();
        for _ in 0..10 {
            assert!(tracker.can_place_order());
            tracker.record_order_sent();
        }
        assert!(!tracker.can_place_order());

        // Window rollover arrives via headers.
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-ORDER-COUNT-10S", HeaderValue::from_static("0"));
        tracker.update_from_headers(&headers);
        assert!(tracker.can_place_order());
    }

    #[test]
    fn garbage_headers_ignored() {
        let tracker = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("not-a-number"));
        tracker.update_from_headers(&headers);
        assert!(tracker.can_send_request(WEIGHT_HARD_LIMIT));
    }
}
