// =============================================================================
// Rate-Limit Tracker — monitors Binance futures API usage
// =============================================================================
//
// USDⓈ-M futures limits:
//   - Request weight: 2400 per minute.
//   - Order rate:     300 per 10 seconds and 1200 per minute.
//
// The tracker reads the `X-MBX-USED-WEIGHT-1M` and `X-MBX-ORDER-COUNT-*`
// response headers after every request and keeps atomic counters that any
// task may read lock-free.
// =============================================================================

use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Weight allowance per minute.
const WEIGHT_LIMIT_1M: u32 = 2400;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 1800;

/// Maximum orders per minute.
const ORDER_1M_LIMIT: u32 = 1200;
/// Order count at which we start warning.
const ORDER_1M_WARN_THRESHOLD: u32 = 1000;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    order_count_1m: AtomicU32,
}

/// Point-in-time copy of the counters, included in the periodic status line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_10s: u32,
    pub order_count_1m: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            order_count_1m: AtomicU32::new(0),
        }
    }

    /// Update the counters from the headers of a futures REST response.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(w) = header_u32(headers, "X-MBX-USED-WEIGHT-1M") {
            let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
            if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                warn!(
                    used_weight = w,
                    limit = WEIGHT_LIMIT_1M,
                    "rate-limit weight crossed warning threshold"
                );
            }
            debug!(used_weight_1m = w, "rate-limit weight updated from header");
        }

        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-10S") {
            self.order_count_10s.store(c, Ordering::Relaxed);
        }

        if let Some(c) = header_u32(headers, "X-MBX-ORDER-COUNT-1M") {
            let prev = self.order_count_1m.swap(c, Ordering::Relaxed);
            if c >= ORDER_1M_WARN_THRESHOLD && prev < ORDER_1M_WARN_THRESHOLD {
                warn!(
                    order_count_1m = c,
                    limit = ORDER_1M_LIMIT,
                    "order count crossed warning threshold"
                );
            }
        }
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            order_count_1m: self.order_count_1m.load(Ordering::Relaxed),
        }
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
            .field("order_count_1m", &self.order_count_1m.load(Ordering::Relaxed))
            .finish()
    }
}

fn header_u32(headers: &reqwest::header::HeaderMap, name: &str) -> Option<u32> {
    headers.get(name)?.to_str().ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn reads_weight_and_order_counts() {
        let tracker = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("37"));
        headers.insert("X-MBX-ORDER-COUNT-10S", HeaderValue::from_static("2"));
        headers.insert("X-MBX-ORDER-COUNT-1M", HeaderValue::from_static("9"));
        tracker.update_from_headers(&headers);

        assert_eq!(
            tracker.snapshot(),
            RateLimitSnapshot {
                used_weight_1m: 37,
                order_count_10s: 2,
                order_count_1m: 9,
            }
        );
    }

    #[test]
    fn ignores_garbage_headers() {
        let tracker = RateLimitTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("lots"));
        tracker.update_from_headers(&headers);
        assert_eq!(tracker.snapshot(), RateLimitSnapshot::default());
    }
}
