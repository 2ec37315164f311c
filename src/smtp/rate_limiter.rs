//! Sliding-window connection rate limiter keyed by normalized remote IP.
//!
//! Kept as an explicit service object (per the design's "process-wide
//! caches" note) rather than a bare static map, so its lifetime and locking
//! are visible at the call site instead of hidden behind a lazily
//! initialized global.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::domain::normalize_remote_ip;

/// Tracks connection timestamps per remote IP within a sliding window.
pub struct RateLimiter {
    window: Duration,
    max_connections: u32,
    hits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new(window: Duration, max_connections: u32) -> Self {
        RateLimiter {
            window,
            max_connections,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Records a connection attempt from `ip` and returns whether it should
    /// be admitted. Exactly `max_connections` hits within the window are
    /// still admitted; the next one is rejected.
    pub fn check(&self, ip: &str) -> bool {
        let key = normalize_remote_ip(ip);
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap();
        let entries = hits.entry(key).or_default();
        entries.retain(|t| now.duration_since(*t) <= self.window);

        if entries.len() as u32 >= self.max_connections {
            return false;
        }

        entries.push(now);
        true
    }
}
