use std::{
    collections::{HashMap, VecDeque},
    time::{Duration, Instant},
};

use parking_lot::Mutex;

/// Sliding-window request counter keyed by client identity.
#[derive(Debug)]
pub struct InMemoryRateLimiter {
    window: Duration,
    max_requests: usize,
    buckets: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl InMemoryRateLimiter {
    pub fn new(window: Duration, max_requests: usize) -> Self {
        Self {
            window,
            max_requests,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Counts the request, or returns how long until the oldest one leaves the window.
    pub fn check(&self, key: &str) -> Result<(), Duration> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &str, now: Instant) -> Result<(), Duration> {
        let cutoff = now.checked_sub(self.window).unwrap_or(now);

        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(key.to_string()).or_default();
        while bucket.front().is_some_and(|front| *front < cutoff) {
            bucket.pop_front();
        }

        if bucket.len() >= self.max_requests {
            let retry_after = bucket
                .front()
                .map(|oldest| (*oldest + self.window).saturating_duration_since(now))
                .unwrap_or(self.window);
            return Err(retry_after);
        }

        bucket.push_back(now);
        if buckets.len() > 10_000 {
            buckets.retain(|_, bucket| bucket.back().is_some_and(|last| *last >= cutoff));
        }
        Ok(())
    }
}
