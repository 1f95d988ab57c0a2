//! Monthly allowance for unauthenticated visitors.
//!
//! This is a courtesy limiter, not an enforcement boundary: the device key is
//! chosen by the client and a visitor can always present a fresh one. Nothing
//! revenue-relevant may depend on it, and authenticated entitlements never
//! go through here.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::month::YearMonth;

#[derive(Debug)]
pub struct GuestAllowance {
    cap: u32,
    buckets: Mutex<HashMap<(String, YearMonth), u32>>,
}

impl GuestAllowance {
    pub fn new(cap: u32) -> Self {
        Self {
            cap,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn cap(&self) -> u32 {
        self.cap
    }

    pub fn consume(&self, device: &str) -> bool {
        self.consume_in(device, YearMonth::current())
    }

    pub fn count_in(&self, device: &str, month: YearMonth) -> u32 {
        self.buckets
            .lock()
            .get(&(device.to_string(), month))
            .copied()
            .unwrap_or(0)
    }

    /// Counts one use if the month's bucket is below the cap.
    pub fn consume_in(&self, device: &str, month: YearMonth) -> bool {
        let mut buckets = self.buckets.lock();
        // buckets from earlier months can never be read again
        buckets.retain(|(_, bucket_month), _| *bucket_month >= month);

        let count = buckets.entry((device.to_string(), month)).or_insert(0);
        if *count >= self.cap {
            return false;
        }
        *count += 1;
        true
    }
}
