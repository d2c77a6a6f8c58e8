//! Per-key exponential back-off: `initial * 2^(failures - 1)`, capped.

use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use rustc_hash::FxHashMap;

pub struct Backoff<K> {
    initial: Duration,
    max: Duration,
    failures: Mutex<FxHashMap<K, u32>>,
}

impl<K: Eq + Hash + Clone> Backoff<K> {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max: max.max(initial), failures: Mutex::new(FxHashMap::default()) }
    }

    /// Delay before retry number `failures` (1-based).
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.initial.checked_mul(1u32 << exp).map(|d| d.min(self.max)).unwrap_or(self.max)
    }

    /// Records a failure of `key`; returns the delay to wait and the
    /// number of consecutive failures so far.
    pub fn fail(&self, key: &K) -> (Duration, u32) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        let n = failures.entry(key.clone()).or_insert(0);
        *n = n.saturating_add(1);
        let n = *n;
        (self.delay_for(n), n)
    }

    pub fn reset(&self, key: &K) {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).remove(key);
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner).get(key).copied().unwrap_or(0)
    }
}
