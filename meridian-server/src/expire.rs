//! Per-(key,id) expiration bookkeeping.
//!
//! The authoritative store is the `(key, id) -> deadline` map; `sample`
//! is a flat vector the background evictor draws random indexes from.
//! Cleared or re-assigned entries leave stale rows in the sample vector,
//! which drop out naturally when sampled (the map no longer agrees).

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Default)]
pub struct ExpireIndex {
    map: HashMap<(String, String), Instant>,
    sample: Vec<(String, String, Instant)>,
}

impl ExpireIndex {
    /// Mark `(key, id)` to expire at `at`, replacing any prior deadline.
    pub fn expire_at(&mut self, key: &str, id: &str, at: Instant) {
        self.map.insert((key.to_string(), id.to_string()), at);
        self.sample.push((key.to_string(), id.to_string(), at));
    }

    /// Clear a single expiration. Returns whether one existed.
    pub fn clear(&mut self, key: &str, id: &str) -> bool {
        self.map
            .remove(&(key.to_string(), id.to_string()))
            .is_some()
    }

    /// Clear every expiration under `key`.
    pub fn clear_key(&mut self, key: &str) {
        self.map.retain(|(k, _), _| k != key);
    }

    pub fn clear_all(&mut self) {
        self.map.clear();
        self.sample.clear();
    }

    /// Deadline for `(key, id)`, if set.
    pub fn get(&self, key: &str, id: &str) -> Option<Instant> {
        self.map.get(&(key.to_string(), id.to_string())).copied()
    }

    /// Whether `(key, id)` has a deadline in the past.
    pub fn has_expired(&self, key: &str, id: &str, now: Instant) -> bool {
        match self.get(key, id) {
            Some(at) => now >= at,
            None => false,
        }
    }

    /// Seconds until expiry: `None` when no deadline is set.
    pub fn ttl(&self, key: &str, id: &str, now: Instant) -> Option<Duration> {
        self.get(key, id)
            .map(|at| at.saturating_duration_since(now))
    }

    pub fn sample_len(&self) -> usize {
        self.sample.len()
    }

    /// Draw the sample at `idx`; used by the background evictor.
    pub fn sample_at(&self, idx: usize) -> Option<&(String, String, Instant)> {
        self.sample.get(idx)
    }

    /// Drop the sample row at `idx` (swap-remove; order is irrelevant).
    pub fn remove_sample(&mut self, idx: usize) {
        if idx < self.sample.len() {
            self.sample.swap_remove(idx);
        }
    }

    /// The sample row still agrees with the authoritative map.
    pub fn sample_is_current(&self, idx: usize) -> bool {
        match self.sample.get(idx) {
            Some((key, id, at)) => self.get(key, id) == Some(*at),
            None => false,
        }
    }
}
