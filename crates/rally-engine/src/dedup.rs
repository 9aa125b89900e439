//! Event Deduplication
//!
//! Bounded, time-expiring set of recently seen event keys
//! (`platform:userId:eventId`). Within the TTL a duplicate key is always
//! rejected; once a key expires a re-delivery counts as new.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Bounded TTL set of event keys
pub struct Deduplicator {
    /// Maximum remembered keys
    capacity: usize,

    /// Key lifetime
    ttl: Duration,

    /// Keys in insertion order (oldest first)
    seen: Mutex<IndexMap<String, Instant>>,
}

impl Deduplicator {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            seen: Mutex::new(IndexMap::with_capacity(capacity.min(8192))),
        }
    }

    /// Whether `key` was marked within the TTL window
    pub fn seen(&self, key: &str, now: Instant) -> bool {
        self.seen
            .lock()
            .get(key)
            .is_some_and(|marked| !self.expired(*marked, now))
    }

    /// Remember `key` as of `now`
    pub fn mark(&self, key: &str, now: Instant) {
        let mut seen = self.seen.lock();
        self.insert_locked(&mut seen, key, now);
    }

    /// Check and mark under a single lock.
    ///
    /// Returns `true` if the key is new (and is now marked), `false` for a
    /// duplicate.
    pub fn check_and_mark(&self, key: &str, now: Instant) -> bool {
        let mut seen = self.seen.lock();
        if let Some(marked) = seen.get(key) {
            if !self.expired(*marked, now) {
                return false;
            }
        }
        self.insert_locked(&mut seen, key, now);
        true
    }

    /// Drop expired keys, returning how many were removed
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut seen = self.seen.lock();
        let before = seen.len();
        seen.retain(|_, marked| !self.expired(*marked, now));
        before - seen.len()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().is_empty()
    }

    fn expired(&self, marked: Instant, now: Instant) -> bool {
        now.saturating_duration_since(marked) >= self.ttl
    }

    fn insert_locked(&self, seen: &mut IndexMap<String, Instant>, key: &str, now: Instant) {
        // Re-marking moves the key to the back so insertion order stays age order
        seen.shift_remove(key);
        while seen.len() >= self.capacity {
            seen.shift_remove_index(0);
        }
        seen.insert(key.to_string(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rejected_within_ttl() {
        let dedup = Deduplicator::new(100, Duration::from_secs(300));
        let t0 = Instant::now();

        assert!(dedup.check_and_mark("discord:1:a", t0));
        assert!(!dedup.check_and_mark("discord:1:a", t0 + Duration::from_secs(299)));
        assert!(dedup.seen("discord:1:a", t0 + Duration::from_secs(10)));

        // Other users/events are independent
        assert!(dedup.check_and_mark("discord:2:a", t0));
        assert!(dedup.check_and_mark("telegram:1:a", t0));
    }

    #[test]
    fn test_redelivery_after_ttl_is_new() {
        let dedup = Deduplicator::new(100, Duration::from_secs(300));
        let t0 = Instant::now();

        dedup.mark("discord:1:a", t0);
        assert!(!dedup.seen("discord:1:a", t0 + Duration::from_secs(300)));
        assert!(dedup.check_and_mark("discord:1:a", t0 + Duration::from_secs(301)));
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let dedup = Deduplicator::new(3, Duration::from_secs(300));
        let t0 = Instant::now();

        for (i, key) in ["a", "b", "c", "d"].iter().enumerate() {
            dedup.mark(key, t0 + Duration::from_millis(i as u64));
        }

        assert_eq!(dedup.len(), 3);
        assert!(!dedup.seen("a", t0));
        assert!(dedup.seen("d", t0));
    }

    #[test]
    fn test_purge_expired() {
        let dedup = Deduplicator::new(100, Duration::from_secs(60));
        let t0 = Instant::now();

        dedup.mark("old", t0);
        dedup.mark("new", t0 + Duration::from_secs(50));

        assert_eq!(dedup.purge_expired(t0 + Duration::from_secs(70)), 1);
        assert!(dedup.seen("new", t0 + Duration::from_secs(70)));
    }
}
