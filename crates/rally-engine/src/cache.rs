//! User State Cache
//!
//! Bounded, idle-evicted cache of each user's last committed XP row and
//! link status, plus the optimistic delta queued since the last flush.
//!
//! ## LRU eviction
//!
//! Entries live in an `IndexMap` ordered by last access; a hit moves the
//! entry to the back, and on overflow the front entry is evicted. Eviction
//! never loses XP: the uncommitted delta also lives in the batch
//! accumulator, the cache copy is only for reads.

use indexmap::IndexMap;
use parking_lot::Mutex;
use rally_core::{UserActivity, UserKey, UserLookup};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Cached state of one user
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: UserKey,

    /// User linked their account
    pub is_connected: bool,

    /// Last committed row (authoritative after a successful flush)
    pub snapshot: UserActivity,

    /// XP queued since the snapshot
    pub pending_xp: u64,

    /// Messages queued since the snapshot
    pub pending_messages: u64,

    pub last_touched: Instant,
}

impl CacheEntry {
    pub fn xp_snapshot(&self) -> u64 {
        self.snapshot.total_xp
    }

    /// XP including queued increments, what the user should see
    pub fn visible_xp(&self) -> u64 {
        self.snapshot.total_xp.saturating_add(self.pending_xp)
    }
}

/// Hit/miss counters
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

/// Read-through, write-back user state cache
pub struct UserStateCache {
    max_entries: usize,
    idle_ttl: Duration,
    entries: Mutex<IndexMap<UserKey, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl UserStateCache {
    pub fn new(max_entries: usize, idle_ttl: Duration) -> Self {
        Self {
            max_entries: max_entries.max(1),
            idle_ttl,
            entries: Mutex::new(IndexMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Cached entry, refreshed as most recently used. `None` is a miss,
    /// the caller reads through to storage.
    pub fn get(&self, key: &UserKey, now: Instant) -> Option<CacheEntry> {
        let mut entries = self.entries.lock();

        let Some(index) = entries.get_index_of(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        let idle = entries
            .get_index(index)
            .map(|(_, e)| now.saturating_duration_since(e.last_touched) >= self.idle_ttl)
            .unwrap_or(true);
        if idle {
            entries.shift_remove_index(index);
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let last = entries.len() - 1;
        entries.move_index(index, last);
        self.hits.fetch_add(1, Ordering::Relaxed);
        entries.get_index_mut(last).map(|(_, entry)| {
            entry.last_touched = now;
            entry.clone()
        })
    }

    /// Populate from a storage read. An entry that appeared meanwhile keeps
    /// its pending delta.
    pub fn insert(&self, key: UserKey, lookup: UserLookup, now: Instant) -> CacheEntry {
        let mut entries = self.entries.lock();

        let snapshot = lookup
            .activity
            .unwrap_or_else(|| UserActivity::empty(&key, chrono::Utc::now()));

        if let Some(existing) = entries.get_mut(&key) {
            existing.is_connected = lookup.linked;
            existing.last_touched = now;
            return existing.clone();
        }

        while entries.len() >= self.max_entries {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(user = %evicted, "Evicted least recently used cache entry");
            }
        }

        let entry = CacheEntry {
            key: key.clone(),
            is_connected: lookup.linked,
            snapshot,
            pending_xp: 0,
            pending_messages: 0,
            last_touched: now,
        };
        entries.insert(key, entry.clone());
        entry
    }

    /// Record an optimistic increment ahead of the flush. Returns `false` if
    /// the user is not cached (the accumulator still holds the delta).
    pub fn apply_delta(&self, key: &UserKey, xp: u64, messages: u64, now: Instant) -> bool {
        match self.entries.lock().get_mut(key) {
            Some(entry) => {
                entry.pending_xp = entry.pending_xp.saturating_add(xp);
                entry.pending_messages = entry.pending_messages.saturating_add(messages);
                entry.last_touched = now;
                true
            }
            None => false,
        }
    }

    /// A flush committed `row`; the flushed part of the pending delta becomes
    /// part of the snapshot. Increments queued after the drain stay pending.
    pub fn commit(&self, row: &UserActivity, flushed_xp: u64, flushed_messages: u64) {
        let key = row.key();
        if let Some(entry) = self.entries.lock().get_mut(&key) {
            entry.snapshot = row.clone();
            entry.pending_xp = entry.pending_xp.saturating_sub(flushed_xp);
            entry.pending_messages = entry.pending_messages.saturating_sub(flushed_messages);
        }
    }

    /// Undo an optimistic increment whose batch entry was dropped
    pub fn rollback(&self, key: &UserKey, xp: u64, messages: u64) {
        if let Some(entry) = self.entries.lock().get_mut(key) {
            entry.pending_xp = entry.pending_xp.saturating_sub(xp);
            entry.pending_messages = entry.pending_messages.saturating_sub(messages);
        }
    }

    /// Committed snapshot without touching LRU order or counters
    pub fn peek_snapshot(&self, key: &UserKey) -> Option<UserActivity> {
        self.entries.lock().get(key).map(|e| e.snapshot.clone())
    }

    /// Drop entries idle past the TTL
    pub fn evict_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| now.saturating_duration_since(e.last_touched) < self.idle_ttl);
        let evicted = before - entries.len();
        self.evictions.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_core::Platform;

    fn key(id: &str) -> UserKey {
        UserKey::new(Platform::Discord, id)
    }

    fn linked_with_xp(id: &str, xp: u64) -> UserLookup {
        let mut row = UserActivity::empty(&key(id), chrono::Utc::now());
        row.total_xp = xp;
        UserLookup {
            linked: true,
            activity: Some(row),
        }
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = UserStateCache::new(10, Duration::from_secs(600));
        let now = Instant::now();

        assert!(cache.get(&key("a"), now).is_none());
        cache.insert(key("a"), linked_with_xp("a", 40), now);

        let entry = cache.get(&key("a"), now).unwrap();
        assert_eq!(entry.xp_snapshot(), 40);
        assert!(entry.is_connected);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, evictions: 0 });
    }

    #[test]
    fn test_pending_delta_visible_until_commit() {
        let cache = UserStateCache::new(10, Duration::from_secs(600));
        let now = Instant::now();
        cache.insert(key("a"), linked_with_xp("a", 100), now);

        cache.apply_delta(&key("a"), 3, 3, now);
        assert_eq!(cache.get(&key("a"), now).unwrap().visible_xp(), 103);

        // A further increment lands after the drain of the first two
        cache.apply_delta(&key("a"), 1, 1, now);

        let mut row = UserActivity::empty(&key("a"), chrono::Utc::now());
        row.total_xp = 103;
        cache.commit(&row, 3, 3);

        let entry = cache.get(&key("a"), now).unwrap();
        assert_eq!(entry.xp_snapshot(), 103);
        assert_eq!(entry.pending_xp, 1);
        assert_eq!(entry.visible_xp(), 104);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = UserStateCache::new(2, Duration::from_secs(600));
        let now = Instant::now();

        cache.insert(key("a"), linked_with_xp("a", 1), now);
        cache.insert(key("b"), linked_with_xp("b", 2), now);

        // Touch "a" so "b" becomes least recently used
        cache.get(&key("a"), now);
        cache.insert(key("c"), linked_with_xp("c", 3), now);

        assert_eq!(cache.len(), 2);
        assert!(cache.peek_snapshot(&key("b")).is_none());
        assert!(cache.peek_snapshot(&key("a")).is_some());
        assert!(cache.peek_snapshot(&key("c")).is_some());
    }

    #[test]
    fn test_idle_ttl() {
        let cache = UserStateCache::new(10, Duration::from_secs(600));
        let t0 = Instant::now();
        cache.insert(key("a"), linked_with_xp("a", 1), t0);
        cache.insert(key("b"), linked_with_xp("b", 1), t0 + Duration::from_secs(300));

        assert!(cache.get(&key("a"), t0 + Duration::from_secs(600)).is_none());
        assert_eq!(cache.evict_expired(t0 + Duration::from_secs(900)), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_rollback() {
        let cache = UserStateCache::new(10, Duration::from_secs(600));
        let now = Instant::now();
        cache.insert(key("a"), linked_with_xp("a", 10), now);
        cache.apply_delta(&key("a"), 5, 5, now);
        cache.rollback(&key("a"), 5, 5);
        assert_eq!(cache.get(&key("a"), now).unwrap().visible_xp(), 10);
    }
}
