//! XP Batch Accumulator
//!
//! Merges per-user XP increments into one queue entry per user per flush
//! window. Merging is additive, so the order increments arrive in never
//! changes the flushed result, and queue length is bounded by the number of
//! distinct active users rather than message volume.

use indexmap::IndexMap;
use parking_lot::Mutex;
use rally_core::{UserKey, XpReason};

/// Pending increments for one user
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BatchQueueEntry {
    pub key: UserKey,

    /// Sum of merged XP increments
    pub xp_delta: u64,

    /// Messages merged into this entry
    pub message_delta: u64,

    /// Successful invites merged into this entry
    pub invite_delta: u64,

    pub reason: XpReason,

    /// Failed flush attempts so far
    pub attempts: u32,
}

impl BatchQueueEntry {
    fn new(key: UserKey, xp: u64, reason: XpReason) -> Self {
        let mut entry = Self {
            key,
            xp_delta: 0,
            message_delta: 0,
            invite_delta: 0,
            reason,
            attempts: 0,
        };
        entry.add(xp, reason);
        entry
    }

    fn add(&mut self, xp: u64, reason: XpReason) {
        self.xp_delta = self.xp_delta.saturating_add(xp);
        match reason {
            XpReason::Message => self.message_delta += 1,
            XpReason::Invite => self.invite_delta += 1,
            XpReason::Mixed => {}
        }
        self.reason = self.reason.merge(reason);
    }

    fn merge(&mut self, other: BatchQueueEntry) {
        self.xp_delta = self.xp_delta.saturating_add(other.xp_delta);
        self.message_delta += other.message_delta;
        self.invite_delta += other.invite_delta;
        self.reason = self.reason.merge(other.reason);
        self.attempts = self.attempts.max(other.attempts);
    }
}

/// Outcome of re-queueing a failed batch
#[derive(Debug, Default)]
pub struct Requeued {
    pub requeued: usize,
    /// Entries past the retry cap
    pub dropped: Vec<BatchQueueEntry>,
}

/// Summary of one flush
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Entries taken from the queue
    pub drained: usize,
    /// Rows committed to storage
    pub committed: usize,
    /// Entries merged back for the next flush
    pub requeued: usize,
    /// Entries discarded after a failure
    pub dropped: usize,
    /// Level-up notifications emitted
    pub level_ups: usize,
    /// The storage call failed
    pub failed: bool,
}

/// Per-user XP queue with size-triggered flushing
pub struct XpBatchAccumulator {
    batch_size: usize,
    queue: Mutex<IndexMap<UserKey, BatchQueueEntry>>,
}

impl XpBatchAccumulator {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
            queue: Mutex::new(IndexMap::new()),
        }
    }

    /// Queue `xp` for `key`, merging with any pending entry.
    ///
    /// Returns `true` once the queue holds `batch_size` users and should be
    /// flushed now.
    pub fn add(&self, key: &UserKey, xp: u64, reason: XpReason) -> bool {
        let mut queue = self.queue.lock();
        match queue.get_mut(key) {
            Some(entry) => entry.add(xp, reason),
            None => {
                queue.insert(key.clone(), BatchQueueEntry::new(key.clone(), xp, reason));
            }
        }
        queue.len() >= self.batch_size
    }

    /// Take every pending entry, leaving an empty queue behind.
    ///
    /// Increments added after this call land in the next batch.
    pub fn drain(&self) -> Vec<BatchQueueEntry> {
        let drained = std::mem::take(&mut *self.queue.lock());
        drained.into_values().collect()
    }

    /// Merge failed entries back, bumping their attempt count. Entries that
    /// already failed `max_retries` times are returned as dropped.
    pub fn requeue(&self, entries: Vec<BatchQueueEntry>, max_retries: u32) -> Requeued {
        let mut outcome = Requeued::default();
        let mut queue = self.queue.lock();

        for mut entry in entries {
            entry.attempts += 1;
            if entry.attempts > max_retries {
                outcome.dropped.push(entry);
                continue;
            }
            outcome.requeued += 1;
            merge_into(&mut queue, entry);
        }

        outcome
    }

    /// Merge entries back without spending an attempt
    pub fn restore(&self, entries: Vec<BatchQueueEntry>) -> usize {
        let mut queue = self.queue.lock();
        let count = entries.len();
        for entry in entries {
            merge_into(&mut queue, entry);
        }
        count
    }

    /// Pending entry of one user
    pub fn pending(&self, key: &UserKey) -> Option<BatchQueueEntry> {
        self.queue.lock().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }
}

fn merge_into(queue: &mut IndexMap<UserKey, BatchQueueEntry>, entry: BatchQueueEntry) {
    match queue.get_mut(&entry.key) {
        Some(existing) => existing.merge(entry),
        None => {
            queue.insert(entry.key.clone(), entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rally_core::Platform;

    fn key(id: &str) -> UserKey {
        UserKey::new(Platform::Telegram, id)
    }

    #[test]
    fn test_merge_per_user() {
        let acc = XpBatchAccumulator::new(50);
        acc.add(&key("a"), 1, XpReason::Message);
        acc.add(&key("a"), 1, XpReason::Message);
        acc.add(&key("b"), 1, XpReason::Message);
        acc.add(&key("a"), 50, XpReason::Invite);

        assert_eq!(acc.len(), 2);
        let a = acc.pending(&key("a")).unwrap();
        assert_eq!(a.xp_delta, 52);
        assert_eq!(a.message_delta, 2);
        assert_eq!(a.invite_delta, 1);
        assert_eq!(a.reason, XpReason::Mixed);
    }

    #[test]
    fn test_size_trigger() {
        let acc = XpBatchAccumulator::new(3);
        assert!(!acc.add(&key("a"), 1, XpReason::Message));
        assert!(!acc.add(&key("b"), 1, XpReason::Message));
        // Same user again does not grow the queue
        assert!(!acc.add(&key("b"), 1, XpReason::Message));
        assert!(acc.add(&key("c"), 1, XpReason::Message));
    }

    #[test]
    fn test_drain_is_atomic_swap() {
        let acc = XpBatchAccumulator::new(50);
        acc.add(&key("a"), 2, XpReason::Message);

        let drained = acc.drain();
        assert_eq!(drained.len(), 1);
        assert!(acc.is_empty());

        // Arrives mid-flush, goes to the next batch
        acc.add(&key("a"), 1, XpReason::Message);
        assert_eq!(acc.pending(&key("a")).unwrap().xp_delta, 1);
    }

    #[test]
    fn test_requeue_merges_and_caps() {
        let acc = XpBatchAccumulator::new(50);
        acc.add(&key("a"), 5, XpReason::Message);
        let drained = acc.drain();

        acc.add(&key("a"), 1, XpReason::Message);
        let outcome = acc.requeue(drained, 1);
        assert_eq!(outcome.requeued, 1);
        let merged = acc.pending(&key("a")).unwrap();
        assert_eq!(merged.xp_delta, 6);
        assert_eq!(merged.attempts, 1);

        // Second failure exceeds max_retries = 1
        let outcome = acc.requeue(acc.drain(), 1);
        assert_eq!(outcome.requeued, 0);
        assert_eq!(outcome.dropped.len(), 1);
        assert_eq!(outcome.dropped[0].xp_delta, 6);
        assert!(acc.is_empty());
    }

    #[test]
    fn test_restore_keeps_attempts() {
        let acc = XpBatchAccumulator::new(50);
        acc.add(&key("a"), 3, XpReason::Message);
        let drained = acc.drain();

        assert_eq!(acc.restore(drained), 1);
        let entry = acc.pending(&key("a")).unwrap();
        assert_eq!(entry.xp_delta, 3);
        assert_eq!(entry.attempts, 0);
    }

    proptest! {
        #[test]
        fn merge_is_order_independent(
            increments in proptest::collection::vec((0usize..4, 1u64..100), 1..40),
            seed in any::<u64>(),
        ) {
            let users = ["a", "b", "c", "d"];

            let forward = XpBatchAccumulator::new(1000);
            for (u, xp) in &increments {
                forward.add(&key(users[*u]), *xp, XpReason::Message);
            }

            // Deterministic permutation of the same increments
            let mut shuffled = increments.clone();
            let len = shuffled.len();
            for i in 0..len {
                let j = ((seed.wrapping_mul(i as u64 + 1)) % len as u64) as usize;
                shuffled.swap(i, j);
            }
            let permuted = XpBatchAccumulator::new(1000);
            for (u, xp) in &shuffled {
                permuted.add(&key(users[*u]), *xp, XpReason::Message);
            }

            for user in users {
                let expected: u64 = increments
                    .iter()
                    .filter(|(u, _)| users[*u] == user)
                    .map(|(_, xp)| xp)
                    .sum();
                let a = forward.pending(&key(user)).map(|e| e.xp_delta).unwrap_or(0);
                let b = permuted.pending(&key(user)).map(|e| e.xp_delta).unwrap_or(0);
                prop_assert_eq!(a, expected);
                prop_assert_eq!(b, expected);
            }
        }
    }
}
