//! Activity store collaborator
//!
//! The relational store that persists activity rows, invite codes and
//! attribution records. The engine only talks to it through
//! [`crate::gateway::PersistenceGateway`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rally_core::{
    InviteRecord, InviteReward, InvitedUserRecord, Platform, RallyError, StoreError, UserActivity,
    UserKey, UserLookup,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Storage operations used by the engine
#[async_trait]
pub trait ActivityStore: Send + Sync {
    /// Write whole rows; one call per flush
    async fn upsert_activity_batch(&self, rows: &[UserActivity]) -> Result<(), StoreError>;

    /// Link status and activity row of one user
    async fn read_activity(&self, key: &UserKey) -> Result<UserLookup, StoreError>;

    /// Persisted invite code, if any
    async fn lookup_invite_code(
        &self,
        platform: Platform,
        code: &str,
    ) -> Result<Option<InviteRecord>, StoreError>;

    async fn upsert_invite_record(&self, record: &InviteRecord) -> Result<(), StoreError>;

    /// Every attribution record of an arriving user, oldest first
    async fn read_invite_eligibility(
        &self,
        key: &UserKey,
    ) -> Result<Vec<InvitedUserRecord>, StoreError>;

    async fn upsert_invited_user(&self, record: &InvitedUserRecord) -> Result<(), StoreError>;

    /// Stamp `left_at` on the user's active attribution. Returns whether one existed.
    async fn mark_invited_user_left(
        &self,
        key: &UserKey,
        left_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn record_invite_reward(&self, reward: &InviteReward) -> Result<(), StoreError>;
}

/// On-disk form of [`MemoryStore`]
#[derive(Debug, Default, Serialize, Deserialize)]
struct Snapshot {
    activity: Vec<UserActivity>,
    linked: Vec<UserKey>,
    invites: Vec<InviteRecord>,
    invited: Vec<InvitedUserRecord>,
    rewards: Vec<InviteReward>,
}

/// In-memory store with optional JSON snapshots.
///
/// Supports failure injection for exercising the circuit breaker.
pub struct MemoryStore {
    activity: RwLock<HashMap<UserKey, UserActivity>>,
    linked: RwLock<HashSet<UserKey>>,
    invites: RwLock<HashMap<(Platform, String), InviteRecord>>,
    invited: RwLock<HashMap<UserKey, Vec<InvitedUserRecord>>>,
    rewards: RwLock<Vec<InviteReward>>,
    fail_next: AtomicU32,
    calls: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            activity: RwLock::new(HashMap::new()),
            linked: RwLock::new(HashSet::new()),
            invites: RwLock::new(HashMap::new()),
            invited: RwLock::new(HashMap::new()),
            rewards: RwLock::new(Vec::new()),
            fail_next: AtomicU32::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Load a snapshot written by [`MemoryStore::save_snapshot`], or start
    /// empty if the file does not exist yet
    pub fn open(path: &Path) -> Result<Self, RallyError> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "No store snapshot, starting empty");
            return Ok(Self::new());
        }

        let bytes = std::fs::read(path)?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
        let store = Self::new();

        {
            let mut activity = store.activity.write();
            for row in snapshot.activity {
                activity.insert(row.key(), row);
            }
        }
        store.linked.write().extend(snapshot.linked);
        {
            let mut invites = store.invites.write();
            for record in snapshot.invites {
                invites.insert((record.platform, record.invite_code.clone()), record);
            }
        }
        {
            let mut invited = store.invited.write();
            for record in snapshot.invited {
                let key = UserKey::new(record.platform, record.invited_user_id.clone());
                invited.entry(key).or_default().push(record);
            }
        }
        *store.rewards.write() = snapshot.rewards;

        tracing::info!(
            path = %path.display(),
            users = store.activity.read().len(),
            "Loaded store snapshot"
        );
        Ok(store)
    }

    /// Write the whole store as JSON, replacing the file atomically
    pub fn save_snapshot(&self, path: &Path) -> Result<(), RallyError> {
        let snapshot = Snapshot {
            activity: self.activity.read().values().cloned().collect(),
            linked: self.linked.read().iter().cloned().collect(),
            invites: self.invites.read().values().cloned().collect(),
            invited: self.invited.read().values().flatten().cloned().collect(),
            rewards: self.rewards.read().clone(),
        };

        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Mark a user as having linked their account
    pub fn link_user(&self, key: UserKey) {
        self.linked.write().insert(key);
    }

    /// Seed or overwrite an activity row
    pub fn put_activity(&self, row: UserActivity) {
        self.activity.write().insert(row.key(), row);
    }

    /// Make the next `n` calls fail with `StoreError::Unavailable`
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Calls that reached the store, failed ones included
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn activity(&self, key: &UserKey) -> Option<UserActivity> {
        self.activity.read().get(key).cloned()
    }

    pub fn invite_code(&self, platform: Platform, code: &str) -> Option<InviteRecord> {
        self.invites
            .read()
            .get(&(platform, code.to_string()))
            .cloned()
    }

    pub fn invited_records(&self, key: &UserKey) -> Vec<InvitedUserRecord> {
        self.invited.read().get(key).cloned().unwrap_or_default()
    }

    pub fn invite_rewards(&self) -> Vec<InviteReward> {
        self.rewards.read().clone()
    }

    fn enter(&self) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(StoreError::Unavailable("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ActivityStore for MemoryStore {
    async fn upsert_activity_batch(&self, rows: &[UserActivity]) -> Result<(), StoreError> {
        self.enter()?;
        let mut activity = self.activity.write();
        for row in rows {
            activity.insert(row.key(), row.clone());
        }
        Ok(())
    }

    async fn read_activity(&self, key: &UserKey) -> Result<UserLookup, StoreError> {
        self.enter()?;
        Ok(UserLookup {
            linked: self.linked.read().contains(key),
            activity: self.activity.read().get(key).cloned(),
        })
    }

    async fn lookup_invite_code(
        &self,
        platform: Platform,
        code: &str,
    ) -> Result<Option<InviteRecord>, StoreError> {
        self.enter()?;
        Ok(self.invite_code(platform, code))
    }

    async fn upsert_invite_record(&self, record: &InviteRecord) -> Result<(), StoreError> {
        self.enter()?;
        self.invites.write().insert(
            (record.platform, record.invite_code.clone()),
            record.clone(),
        );
        Ok(())
    }

    async fn read_invite_eligibility(
        &self,
        key: &UserKey,
    ) -> Result<Vec<InvitedUserRecord>, StoreError> {
        self.enter()?;
        Ok(self.invited_records(key))
    }

    async fn upsert_invited_user(&self, record: &InvitedUserRecord) -> Result<(), StoreError> {
        self.enter()?;
        let key = UserKey::new(record.platform, record.invited_user_id.clone());
        let mut invited = self.invited.write();
        let history = invited.entry(key).or_default();

        // Replace the active attribution by the same inviter, otherwise append
        match history
            .iter_mut()
            .find(|r| r.left_at.is_none() && r.inviter_id == record.inviter_id)
        {
            Some(existing) => *existing = record.clone(),
            None => history.push(record.clone()),
        }
        Ok(())
    }

    async fn mark_invited_user_left(
        &self,
        key: &UserKey,
        left_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.enter()?;
        let mut invited = self.invited.write();
        let mut marked = false;
        if let Some(history) = invited.get_mut(key) {
            for record in history.iter_mut().filter(|r| r.left_at.is_none()) {
                record.left_at = Some(left_at);
                marked = true;
            }
        }
        Ok(marked)
    }

    async fn record_invite_reward(&self, reward: &InviteReward) -> Result<(), StoreError> {
        self.enter()?;
        self.rewards.write().push(reward.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rally_core::Level;

    fn key(id: &str) -> UserKey {
        UserKey::new(Platform::Discord, id)
    }

    #[tokio::test]
    async fn test_read_unknown_user() {
        let store = MemoryStore::new();
        let lookup = store.read_activity(&key("nobody")).await.unwrap();
        assert!(!lookup.linked);
        assert!(lookup.activity.is_none());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let store = MemoryStore::new();
        store.fail_next(2);

        assert!(store.read_activity(&key("a")).await.is_err());
        assert!(store.read_activity(&key("a")).await.is_err());
        assert!(store.read_activity(&key("a")).await.is_ok());
        assert_eq!(store.calls(), 3);
    }

    #[tokio::test]
    async fn test_leave_stamps_active_record() {
        let store = MemoryStore::new();
        let joined = Utc::now();
        store
            .upsert_invited_user(&InvitedUserRecord {
                platform: Platform::Discord,
                invited_user_id: "new".to_string(),
                inviter_id: "a".to_string(),
                joined_at: joined,
                left_at: None,
                reward_claimed: true,
            })
            .await
            .unwrap();

        assert!(store.mark_invited_user_left(&key("new"), joined).await.unwrap());
        assert!(!store.mark_invited_user_left(&key("new"), joined).await.unwrap());
        assert_eq!(store.invited_records(&key("new"))[0].left_at, Some(joined));
    }

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = MemoryStore::new();
        store.link_user(key("a"));
        let mut row = UserActivity::empty(&key("a"), Utc::now());
        row.total_xp = 300;
        row.current_level = Level::Silver;
        store.upsert_activity_batch(&[row.clone()]).await.unwrap();
        store
            .upsert_invite_record(&InviteRecord {
                platform: Platform::Discord,
                invite_code: "rly-a-x1".to_string(),
                inviter_id: "a".to_string(),
                uses_count: 2,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        store.save_snapshot(&path).unwrap();

        let reopened = MemoryStore::open(&path).unwrap();
        let lookup = reopened.read_activity(&key("a")).await.unwrap();
        assert!(lookup.linked);
        assert_eq!(lookup.activity, Some(row));
        assert_eq!(
            reopened
                .invite_code(Platform::Discord, "rly-a-x1")
                .map(|r| r.uses_count),
            Some(2)
        );
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(&dir.path().join("absent.json")).unwrap();
        assert!(store.activity(&key("a")).is_none());
    }
}
