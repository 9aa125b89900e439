//! Persistence Gateway
//!
//! Every storage call of the engine passes through here, guarded by the
//! circuit breaker. An open circuit surfaces as `RallyError::CircuitOpen`,
//! which callers treat like any transient storage failure.

use crate::breaker::{BreakerState, CircuitBreaker};
use crate::clock;
use crate::metrics::EngineMetrics;
use crate::store::ActivityStore;
use chrono::{DateTime, Utc};
use rally_core::{
    InviteRecord, InviteReward, InvitedUserRecord, Platform, RallyError, StoreError, UserActivity,
    UserKey, UserLookup,
};
use std::future::Future;
use std::sync::Arc;

/// Circuit-breaker-wrapped store adapter
pub struct PersistenceGateway {
    store: Arc<dyn ActivityStore>,
    breaker: CircuitBreaker,
    metrics: EngineMetrics,
}

impl PersistenceGateway {
    pub fn new(store: Arc<dyn ActivityStore>, breaker: CircuitBreaker, metrics: EngineMetrics) -> Self {
        Self {
            store,
            breaker,
            metrics,
        }
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.state()
    }

    async fn call<T, F, Fut>(&self, op: &'static str, f: F) -> Result<T, RallyError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        if let Err(e) = self.breaker.acquire(clock::now()) {
            self.metrics.breaker_rejections.inc();
            tracing::debug!(op, "Storage call rejected by open circuit");
            return Err(e);
        }

        let result = f().await;
        match &result {
            Ok(_) => self.breaker.record_success(),
            Err(e) => {
                tracing::warn!(op, error = %e, "Storage call failed");
                self.breaker.record_failure(clock::now());
            }
        }
        self.metrics
            .breaker_state
            .set(self.breaker.state().as_gauge());

        result.map_err(RallyError::from)
    }

    pub async fn upsert_activity_batch(&self, rows: &[UserActivity]) -> Result<(), RallyError> {
        self.call("upsert_activity_batch", || self.store.upsert_activity_batch(rows))
            .await
    }

    pub async fn read_activity(&self, key: &UserKey) -> Result<UserLookup, RallyError> {
        self.call("read_activity", || self.store.read_activity(key))
            .await
    }

    pub async fn lookup_invite_code(
        &self,
        platform: Platform,
        code: &str,
    ) -> Result<Option<InviteRecord>, RallyError> {
        self.call("lookup_invite_code", || {
            self.store.lookup_invite_code(platform, code)
        })
        .await
    }

    pub async fn upsert_invite_record(&self, record: &InviteRecord) -> Result<(), RallyError> {
        self.call("upsert_invite_record", || self.store.upsert_invite_record(record))
            .await
    }

    pub async fn read_invite_eligibility(
        &self,
        key: &UserKey,
    ) -> Result<Vec<InvitedUserRecord>, RallyError> {
        self.call("read_invite_eligibility", || {
            self.store.read_invite_eligibility(key)
        })
        .await
    }

    pub async fn upsert_invited_user(&self, record: &InvitedUserRecord) -> Result<(), RallyError> {
        self.call("upsert_invited_user", || self.store.upsert_invited_user(record))
            .await
    }

    pub async fn mark_invited_user_left(
        &self,
        key: &UserKey,
        left_at: DateTime<Utc>,
    ) -> Result<bool, RallyError> {
        self.call("mark_invited_user_left", || {
            self.store.mark_invited_user_left(key, left_at)
        })
        .await
    }

    pub async fn record_invite_reward(&self, reward: &InviteReward) -> Result<(), RallyError> {
        self.call("record_invite_reward", || self.store.record_invite_reward(reward))
            .await
    }
}
