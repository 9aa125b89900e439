//! Reward Engine
//!
//! One instance per chat platform. Messages flow through
//! dedup → anti-abuse gate → batch accumulator (+ optimistic cache update);
//! a timer or a full batch flushes the accumulator through the persistence
//! gateway, and level transitions found during the flush are notified.
//! Joins and leaves drive invite attribution through the same gateway and
//! accumulator.

use crate::abuse::{AntiAbuseGate, GateDecision, RejectReason};
use crate::batch::{BatchQueueEntry, FlushReport, XpBatchAccumulator};
use crate::breaker::CircuitBreaker;
use crate::cache::{CacheEntry, UserStateCache};
use crate::clock;
use crate::config::{EngineConfig, RetryPolicy};
use crate::dedup::Deduplicator;
use crate::gateway::PersistenceGateway;
use crate::invite::{
    AttributionSource, DeferredJoin, DeferredJoins, InviteAttributionResolver, InviteCode,
};
use crate::metrics::EngineMetrics;
use crate::platform::{Notification, PlatformAdapter};
use crate::store::ActivityStore;
use chrono::Utc;
use rally_core::{
    ActivityEvent, InviteRecord, JoinEvent, LeaveEvent, LevelUp, Platform, RallyError,
    UserActivity, UserKey, XpReason,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// What happened to one chat message
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventOutcome {
    /// Not a chat message
    Ignored,
    /// Already processed within the dedup window
    Duplicate,
    /// Passed every check; `xp` is 0 for messages under the length floor
    Accepted { xp: u64 },
    Rejected { reason: RejectReason, warnings: u32 },
    /// Rejected and the user was restricted
    Restricted { reason: RejectReason, duration: Duration },
    /// User is serving a restriction
    Punished { remaining: Duration },
    /// User has not linked an account
    NotLinked,
    /// User state could not be read; no XP queued
    Deferred,
}

/// What happened to one join
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InviteOutcome {
    Rewarded {
        inviter: UserKey,
        source: AttributionSource,
    },
    /// No eligible inviter; the join itself is unaffected
    NotRewarded { reason: String },
    /// Attribution failed on storage; transient failures are held for a retry
    Deferred { error: String },
}

/// Counts from one maintenance sweep
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub dedup_keys: usize,
    pub rate_windows: usize,
    pub cache_entries: usize,
}

/// Input of the run loop
#[derive(Clone, Debug)]
pub enum EngineInput<R> {
    Message(R),
    Join(JoinEvent),
    Leave(LeaveEvent),
}

/// Mutable state of one engine instance
pub struct EngineState {
    pub config: EngineConfig,
    pub dedup: Deduplicator,
    pub gate: AntiAbuseGate,
    pub cache: UserStateCache,
    pub accumulator: XpBatchAccumulator,
    pub gateway: PersistenceGateway,
    pub invites: InviteAttributionResolver,
    pub deferred_joins: DeferredJoins,
    pub metrics: EngineMetrics,
}

impl EngineState {
    pub fn new(
        config: EngineConfig,
        platform: Platform,
        bot_user_id: Option<String>,
        store: Arc<dyn ActivityStore>,
        metrics: EngineMetrics,
    ) -> Result<Self, RallyError> {
        config.validate()?;

        Ok(Self {
            dedup: Deduplicator::new(
                config.dedup.capacity,
                Duration::from_secs(config.dedup.ttl_secs),
            ),
            gate: AntiAbuseGate::new(config.abuse.clone()),
            cache: UserStateCache::new(
                config.cache.max_entries,
                Duration::from_secs(config.cache.idle_ttl_secs),
            ),
            accumulator: XpBatchAccumulator::new(config.batch.batch_size),
            gateway: PersistenceGateway::new(
                store,
                CircuitBreaker::new(&config.breaker),
                metrics.clone(),
            ),
            invites: InviteAttributionResolver::new(platform, config.invites.clone(), bot_user_id),
            deferred_joins: DeferredJoins::new(config.invites.deferred_capacity),
            metrics,
            config,
        })
    }
}

/// Engagement reward engine for one platform
pub struct RewardEngine<A: PlatformAdapter> {
    adapter: A,
    state: EngineState,
}

impl<A: PlatformAdapter> RewardEngine<A> {
    pub fn new(
        config: EngineConfig,
        adapter: A,
        store: Arc<dyn ActivityStore>,
        metrics: EngineMetrics,
    ) -> Result<Self, RallyError> {
        let bot_user_id = adapter.bot_user_id().map(str::to_string);
        let state = EngineState::new(config, adapter.platform(), bot_user_id, store, metrics)?;
        Ok(Self { adapter, state })
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    /// Seed in-memory invite tracking from the platform's live invites
    pub async fn bootstrap(&self) -> usize {
        match self.adapter.live_invites().await {
            Ok(invites) => {
                let count = self.state.invites.seed(invites);
                info!(platform = %self.adapter.platform(), invites = count, "Seeded live invites");
                count
            }
            Err(e) => {
                warn!(platform = %self.adapter.platform(), error = %e, "Could not list live invites");
                0
            }
        }
    }

    /// Normalize a platform payload and process it
    pub async fn handle_raw(&self, raw: &A::Raw) -> EventOutcome {
        match self.adapter.normalize_event(raw) {
            Some(event) => self.handle_event(event).await,
            None => EventOutcome::Ignored,
        }
    }

    /// Run one chat message through the pipeline
    pub async fn handle_event(&self, event: ActivityEvent) -> EventOutcome {
        let metrics = &self.state.metrics;
        metrics.events_received.inc();
        let now = clock::now();
        let key = event.user_key();

        if !self.state.dedup.check_and_mark(&event.dedup_key(), now) {
            metrics.duplicates.inc();
            debug!(user = %key, event_id = %event.event_id, "Duplicate event dropped");
            return EventOutcome::Duplicate;
        }

        match self.state.gate.check(&key, &event.text, now) {
            GateDecision::Punished { remaining } => {
                metrics.punished_events.inc();
                debug!(user = %key, remaining_secs = remaining.as_secs(), "Message during restriction");
                return EventOutcome::Punished { remaining };
            }
            GateDecision::Reject { reason, warnings } => {
                metrics.rejected.with_label_values(&[reason.label()]).inc();
                info!(user = %key, reason = reason.label(), warnings, "Message rejected");
                return EventOutcome::Rejected { reason, warnings };
            }
            GateDecision::Restrict {
                reason,
                duration,
                offense,
            } => {
                metrics.rejected.with_label_values(&[reason.label()]).inc();
                metrics.punishments.inc();
                warn!(
                    user = %key,
                    reason = reason.label(),
                    offense,
                    duration_secs = duration.as_secs(),
                    "Restricting user"
                );
                self.restrict(&key, duration).await;
                return EventOutcome::Restricted { reason, duration };
            }
            GateDecision::Accept { award_xp: false } => {
                metrics.short_messages.inc();
                debug!(user = %key, chars = event.char_count(), "Short message, no XP");
                return EventOutcome::Accepted { xp: 0 };
            }
            GateDecision::Accept { award_xp: true } => {}
        }

        if self.state.config.require_linked_account {
            match self.lookup(&key, now).await {
                Ok(entry) if !entry.is_connected => {
                    metrics.not_linked.inc();
                    debug!(user = %key, "Account not linked, no XP");
                    return EventOutcome::NotLinked;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(user = %key, error = %e, "User state unavailable, message not rewarded");
                    return EventOutcome::Deferred;
                }
            }
        }

        let xp = self.state.config.xp_per_message;
        self.queue_xp(&key, xp, XpReason::Message, now).await;
        EventOutcome::Accepted { xp }
    }

    /// XP a user should see right now: last committed value plus pending increments
    pub async fn user_xp(&self, key: &UserKey) -> Result<u64, RallyError> {
        Ok(self.lookup(key, clock::now()).await?.visible_xp())
    }

    /// Commit every pending increment in one storage call.
    ///
    /// Failures are contained: entries are re-queued or dropped according
    /// to the retry policy and reported, never raised.
    pub async fn flush(&self) -> FlushReport {
        let entries = self.state.accumulator.drain();
        self.update_queue_depth();

        let mut report = FlushReport {
            drained: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            return report;
        }

        let (rows, transitions) = match self.build_rows(&entries).await {
            Ok(built) => built,
            Err(e) => {
                self.handle_failed_flush(entries, &e, &mut report);
                return report;
            }
        };

        if let Err(e) = self.state.gateway.upsert_activity_batch(&rows).await {
            self.handle_failed_flush(entries, &e, &mut report);
            return report;
        }

        self.state.metrics.flushes_ok.inc();
        report.committed = rows.len();

        for ((entry, row), transition) in entries.iter().zip(&rows).zip(transitions) {
            self.state
                .cache
                .commit(row, entry.xp_delta, entry.message_delta);

            if let Some(LevelUp { old, new }) = transition {
                report.level_ups += 1;
                self.state.metrics.level_ups.inc();
                info!(user = %entry.key, old = %old, new = %new, total_xp = row.total_xp, "Level up");
                self.notify(Notification::LevelUp {
                    user: entry.key.clone(),
                    old,
                    new,
                })
                .await;
            }
        }

        debug!(
            committed = report.committed,
            level_ups = report.level_ups,
            "Batch flushed"
        );
        report
    }

    /// Attribute a new member to an inviter and reward them.
    ///
    /// A join that fails on storage is held and retried by
    /// [`RewardEngine::retry_deferred_joins`].
    pub async fn handle_join(&self, join: JoinEvent) -> InviteOutcome {
        match self.try_join(&join).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let error = e.to_string();
                self.defer_join(DeferredJoin { join, attempts: 0 }, &e);
                InviteOutcome::Deferred { error }
            }
        }
    }

    /// Retry every deferred join. Rejections by the open circuit do not
    /// count as attempts. Returns the number of joins rewarded.
    pub async fn retry_deferred_joins(&self) -> usize {
        let pending = self.state.deferred_joins.drain();
        if pending.is_empty() {
            return 0;
        }
        let max_retries = self.state.config.invites.deferred_max_retries;
        let mut rewarded = 0;

        for mut deferred in pending {
            match self.try_join(&deferred.join).await {
                Ok(InviteOutcome::Rewarded { .. }) => rewarded += 1,
                Ok(_) => {}
                Err(e) => {
                    if !matches!(e, RallyError::CircuitOpen { .. }) {
                        deferred.attempts += 1;
                    }
                    if deferred.attempts >= max_retries {
                        self.state.metrics.invites_abandoned.inc();
                        error!(
                            user = %deferred.join.user_key(),
                            attempts = deferred.attempts,
                            error = %e,
                            "Giving up on deferred join"
                        );
                    } else {
                        self.defer_join(deferred, &e);
                    }
                }
            }
        }

        self.update_deferred_depth();
        debug!(rewarded, held = self.state.deferred_joins.len(), "Deferred joins retried");
        rewarded
    }

    fn defer_join(&self, deferred: DeferredJoin, error: &RallyError) {
        let user = deferred.join.user_key();
        if !error.is_transient() {
            error!(user = %user, error = %error, "Invite attribution failed");
            return;
        }

        warn!(user = %user, attempts = deferred.attempts, error = %error, "Invite attribution deferred");
        if let Some(evicted) = self.state.deferred_joins.push(deferred) {
            self.state.metrics.invites_abandoned.inc();
            error!(user = %evicted.join.user_key(), "Deferred join queue full, dropping oldest join");
        }
        self.update_deferred_depth();
    }

    /// Run attribution once. `Err` is a storage failure worth a retry.
    async fn try_join(&self, join: &JoinEvent) -> Result<InviteOutcome, RallyError> {
        let metrics = &self.state.metrics;

        match self.state.invites.attribute(&self.state.gateway, join).await {
            Ok(attribution) => {
                let xp = self.state.config.invites.xp_reward;
                metrics.invites_rewarded.inc();
                info!(
                    inviter = %attribution.inviter,
                    invited = %attribution.invited,
                    source = ?attribution.source,
                    xp,
                    "Invite rewarded"
                );

                self.queue_xp(&attribution.inviter, xp, XpReason::Invite, clock::now())
                    .await;
                self.notify(Notification::InviteReward {
                    inviter: attribution.inviter.clone(),
                    invited: attribution.invited,
                })
                .await;

                Ok(InviteOutcome::Rewarded {
                    inviter: attribution.inviter,
                    source: attribution.source,
                })
            }
            Err(RallyError::InvalidAttribution(reason)) => {
                metrics.invites_rejected.inc();
                info!(user = %join.user_key(), reason = %reason, "Join not rewarded");
                Ok(InviteOutcome::NotRewarded { reason })
            }
            Err(e) => Err(e),
        }
    }

    /// Stamp the departure on the member's attribution record.
    /// Returns whether an active attribution was closed.
    pub async fn handle_leave(&self, leave: LeaveEvent) -> bool {
        let key = leave.user_key();
        match self
            .state
            .gateway
            .mark_invited_user_left(&key, leave.left_at)
            .await
        {
            Ok(closed) => {
                debug!(user = %key, closed, "Member left");
                closed
            }
            Err(e) => {
                warn!(user = %key, error = %e, "Failed to record member leave");
                false
            }
        }
    }

    /// Issue a structured invite code for `inviter_id`.
    ///
    /// The code resolves from memory or by parsing even if persisting it fails.
    pub async fn issue_invite(&self, inviter_id: &str) -> InviteCode {
        let code = self.state.invites.issue(inviter_id);
        let record = InviteRecord {
            platform: self.adapter.platform(),
            invite_code: code.to_string(),
            inviter_id: inviter_id.to_string(),
            uses_count: 0,
            created_at: Utc::now(),
        };
        if let Err(e) = self.state.gateway.upsert_invite_record(&record).await {
            warn!(code = %code, error = %e, "Failed to persist invite code");
        }
        code
    }

    /// Evict expired dedup keys, idle rate windows and idle cache entries
    pub fn maintenance(&self, now: Instant) -> MaintenanceReport {
        let report = MaintenanceReport {
            dedup_keys: self.state.dedup.purge_expired(now),
            rate_windows: self.state.gate.evict_idle(now),
            cache_entries: self.state.cache.evict_expired(now),
        };
        self.state
            .metrics
            .cache_entries
            .set(self.state.cache.len() as i64);
        debug!(?report, "Maintenance sweep");
        report
    }

    /// Process inputs until shutdown or until the input channel closes,
    /// flushing on the batch timer. Pending XP is flushed before returning.
    pub async fn run(
        &self,
        mut inbox: mpsc::Receiver<EngineInput<A::Raw>>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> FlushReport {
        let flush_every = self.state.config.flush_interval();
        let sweep_every = self.state.config.maintenance_interval();

        let mut flush_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + flush_every, flush_every);
        flush_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep_tick =
            tokio::time::interval_at(tokio::time::Instant::now() + sweep_every, sweep_every);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            platform = %self.adapter.platform(),
            flush_interval_secs = flush_every.as_secs(),
            batch_size = self.state.accumulator.batch_size(),
            "Reward engine running"
        );

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Reward engine shutting down");
                    break;
                }
                input = inbox.recv() => match input {
                    Some(EngineInput::Message(raw)) => {
                        self.handle_raw(&raw).await;
                    }
                    Some(EngineInput::Join(join)) => {
                        self.handle_join(join).await;
                    }
                    Some(EngineInput::Leave(leave)) => {
                        self.handle_leave(leave).await;
                    }
                    None => {
                        info!("Input closed, stopping reward engine");
                        break;
                    }
                },
                _ = flush_tick.tick() => {
                    self.retry_deferred_joins().await;
                    self.flush().await;
                }
                _ = sweep_tick.tick() => {
                    self.maintenance(clock::now());
                }
            }
        }

        self.retry_deferred_joins().await;
        if !self.state.deferred_joins.is_empty() {
            warn!(
                held = self.state.deferred_joins.len(),
                "Deferred joins still unattributed at shutdown"
            );
        }
        let report = self.flush().await;
        info!(
            committed = report.committed,
            requeued = report.requeued,
            "Final flush complete"
        );
        report
    }

    /// Cached state of `key`. An unlinked entry is re-read every time, a
    /// user may link their account at any moment.
    async fn lookup(&self, key: &UserKey, now: Instant) -> Result<CacheEntry, RallyError> {
        match self.state.cache.get(key, now) {
            Some(entry) if entry.is_connected => return Ok(entry),
            _ => {}
        }
        let lookup = self.state.gateway.read_activity(key).await?;
        let entry = self.state.cache.insert(key.clone(), lookup, now);
        self.state
            .metrics
            .cache_entries
            .set(self.state.cache.len() as i64);
        Ok(entry)
    }

    async fn queue_xp(&self, key: &UserKey, xp: u64, reason: XpReason, now: Instant) {
        let full = self.state.accumulator.add(key, xp, reason);
        let messages = u64::from(reason == XpReason::Message);
        self.state.cache.apply_delta(key, xp, messages, now);
        self.state.metrics.xp_queued.inc_by(xp);
        self.update_queue_depth();

        if full {
            debug!("Batch size reached, flushing");
            self.flush().await;
        }
    }

    /// Last committed row of a user, cache first
    async fn current_row(&self, key: &UserKey) -> Result<UserActivity, RallyError> {
        if let Some(row) = self.state.cache.peek_snapshot(key) {
            return Ok(row);
        }
        let lookup = self.state.gateway.read_activity(key).await?;
        Ok(lookup
            .activity
            .unwrap_or_else(|| UserActivity::empty(key, Utc::now())))
    }

    async fn build_rows(
        &self,
        entries: &[BatchQueueEntry],
    ) -> Result<(Vec<UserActivity>, Vec<Option<LevelUp>>), RallyError> {
        let levels = &self.state.config.levels;
        let now = Utc::now();
        let mut rows = Vec::with_capacity(entries.len());
        let mut transitions = Vec::with_capacity(entries.len());

        for entry in entries {
            let mut row = self.current_row(&entry.key).await?;
            let old_xp = row.total_xp;

            row.total_xp = old_xp.saturating_add(entry.xp_delta);
            row.message_count += entry.message_delta;
            row.invite_count += entry.invite_delta;
            row.current_level = levels.level_for(row.total_xp);
            row.last_activity_at = now;

            transitions.push(levels.transition(old_xp, row.total_xp));
            rows.push(row);
        }

        Ok((rows, transitions))
    }

    fn handle_failed_flush(
        &self,
        entries: Vec<BatchQueueEntry>,
        error: &RallyError,
        report: &mut FlushReport,
    ) {
        let metrics = &self.state.metrics;
        report.failed = true;
        metrics.flushes_failed.inc();

        match self.state.config.batch.retry_policy {
            RetryPolicy::Drop => {
                report.dropped = entries.len();
                self.discard(entries);
            }
            // The store was never called, so no attempt is spent
            RetryPolicy::Requeue { .. } if matches!(error, RallyError::CircuitOpen { .. }) => {
                report.requeued = self.state.accumulator.restore(entries);
            }
            RetryPolicy::Requeue { max_retries } => {
                let outcome = self.state.accumulator.requeue(entries, max_retries);
                report.requeued = outcome.requeued;
                report.dropped = outcome.dropped.len();
                self.discard(outcome.dropped);
            }
        }

        metrics.entries_requeued.inc_by(report.requeued as u64);
        metrics.entries_dropped.inc_by(report.dropped as u64);
        self.update_queue_depth();

        if error.is_transient() {
            warn!(
                error = %error,
                requeued = report.requeued,
                dropped = report.dropped,
                "Batch flush failed"
            );
        } else {
            error!(
                error = %error,
                requeued = report.requeued,
                dropped = report.dropped,
                "Batch flush failed"
            );
        }
    }

    fn discard(&self, entries: Vec<BatchQueueEntry>) {
        for entry in entries {
            self.state
                .cache
                .rollback(&entry.key, entry.xp_delta, entry.message_delta);
            error!(
                user = %entry.key,
                xp = entry.xp_delta,
                attempts = entry.attempts,
                "Dropped pending XP after failed flush"
            );
        }
    }

    async fn restrict(&self, key: &UserKey, duration: Duration) {
        match self.adapter.restrict_user(key, duration).await {
            Ok(()) => {}
            Err(rally_core::PlatformError::RestrictionUnsupported) => {
                self.state.gate.mark_banned_locally(key);
                info!(user = %key, "Native restriction unavailable, banning locally");
            }
            Err(e) => {
                self.state.gate.mark_banned_locally(key);
                warn!(user = %key, error = %e, "Restriction failed, banning locally");
            }
        }

        self.notify(Notification::Punishment {
            user: key.clone(),
            duration_secs: duration.as_secs(),
        })
        .await;
    }

    /// Send a notification once; failures are logged only
    async fn notify(&self, notification: Notification) {
        let user = notification.user().clone();
        if let Err(e) = self.adapter.send_notification(notification).await {
            warn!(user = %user, error = %e, "Notification failed");
        }
    }

    fn update_deferred_depth(&self) {
        self.state
            .metrics
            .deferred_joins
            .set(self.state.deferred_joins.len() as i64);
    }

    fn update_queue_depth(&self) {
        self.state
            .metrics
            .queue_depth
            .set(self.state.accumulator.len() as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::RecordingAdapter;
    use crate::store::MemoryStore;

    fn engine(store: Arc<MemoryStore>) -> RewardEngine<RecordingAdapter> {
        RewardEngine::new(
            EngineConfig::default(),
            RecordingAdapter::new(Platform::Discord),
            store,
            EngineMetrics::new("discord").unwrap(),
        )
        .unwrap()
    }

    fn message(user: &str, id: &str, text: &str) -> ActivityEvent {
        ActivityEvent {
            platform: Platform::Discord,
            user_id: user.to_string(),
            event_id: id.to_string(),
            chat_id: None,
            text: text.to_string(),
            timestamp: Utc::now(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlinked_user_earns_nothing() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine(store.clone());

        let outcome = engine
            .handle_event(message("u1", "1", "hello everyone in here"))
            .await;
        assert_eq!(outcome, EventOutcome::NotLinked);
        assert!(engine.state().accumulator.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_linking_takes_effect_while_cached() {
        let store = Arc::new(MemoryStore::new());
        let key = UserKey::new(Platform::Discord, "u1");
        let engine = engine(store.clone());

        assert_eq!(
            engine
                .handle_event(message("u1", "1", "hello everyone in here"))
                .await,
            EventOutcome::NotLinked
        );

        store.link_user(key.clone());
        tokio::time::advance(Duration::from_secs(62)).await;

        assert_eq!(
            engine
                .handle_event(message("u1", "2", "linked my account just now"))
                .await,
            EventOutcome::Accepted { xp: 1 }
        );
        assert_eq!(engine.state().accumulator.pending(&key).unwrap().xp_delta, 1);
        assert_eq!(engine.user_xp(&key).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_xp_visible_before_flush() {
        let store = Arc::new(MemoryStore::new());
        let key = UserKey::new(Platform::Discord, "u1");
        store.link_user(key.clone());
        let engine = engine(store.clone());

        engine
            .handle_event(message("u1", "1", "hello everyone in here"))
            .await;
        assert_eq!(engine.user_xp(&key).await.unwrap(), 1);
        assert!(store.activity(&key).is_none());

        let report = engine.flush().await;
        assert_eq!(report.committed, 1);
        assert_eq!(store.activity(&key).unwrap().total_xp, 1);
        assert_eq!(engine.user_xp(&key).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_restriction_bans_locally() {
        let store = Arc::new(MemoryStore::new());
        let engine = RewardEngine::new(
            EngineConfig::default(),
            RecordingAdapter::new(Platform::Discord).without_native_restrictions(),
            store,
            EngineMetrics::new("discord").unwrap(),
        )
        .unwrap();

        engine.handle_event(message("spam", "1", "!!!!!!!!")).await;
        let outcome = engine.handle_event(message("spam", "2", "????????")).await;
        assert!(matches!(outcome, EventOutcome::Restricted { .. }));

        let key = UserKey::new(Platform::Discord, "spam");
        assert!(matches!(
            engine.state().gate.standing(&key, clock::now()),
            crate::abuse::Standing::Banned { .. }
        ));
        assert!(engine
            .adapter()
            .sent()
            .iter()
            .any(|n| matches!(n, Notification::Punishment { duration_secs: 300, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_config_rejected() {
        let mut config = EngineConfig::default();
        config.levels.gold = 100;
        let result = RewardEngine::new(
            config,
            RecordingAdapter::new(Platform::Discord),
            Arc::new(MemoryStore::new()),
            EngineMetrics::new("discord").unwrap(),
        );
        assert!(matches!(result, Err(RallyError::Configuration(_))));
    }
}
