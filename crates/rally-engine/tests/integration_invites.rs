//! Integration tests for invite attribution
//!
//! Covers the resolution fallback chain, re-attribution eligibility,
//! self-invites and the rewards written on success.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rally_core::{InviteRecord, JoinEvent, LeaveEvent, Platform, UserKey};
use rally_engine::{
    ActivityStore, AttributionSource, EngineConfig, EngineMetrics, InviteOutcome, LiveInvite, MemoryStore,
    Notification, RecordingAdapter, RewardEngine,
};
use std::sync::Arc;

fn key(user: &str) -> UserKey {
    UserKey::new(Platform::Telegram, user)
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
}

fn join(user: &str, code: Option<&str>, at: DateTime<Utc>) -> JoinEvent {
    JoinEvent {
        platform: Platform::Telegram,
        new_user_id: user.to_string(),
        invite_code_used: code.map(str::to_string),
        platform_inviter_id: None,
        joined_at: at,
    }
}

async fn persisted_code(store: &MemoryStore, code: &str, inviter: &str) {
    let record = InviteRecord {
        platform: Platform::Telegram,
        invite_code: code.to_string(),
        inviter_id: inviter.to_string(),
        uses_count: 0,
        created_at: t0(),
    };
    store.upsert_invite_record(&record).await.unwrap();
}

fn engine_with(adapter: RecordingAdapter, store: Arc<MemoryStore>) -> RewardEngine<RecordingAdapter> {
    RewardEngine::new(
        EngineConfig::default(),
        adapter,
        store,
        EngineMetrics::new("telegram").unwrap(),
    )
    .unwrap()
}

mod eligibility_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rejoin_after_window_reattributes() {
        let store = Arc::new(MemoryStore::new());
        persisted_code(&store, "code-a", "alice").await;
        persisted_code(&store, "code-b", "bob").await;
        let engine = engine_with(RecordingAdapter::new(Platform::Telegram), store.clone());

        assert_eq!(
            engine.handle_join(join("newbie", Some("code-a"), t0())).await,
            InviteOutcome::Rewarded {
                inviter: key("alice"),
                source: AttributionSource::Persisted
            }
        );

        // Still an active member attributed to alice
        assert!(matches!(
            engine.handle_join(join("newbie", Some("code-b"), t0() + Duration::days(1))).await,
            InviteOutcome::NotRewarded { .. }
        ));

        assert!(
            engine
                .handle_leave(LeaveEvent {
                    platform: Platform::Telegram,
                    user_id: "newbie".to_string(),
                    left_at: t0() + Duration::days(2),
                })
                .await
        );

        // Left 8 days ago: inside the 30 day window
        assert!(matches!(
            engine.handle_join(join("newbie", Some("code-b"), t0() + Duration::days(10))).await,
            InviteOutcome::NotRewarded { .. }
        ));

        // Left 38 days ago: eligible for bob
        assert_eq!(
            engine.handle_join(join("newbie", Some("code-b"), t0() + Duration::days(40))).await,
            InviteOutcome::Rewarded {
                inviter: key("bob"),
                source: AttributionSource::Persisted
            }
        );

        let rewards = store.invite_rewards();
        assert_eq!(rewards.len(), 2);
        assert!(rewards.iter().all(|r| r.amount == 10));
        assert_eq!(store.invite_code(Platform::Telegram, "code-a").unwrap().uses_count, 1);
        assert_eq!(store.invite_code(Platform::Telegram, "code-b").unwrap().uses_count, 1);
        assert_eq!(store.invited_records(&key("newbie")).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_inviter_xp_goes_through_batch() {
        let store = Arc::new(MemoryStore::new());
        persisted_code(&store, "code-a", "alice").await;
        let engine = engine_with(RecordingAdapter::new(Platform::Telegram), store.clone());

        engine.handle_join(join("newbie", Some("code-a"), t0())).await;
        let pending = engine.state().accumulator.pending(&key("alice")).unwrap();
        assert_eq!(pending.xp_delta, 50);
        assert_eq!(pending.invite_delta, 1);

        engine.flush().await;
        let alice = store.activity(&key("alice")).unwrap();
        assert_eq!(alice.total_xp, 50);
        assert_eq!(alice.invite_count, 1);
        assert_eq!(alice.message_count, 0);

        assert!(engine.adapter().sent().contains(&Notification::InviteReward {
            inviter: key("alice"),
            invited: key("newbie"),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_self_invite_rejected() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(RecordingAdapter::new(Platform::Telegram), store.clone());

        let code = engine.issue_invite("sneaky").await;
        let outcome = engine
            .handle_join(join("sneaky", Some(&code.to_string()), t0()))
            .await;

        assert!(matches!(outcome, InviteOutcome::NotRewarded { .. }));
        assert!(store.invite_rewards().is_empty());
        assert_eq!(engine.state().metrics.invites_rejected.get(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_outage_defers() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(RecordingAdapter::new(Platform::Telegram), store.clone());

        let mut event = join("newbie", None, t0());
        event.platform_inviter_id = Some("alice".to_string());
        store.fail_next(1);

        assert!(matches!(
            engine.handle_join(event).await,
            InviteOutcome::Deferred { .. }
        ));
        assert!(engine.state().accumulator.is_empty());
        assert_eq!(engine.state().deferred_joins.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_join_rewarded_after_recovery() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(RecordingAdapter::new(Platform::Telegram), store.clone());

        let mut event = join("newbie", None, t0());
        event.platform_inviter_id = Some("alice".to_string());
        store.fail_next(1);
        assert!(matches!(
            engine.handle_join(event).await,
            InviteOutcome::Deferred { .. }
        ));

        assert_eq!(engine.retry_deferred_joins().await, 1);
        assert!(engine.state().deferred_joins.is_empty());
        engine.flush().await;

        let alice = store.activity(&key("alice")).unwrap();
        assert_eq!(alice.total_xp, 50);
        assert_eq!(alice.invite_count, 1);
        assert_eq!(store.invite_rewards().len(), 1);
        assert_eq!(store.invited_records(&key("newbie")).len(), 1);
        assert!(engine.adapter().sent().contains(&Notification::InviteReward {
            inviter: key("alice"),
            invited: key("newbie"),
        }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deferred_join_given_up_after_retries() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(RecordingAdapter::new(Platform::Telegram), store.clone());

        let mut event = join("newbie", None, t0());
        event.platform_inviter_id = Some("alice".to_string());
        // One failure for the join, three for its retries; below the breaker threshold
        store.fail_next(4);
        engine.handle_join(event).await;

        for _ in 0..3 {
            assert_eq!(engine.retry_deferred_joins().await, 0);
        }
        assert!(engine.state().deferred_joins.is_empty());
        assert_eq!(engine.state().metrics.invites_abandoned.get(), 1);

        assert_eq!(engine.retry_deferred_joins().await, 0);
        assert!(store.invite_rewards().is_empty());
    }
}

mod resolution_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fallback_chain() {
        let store = Arc::new(MemoryStore::new());
        let adapter = RecordingAdapter::new(Platform::Telegram)
            .with_bot_user("rallybot")
            .with_live_invites(vec![LiveInvite {
                code: "live-xyz".to_string(),
                inviter_id: "lena".to_string(),
            }]);
        let engine = engine_with(adapter, store.clone());
        assert_eq!(engine.bootstrap().await, 1);

        // In-memory map from the live invite list
        assert_eq!(
            engine.handle_join(join("u1", Some("live-xyz"), t0())).await,
            InviteOutcome::Rewarded {
                inviter: key("lena"),
                source: AttributionSource::InMemory
            }
        );

        // Structured code this process issued before a restart
        assert_eq!(
            engine.handle_join(join("u2", Some("rly-paul-k3y9z2ab"), t0())).await,
            InviteOutcome::Rewarded {
                inviter: key("paul"),
                source: AttributionSource::ParsedCode
            }
        );

        // Platform attribution to the bot itself is ignored
        let mut via_bot = join("u3", None, t0());
        via_bot.platform_inviter_id = Some("rallybot".to_string());
        assert!(matches!(
            engine.handle_join(via_bot).await,
            InviteOutcome::NotRewarded { .. }
        ));

        let mut via_platform = join("u4", None, t0());
        via_platform.platform_inviter_id = Some("rita".to_string());
        assert_eq!(
            engine.handle_join(via_platform).await,
            InviteOutcome::Rewarded {
                inviter: key("rita"),
                source: AttributionSource::PlatformReported
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_issued_code_is_persisted() {
        let store = Arc::new(MemoryStore::new());
        let engine = engine_with(RecordingAdapter::new(Platform::Telegram), store.clone());

        let code = engine.issue_invite("ines").await;
        let record = store
            .invite_code(Platform::Telegram, &code.to_string())
            .unwrap();
        assert_eq!(record.inviter_id, "ines");

        assert_eq!(
            engine.handle_join(join("friend", Some(&code.to_string()), t0())).await,
            InviteOutcome::Rewarded {
                inviter: key("ines"),
                source: AttributionSource::Persisted
            }
        );
        assert_eq!(
            store.invite_code(Platform::Telegram, &code.to_string()).unwrap().uses_count,
            1
        );
    }
}
