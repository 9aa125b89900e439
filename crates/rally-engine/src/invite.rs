//! Invite Attribution Resolver
//!
//! Works out who referred an arriving member. Sources are tried in order,
//! first match wins:
//!
//! 1. persisted invite code → inviter
//! 2. in-memory invite map, seeded from the platform's live invites
//! 3. inviter id embedded in a code issued by this process
//! 4. the platform's own attribution, unless it names the bot itself
//!
//! A user is rewarded at most once per membership: any attribution record
//! that is still active, or whose user left within the rejoin window,
//! blocks a new reward.

use crate::config::InviteConfig;
use crate::gateway::PersistenceGateway;
use crate::platform::LiveInvite;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rally_core::{
    InviteRecord, InviteReward, InvitedUserRecord, JoinEvent, Platform, RallyError, UserKey,
};
use rand::{distributions::Alphanumeric, Rng};
use std::collections::VecDeque;
use std::fmt;

const NONCE_LEN: usize = 8;

/// Structured invite code: `{prefix}-{inviterId}-{nonce}`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InviteCode {
    pub prefix: String,
    pub inviter_id: String,
    pub nonce: String,
}

impl InviteCode {
    /// New code for `inviter_id` with a random nonce
    pub fn issue(prefix: &str, inviter_id: &str) -> Self {
        let nonce: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(NONCE_LEN)
            .map(char::from)
            .collect();
        Self {
            prefix: prefix.to_string(),
            inviter_id: inviter_id.to_string(),
            nonce: nonce.to_ascii_lowercase(),
        }
    }

    /// Parse a code issued with `prefix`. Inviter ids may contain `-`,
    /// nonces never do.
    pub fn parse(prefix: &str, code: &str) -> Option<Self> {
        let rest = code.strip_prefix(prefix)?.strip_prefix('-')?;
        let (inviter_id, nonce) = rest.rsplit_once('-')?;
        if inviter_id.is_empty()
            || nonce.is_empty()
            || !nonce.chars().all(|c| c.is_ascii_alphanumeric())
        {
            return None;
        }
        Some(Self {
            prefix: prefix.to_string(),
            inviter_id: inviter_id.to_string(),
            nonce: nonce.to_string(),
        })
    }
}

impl fmt::Display for InviteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.prefix, self.inviter_id, self.nonce)
    }
}

/// Where an attribution came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttributionSource {
    Persisted,
    InMemory,
    ParsedCode,
    PlatformReported,
}

/// A resolved and recorded invite
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attribution {
    pub inviter: UserKey,
    pub invited: UserKey,
    pub source: AttributionSource,
    pub code: Option<String>,
}

/// A join whose attribution hit a storage failure
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeferredJoin {
    pub join: JoinEvent,
    /// Failed retries so far
    pub attempts: u32,
}

/// Bounded FIFO of joins waiting for storage to recover
pub struct DeferredJoins {
    capacity: usize,
    queue: Mutex<VecDeque<DeferredJoin>>,
}

impl DeferredJoins {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    /// Hold `join` for the next retry. Returns the join pushed out to make
    /// room, if any.
    pub fn push(&self, join: DeferredJoin) -> Option<DeferredJoin> {
        if self.capacity == 0 {
            return Some(join);
        }
        let mut queue = self.queue.lock();
        let evicted = if queue.len() >= self.capacity {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(join);
        evicted
    }

    /// Take every held join
    pub fn drain(&self) -> Vec<DeferredJoin> {
        self.queue.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

/// Resolves and records invite attribution for one platform
pub struct InviteAttributionResolver {
    platform: Platform,
    config: InviteConfig,
    bot_user_id: Option<String>,
    /// code → inviter id; lost on restart
    live: DashMap<String, String>,
}

impl InviteAttributionResolver {
    pub fn new(platform: Platform, config: InviteConfig, bot_user_id: Option<String>) -> Self {
        Self {
            platform,
            config,
            bot_user_id,
            live: DashMap::new(),
        }
    }

    /// Load the platform's live invite list into the in-memory map
    pub fn seed(&self, invites: Vec<LiveInvite>) -> usize {
        let count = invites.len();
        for invite in invites {
            self.live.insert(invite.code, invite.inviter_id);
        }
        count
    }

    /// Issue a structured code for `inviter_id` and track it in memory
    pub fn issue(&self, inviter_id: &str) -> InviteCode {
        let code = InviteCode::issue(&self.config.code_prefix, inviter_id);
        self.live.insert(code.to_string(), inviter_id.to_string());
        code
    }

    pub fn tracked_codes(&self) -> usize {
        self.live.len()
    }

    /// Inviter of a join, walking the fallback chain
    pub async fn resolve(
        &self,
        gateway: &PersistenceGateway,
        join: &JoinEvent,
    ) -> Result<(String, AttributionSource), RallyError> {
        let resolved = self.resolve_inviter(gateway, join).await.ok_or_else(|| {
            RallyError::InvalidAttribution(format!("no inviter found for {}", join.new_user_id))
        })?;

        if resolved.0 == join.new_user_id {
            return Err(RallyError::InvalidAttribution(format!(
                "self-invite by {}",
                join.new_user_id
            )));
        }
        Ok(resolved)
    }

    async fn resolve_inviter(
        &self,
        gateway: &PersistenceGateway,
        join: &JoinEvent,
    ) -> Option<(String, AttributionSource)> {
        if let Some(code) = join.invite_code_used.as_deref() {
            match gateway.lookup_invite_code(self.platform, code).await {
                Ok(Some(record)) => return Some((record.inviter_id, AttributionSource::Persisted)),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(code, error = %e, "Persisted invite lookup failed, falling back");
                }
            }

            if let Some(inviter) = self.live.get(code) {
                return Some((inviter.clone(), AttributionSource::InMemory));
            }

            if let Some(parsed) = InviteCode::parse(&self.config.code_prefix, code) {
                return Some((parsed.inviter_id, AttributionSource::ParsedCode));
            }
        }

        join.platform_inviter_id
            .as_deref()
            .filter(|id| Some(*id) != self.bot_user_id.as_deref())
            .map(|id| (id.to_string(), AttributionSource::PlatformReported))
    }

    /// Fail if an earlier attribution still blocks a reward for `key`
    pub async fn check_eligibility(
        &self,
        gateway: &PersistenceGateway,
        key: &UserKey,
        now: DateTime<Utc>,
    ) -> Result<(), RallyError> {
        let window = chrono::Duration::days(self.config.rejoin_window_days);
        let records = gateway.read_invite_eligibility(key).await?;

        match records
            .iter()
            .find(|r| r.blocks_reattribution(now, window))
        {
            Some(blocking) => Err(RallyError::InvalidAttribution(format!(
                "{} already attributed to {}",
                key, blocking.inviter_id
            ))),
            None => Ok(()),
        }
    }

    /// Resolve, check eligibility and record the attribution of a join.
    ///
    /// The attribution record is the claim: if writing it fails nothing is
    /// rewarded. The code's use count and the token reward are best effort.
    pub async fn attribute(
        &self,
        gateway: &PersistenceGateway,
        join: &JoinEvent,
    ) -> Result<Attribution, RallyError> {
        let invited = join.user_key();
        let (inviter_id, source) = self.resolve(gateway, join).await?;
        self.check_eligibility(gateway, &invited, join.joined_at).await?;

        gateway
            .upsert_invited_user(&InvitedUserRecord {
                platform: self.platform,
                invited_user_id: join.new_user_id.clone(),
                inviter_id: inviter_id.clone(),
                joined_at: join.joined_at,
                left_at: None,
                reward_claimed: true,
            })
            .await?;

        if let Some(code) = join.invite_code_used.as_deref() {
            if let Err(e) = self.count_use(gateway, code, &inviter_id, join.joined_at).await {
                tracing::warn!(code, error = %e, "Failed to count invite use");
            }
        }

        let reward = InviteReward {
            platform: self.platform,
            inviter_id: inviter_id.clone(),
            invited_user_id: join.new_user_id.clone(),
            amount: self.config.token_reward,
            granted_at: join.joined_at,
        };
        if let Err(e) = gateway.record_invite_reward(&reward).await {
            tracing::warn!(inviter = %inviter_id, error = %e, "Failed to record invite token reward");
        }

        Ok(Attribution {
            inviter: UserKey::new(self.platform, inviter_id),
            invited,
            source,
            code: join.invite_code_used.clone(),
        })
    }

    async fn count_use(
        &self,
        gateway: &PersistenceGateway,
        code: &str,
        inviter_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(), RallyError> {
        let mut record = gateway
            .lookup_invite_code(self.platform, code)
            .await?
            .unwrap_or_else(|| InviteRecord {
                platform: self.platform,
                invite_code: code.to_string(),
                inviter_id: inviter_id.to_string(),
                uses_count: 0,
                created_at: now,
            });
        record.uses_count += 1;
        gateway.upsert_invite_record(&record).await
    }
}
