//! Platform adapters
//!
//! One engine serves every chat platform; what differs per platform lives
//! behind [`PlatformAdapter`].

use async_trait::async_trait;
use parking_lot::Mutex;
use rally_core::{ActivityEvent, Level, Platform, PlatformError, UserKey};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Message sent back to the chat platform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notification {
    LevelUp {
        user: UserKey,
        old: Level,
        new: Level,
    },
    Punishment {
        user: UserKey,
        duration_secs: u64,
    },
    InviteReward {
        inviter: UserKey,
        invited: UserKey,
    },
}

impl Notification {
    /// User the notification is about
    pub fn user(&self) -> &UserKey {
        match self {
            Notification::LevelUp { user, .. } => user,
            Notification::Punishment { user, .. } => user,
            Notification::InviteReward { inviter, .. } => inviter,
        }
    }

    /// Human-readable text
    pub fn render(&self) -> String {
        match self {
            Notification::LevelUp { user, old, new } => format!(
                "{} reached {}, up from {}. Daily reward is now {} tokens.",
                user.user_id,
                new,
                old.name(),
                new.daily_reward()
            ),
            Notification::Punishment {
                user,
                duration_secs,
            } => format!(
                "{} is muted for {} for spamming.",
                user.user_id,
                humanize(*duration_secs)
            ),
            Notification::InviteReward { inviter, invited } => format!(
                "{} earned an invite reward for bringing in {}.",
                inviter.user_id, invited.user_id
            ),
        }
    }
}

fn humanize(secs: u64) -> String {
    match secs {
        s if s >= 3600 && s % 3600 == 0 => format!("{}h", s / 3600),
        s if s >= 60 && s % 60 == 0 => format!("{}m", s / 60),
        s => format!("{}s", s),
    }
}

/// A live invite as listed by the platform at startup
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveInvite {
    pub code: String,
    pub inviter_id: String,
}

/// Platform-specific side of the engine
#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    /// Raw event type delivered by the platform client
    type Raw: Send + Sync;

    fn platform(&self) -> Platform;

    /// User id of the bot/app itself, if known
    fn bot_user_id(&self) -> Option<&str>;

    /// Canonical event, or `None` for payloads that are not chat messages
    fn normalize_event(&self, raw: &Self::Raw) -> Option<ActivityEvent>;

    async fn send_notification(&self, notification: Notification) -> Result<(), PlatformError>;

    /// Mute `user` for `duration`.
    ///
    /// `RestrictionUnsupported` makes the engine enforce the restriction
    /// as a local ban instead.
    async fn restrict_user(&self, user: &UserKey, duration: Duration) -> Result<(), PlatformError>;

    /// Invites currently known to the platform, used to seed in-memory attribution
    async fn live_invites(&self) -> Result<Vec<LiveInvite>, PlatformError> {
        Ok(Vec::new())
    }
}

/// Adapter that records every outbound call; raw events are already canonical
pub struct RecordingAdapter {
    platform: Platform,
    bot_user_id: Option<String>,
    native_restrictions: bool,
    fail_notifications: bool,
    invites: Vec<LiveInvite>,
    sent: Mutex<Vec<Notification>>,
    restricted: Mutex<Vec<(UserKey, Duration)>>,
}

impl RecordingAdapter {
    pub fn new(platform: Platform) -> Self {
        Self {
            platform,
            bot_user_id: None,
            native_restrictions: true,
            fail_notifications: false,
            invites: Vec::new(),
            sent: Mutex::new(Vec::new()),
            restricted: Mutex::new(Vec::new()),
        }
    }

    pub fn with_bot_user(mut self, id: impl Into<String>) -> Self {
        self.bot_user_id = Some(id.into());
        self
    }

    /// Report `RestrictionUnsupported` for every restriction
    pub fn without_native_restrictions(mut self) -> Self {
        self.native_restrictions = false;
        self
    }

    /// Fail every notification send
    pub fn failing_notifications(mut self) -> Self {
        self.fail_notifications = true;
        self
    }

    pub fn with_live_invites(mut self, invites: Vec<LiveInvite>) -> Self {
        self.invites = invites;
        self
    }

    /// Notifications sent so far, failed attempts included
    pub fn sent(&self) -> Vec<Notification> {
        self.sent.lock().clone()
    }

    pub fn restricted(&self) -> Vec<(UserKey, Duration)> {
        self.restricted.lock().clone()
    }
}

#[async_trait]
impl PlatformAdapter for RecordingAdapter {
    type Raw = ActivityEvent;

    fn platform(&self) -> Platform {
        self.platform
    }

    fn bot_user_id(&self) -> Option<&str> {
        self.bot_user_id.as_deref()
    }

    fn normalize_event(&self, raw: &ActivityEvent) -> Option<ActivityEvent> {
        (raw.platform == self.platform).then(|| raw.clone())
    }

    async fn send_notification(&self, notification: Notification) -> Result<(), PlatformError> {
        self.sent.lock().push(notification);
        if self.fail_notifications {
            return Err(PlatformError::SendFailed("recording adapter".to_string()));
        }
        Ok(())
    }

    async fn restrict_user(&self, user: &UserKey, duration: Duration) -> Result<(), PlatformError> {
        if !self.native_restrictions {
            return Err(PlatformError::RestrictionUnsupported);
        }
        self.restricted.lock().push((user.clone(), duration));
        Ok(())
    }

    async fn live_invites(&self) -> Result<Vec<LiveInvite>, PlatformError> {
        Ok(self.invites.clone())
    }
}
