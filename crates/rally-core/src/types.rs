//! Core type definitions for Rally

use crate::error::RallyError;
use crate::level::Level;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Chat platform an event originated from.
///
/// Each platform is a separate user-id namespace; the same numeric id on
/// Discord and Telegram names two different people.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Discord,
    Telegram,
}

impl Platform {
    /// Stable lowercase name, used in keys and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Discord => "discord",
            Platform::Telegram => "telegram",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = RallyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "discord" => Ok(Platform::Discord),
            "telegram" => Ok(Platform::Telegram),
            other => Err(RallyError::Configuration(format!(
                "unknown platform: {}",
                other
            ))),
        }
    }
}

/// Platform-scoped user identity
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserKey {
    pub platform: Platform,
    pub user_id: String,
}

impl UserKey {
    pub fn new(platform: Platform, user_id: impl Into<String>) -> Self {
        Self {
            platform,
            user_id: user_id.into(),
        }
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.platform, self.user_id)
    }
}

/// Canonical chat message, produced once per inbound platform message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityEvent {
    /// Source platform
    pub platform: Platform,

    /// Platform-scoped sender id
    pub user_id: String,

    /// Platform message id, unique per platform
    pub event_id: String,

    /// Chat/channel the message was posted in
    #[serde(default)]
    pub chat_id: Option<String>,

    /// Message text
    pub text: String,

    /// Platform timestamp of the message
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    /// Identity of the sender
    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.platform, self.user_id.clone())
    }

    /// Deduplication key: `platform:userId:eventId`
    pub fn dedup_key(&self) -> String {
        format!("{}:{}:{}", self.platform, self.user_id, self.event_id)
    }

    /// Message length in characters (not bytes)
    pub fn char_count(&self) -> usize {
        self.text.chars().count()
    }
}

/// "Member joined" event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinEvent {
    pub platform: Platform,

    /// The arriving user
    pub new_user_id: String,

    /// Invite code the platform says was used, if known
    #[serde(default)]
    pub invite_code_used: Option<String>,

    /// Inviter as reported by the platform API itself (least reliable)
    #[serde(default)]
    pub platform_inviter_id: Option<String>,

    pub joined_at: DateTime<Utc>,
}

impl JoinEvent {
    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.platform, self.new_user_id.clone())
    }
}

/// "Member left" event
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveEvent {
    pub platform: Platform,
    pub user_id: String,
    pub left_at: DateTime<Utc>,
}

impl LeaveEvent {
    pub fn user_key(&self) -> UserKey {
        UserKey::new(self.platform, self.user_id.clone())
    }
}

/// Persisted XP state of a user.
///
/// `current_level` is always derived from `total_xp` when a row is built;
/// it is stored for display only and never read back as a source of truth.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserActivity {
    pub platform: Platform,
    pub user_id: String,
    pub total_xp: u64,
    pub current_level: Level,
    pub message_count: u64,
    pub invite_count: u64,
    pub last_activity_at: DateTime<Utc>,
}

impl UserActivity {
    /// Fresh row for a user with no history
    pub fn empty(key: &UserKey, now: DateTime<Utc>) -> Self {
        Self {
            platform: key.platform,
            user_id: key.user_id.clone(),
            total_xp: 0,
            current_level: Level::Bronze,
            message_count: 0,
            invite_count: 0,
            last_activity_at: now,
        }
    }

    pub fn key(&self) -> UserKey {
        UserKey::new(self.platform, self.user_id.clone())
    }
}

/// Result of a storage read for one user
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserLookup {
    /// Whether the user linked their platform account to the rewards site
    pub linked: bool,

    /// Persisted activity row, if the user ever earned XP
    pub activity: Option<UserActivity>,
}

/// Why XP was queued for a user
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum XpReason {
    /// Chat message
    Message,
    /// Successful invite of a new member
    Invite,
    /// Several reasons merged in one batch window
    Mixed,
}

impl XpReason {
    /// Combine the reasons of two merged queue entries
    pub fn merge(self, other: XpReason) -> XpReason {
        if self == other {
            self
        } else {
            XpReason::Mixed
        }
    }
}

/// Persisted invite code
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteRecord {
    pub platform: Platform,
    pub invite_code: String,
    pub inviter_id: String,
    pub uses_count: u64,
    pub created_at: DateTime<Utc>,
}

/// Attribution of an arriving user to an inviter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvitedUserRecord {
    pub platform: Platform,
    pub invited_user_id: String,
    pub inviter_id: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub reward_claimed: bool,
}

impl InvitedUserRecord {
    /// Whether this record still blocks a new attribution at `now`.
    ///
    /// A record blocks while the user is still a member, and for
    /// `rejoin_window` after they left.
    pub fn blocks_reattribution(&self, now: DateTime<Utc>, rejoin_window: Duration) -> bool {
        match self.left_at {
            None => true,
            Some(left_at) => now - left_at <= rejoin_window,
        }
    }
}

/// Secondary token-style reward paid to an inviter
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InviteReward {
    pub platform: Platform,
    pub inviter_id: String,
    pub invited_user_id: String,
    pub amount: u64,
    pub granted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_dedup_key_format() {
        let event = ActivityEvent {
            platform: Platform::Telegram,
            user_id: "42".to_string(),
            event_id: "9001".to_string(),
            chat_id: None,
            text: "hello".to_string(),
            timestamp: Utc::now(),
        };
        assert_eq!(event.dedup_key(), "telegram:42:9001");
        assert_eq!(event.user_key().to_string(), "telegram:42");
    }

    #[test]
    fn test_platform_parse() {
        assert_eq!("Discord".parse::<Platform>().unwrap(), Platform::Discord);
        assert_eq!("telegram".parse::<Platform>().unwrap(), Platform::Telegram);
        assert!("slack".parse::<Platform>().is_err());
    }

    #[test]
    fn test_reason_merge() {
        assert_eq!(XpReason::Message.merge(XpReason::Message), XpReason::Message);
        assert_eq!(XpReason::Message.merge(XpReason::Invite), XpReason::Mixed);
    }

    #[test]
    fn test_invited_record_blocking() {
        let joined = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut record = InvitedUserRecord {
            platform: Platform::Discord,
            invited_user_id: "u".to_string(),
            inviter_id: "a".to_string(),
            joined_at: joined,
            left_at: None,
            reward_claimed: true,
        };
        let window = Duration::days(30);

        // Still a member
        assert!(record.blocks_reattribution(joined + Duration::days(365), window));

        record.left_at = Some(joined + Duration::days(1));
        assert!(record.blocks_reattribution(joined + Duration::days(10), window));
        assert!(!record.blocks_reattribution(joined + Duration::days(32), window));
    }
}
