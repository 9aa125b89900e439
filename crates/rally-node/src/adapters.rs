//! Discord and Telegram adapters
//!
//! Both read the platform's own JSON payloads (Discord gateway dispatches,
//! Telegram bot API updates) and write outbound actions to a shared
//! [`Outbox`], which the node drains to stdout as JSON lines.

use crate::config::{Credentials, PlatformSettings};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rally_core::{ActivityEvent, JoinEvent, LeaveEvent, Platform, PlatformError, UserKey};
use rally_engine::{EngineInput, LiveInvite, Notification, PlatformAdapter};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;

/// Action the node asks a platform to perform
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Outbound {
    Notify {
        platform: Platform,
        user_id: String,
        text: String,
        notification: Notification,
    },
    Restrict {
        platform: Platform,
        user_id: String,
        duration_secs: u64,
    },
}

/// Sending half of the outbound action queue
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Outbox {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn push(&self, action: Outbound) -> Result<(), PlatformError> {
        self.tx
            .send(action)
            .map_err(|_| PlatformError::SendFailed("outbox closed".to_string()))
    }
}

/// Settings shared by both adapters
struct AdapterCore {
    platform: Platform,
    bot_user_id: Option<String>,
    native_restrictions: bool,
    live_invites: Vec<LiveInvite>,
    outbox: Outbox,
}

impl AdapterCore {
    fn new(settings: &PlatformSettings, credentials: &Credentials, outbox: Outbox) -> Self {
        tracing::info!(
            platform = %settings.platform,
            token = %credentials.masked(),
            native_restrictions = settings.native_restrictions,
            "Platform adapter configured"
        );
        Self {
            platform: settings.platform,
            bot_user_id: settings.bot_user_id.clone(),
            native_restrictions: settings.native_restrictions,
            live_invites: settings.live_invites.clone(),
            outbox,
        }
    }

    fn notify(&self, notification: Notification) -> Result<(), PlatformError> {
        let user_id = notification.user().user_id.clone();
        let text = notification.render();
        tracing::debug!(platform = %self.platform, user = %user_id, text = %text, "Sending notification");
        self.outbox.push(Outbound::Notify {
            platform: self.platform,
            user_id,
            text,
            notification,
        })
    }

    fn restrict(&self, user: &UserKey, duration: Duration) -> Result<(), PlatformError> {
        if !self.native_restrictions {
            return Err(PlatformError::RestrictionUnsupported);
        }
        self.outbox.push(Outbound::Restrict {
            platform: self.platform,
            user_id: user.user_id.clone(),
            duration_secs: duration.as_secs(),
        })
    }
}

/// Platform ids arrive as strings (Discord snowflakes) or numbers (Telegram)
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// Discord gateway payloads

#[derive(Deserialize)]
struct DiscordDispatch {
    t: Option<String>,
    #[serde(default)]
    d: Value,
}

#[derive(Deserialize)]
struct DiscordUser {
    id: Value,
    #[serde(default)]
    bot: bool,
}

#[derive(Deserialize)]
struct DiscordMessage {
    id: Value,
    channel_id: Option<Value>,
    author: DiscordUser,
    #[serde(default)]
    content: String,
    timestamp: DateTime<Utc>,
}

#[derive(Deserialize)]
struct DiscordMember {
    user: DiscordUser,
    #[serde(default)]
    joined_at: Option<DateTime<Utc>>,
    /// Resolved by the client from invite use counts
    #[serde(default)]
    invite_code: Option<String>,
    #[serde(default)]
    inviter_id: Option<Value>,
}

/// Adapter for Discord gateway dispatches
pub struct DiscordAdapter {
    core: AdapterCore,
}

impl DiscordAdapter {
    pub fn new(settings: &PlatformSettings, credentials: &Credentials, outbox: Outbox) -> Self {
        Self {
            core: AdapterCore::new(settings, credentials, outbox),
        }
    }

    fn dispatch(raw: &Value) -> Option<DiscordDispatch> {
        serde_json::from_value(raw.clone()).ok()
    }

    /// Member join/leave carried by a dispatch, if any
    pub fn membership(raw: &Value, now: DateTime<Utc>) -> Option<EngineInput<Value>> {
        let dispatch = Self::dispatch(raw)?;
        match dispatch.t.as_deref()? {
            "GUILD_MEMBER_ADD" => {
                let member: DiscordMember = serde_json::from_value(dispatch.d).ok()?;
                if member.user.bot {
                    return None;
                }
                Some(EngineInput::Join(JoinEvent {
                    platform: Platform::Discord,
                    new_user_id: id_string(&member.user.id)?,
                    invite_code_used: member.invite_code,
                    platform_inviter_id: member.inviter_id.as_ref().and_then(id_string),
                    joined_at: member.joined_at.unwrap_or(now),
                }))
            }
            "GUILD_MEMBER_REMOVE" => {
                let member: DiscordMember = serde_json::from_value(dispatch.d).ok()?;
                Some(EngineInput::Leave(LeaveEvent {
                    platform: Platform::Discord,
                    user_id: id_string(&member.user.id)?,
                    left_at: now,
                }))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl PlatformAdapter for DiscordAdapter {
    type Raw = Value;

    fn platform(&self) -> Platform {
        Platform::Discord
    }

    fn bot_user_id(&self) -> Option<&str> {
        self.core.bot_user_id.as_deref()
    }

    fn normalize_event(&self, raw: &Value) -> Option<ActivityEvent> {
        let dispatch = Self::dispatch(raw)?;
        if dispatch.t.as_deref() != Some("MESSAGE_CREATE") {
            return None;
        }
        let message: DiscordMessage = serde_json::from_value(dispatch.d).ok()?;
        if message.author.bot {
            return None;
        }

        Some(ActivityEvent {
            platform: Platform::Discord,
            user_id: id_string(&message.author.id)?,
            event_id: id_string(&message.id)?,
            chat_id: message.channel_id.as_ref().and_then(id_string),
            text: message.content,
            timestamp: message.timestamp,
        })
    }

    async fn send_notification(&self, notification: Notification) -> Result<(), PlatformError> {
        self.core.notify(notification)
    }

    async fn restrict_user(&self, user: &UserKey, duration: Duration) -> Result<(), PlatformError> {
        self.core.restrict(user, duration)
    }

    async fn live_invites(&self) -> Result<Vec<LiveInvite>, PlatformError> {
        Ok(self.core.live_invites.clone())
    }
}

// Telegram bot API updates

#[derive(Deserialize)]
struct TelegramUpdate {
    #[serde(default)]
    update_id: Option<i64>,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    chat_member: Option<TelegramChatMemberUpdated>,
}

#[derive(Deserialize)]
struct TelegramUser {
    id: Value,
    #[serde(default)]
    is_bot: bool,
}

#[derive(Deserialize)]
struct TelegramChat {
    id: Value,
}

#[derive(Deserialize)]
struct TelegramMessage {
    message_id: Value,
    #[serde(default)]
    from: Option<TelegramUser>,
    chat: TelegramChat,
    date: i64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    /// Service message: members added or joined
    #[serde(default)]
    new_chat_members: Vec<TelegramUser>,
    /// Service message: member removed or left
    #[serde(default)]
    left_chat_member: Option<TelegramUser>,
}

#[derive(Deserialize)]
struct TelegramChatMember {
    user: TelegramUser,
    status: String,
}

#[derive(Deserialize)]
struct TelegramInviteLink {
    invite_link: String,
    creator: TelegramUser,
}

#[derive(Deserialize)]
struct TelegramChatMemberUpdated {
    from: TelegramUser,
    date: i64,
    old_chat_member: TelegramChatMember,
    new_chat_member: TelegramChatMember,
    #[serde(default)]
    invite_link: Option<TelegramInviteLink>,
}

fn is_present(status: &str) -> bool {
    matches!(status, "member" | "restricted" | "administrator" | "creator")
}

fn unix_time(secs: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Adapter for Telegram bot API updates
pub struct TelegramAdapter {
    core: AdapterCore,
}

impl TelegramAdapter {
    pub fn new(settings: &PlatformSettings, credentials: &Credentials, outbox: Outbox) -> Self {
        Self {
            core: AdapterCore::new(settings, credentials, outbox),
        }
    }

    fn update(raw: &Value) -> Option<TelegramUpdate> {
        serde_json::from_value(raw.clone()).ok()
    }

    /// Member joins and leaves carried by an update: a `chat_member`
    /// transition or the `new_chat_members` / `left_chat_member` service
    /// messages
    pub fn membership(raw: &Value) -> Vec<EngineInput<Value>> {
        let Some(update) = Self::update(raw) else {
            return Vec::new();
        };
        if let Some(change) = update.chat_member {
            return Self::member_transition(change).into_iter().collect();
        }
        update
            .message
            .map(Self::service_membership)
            .unwrap_or_default()
    }

    fn service_membership(message: TelegramMessage) -> Vec<EngineInput<Value>> {
        let Some(at) = unix_time(message.date) else {
            return Vec::new();
        };
        let actor = message.from.as_ref().and_then(|from| id_string(&from.id));

        let mut inputs: Vec<_> = message
            .new_chat_members
            .iter()
            .filter(|member| !member.is_bot)
            .filter_map(|member| {
                let user_id = id_string(&member.id)?;
                // `from` is the member themselves when they joined by link
                let inviter = actor.clone().filter(|id| *id != user_id);
                Some(EngineInput::Join(JoinEvent {
                    platform: Platform::Telegram,
                    new_user_id: user_id,
                    invite_code_used: None,
                    platform_inviter_id: inviter,
                    joined_at: at,
                }))
            })
            .collect();

        if let Some(user_id) = message
            .left_chat_member
            .filter(|member| !member.is_bot)
            .and_then(|member| id_string(&member.id))
        {
            inputs.push(EngineInput::Leave(LeaveEvent {
                platform: Platform::Telegram,
                user_id,
                left_at: at,
            }));
        }
        inputs
    }

    fn member_transition(change: TelegramChatMemberUpdated) -> Option<EngineInput<Value>> {
        let was_present = is_present(&change.old_chat_member.status);
        let now_present = is_present(&change.new_chat_member.status);
        let user = &change.new_chat_member.user;
        if user.is_bot {
            return None;
        }
        let user_id = id_string(&user.id)?;
        let at = unix_time(change.date)?;

        match (was_present, now_present) {
            (false, true) => {
                let (code, inviter) = match &change.invite_link {
                    Some(link) => (Some(link.invite_link.clone()), id_string(&link.creator.id)),
                    // Added directly by another member
                    None => (None, id_string(&change.from.id).filter(|id| *id != user_id)),
                };
                Some(EngineInput::Join(JoinEvent {
                    platform: Platform::Telegram,
                    new_user_id: user_id,
                    invite_code_used: code,
                    platform_inviter_id: inviter,
                    joined_at: at,
                }))
            }
            (true, false) => Some(EngineInput::Leave(LeaveEvent {
                platform: Platform::Telegram,
                user_id,
                left_at: at,
            })),
            _ => None,
        }
    }
}

#[async_trait]
impl PlatformAdapter for TelegramAdapter {
    type Raw = Value;

    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    fn bot_user_id(&self) -> Option<&str> {
        self.core.bot_user_id.as_deref()
    }

    fn normalize_event(&self, raw: &Value) -> Option<ActivityEvent> {
        let update = Self::update(raw)?;
        let message = update.message?;
        let from = message.from?;
        if from.is_bot {
            return None;
        }
        let text = message.text.or(message.caption)?;

        let event_id = match update.update_id {
            Some(id) => id.to_string(),
            None => format!("{}:{}", id_string(&message.chat.id)?, id_string(&message.message_id)?),
        };

        Some(ActivityEvent {
            platform: Platform::Telegram,
            user_id: id_string(&from.id)?,
            event_id,
            chat_id: id_string(&message.chat.id),
            text,
            timestamp: unix_time(message.date)?,
        })
    }

    async fn send_notification(&self, notification: Notification) -> Result<(), PlatformError> {
        self.core.notify(notification)
    }

    async fn restrict_user(&self, user: &UserKey, duration: Duration) -> Result<(), PlatformError> {
        self.core.restrict(user, duration)
    }

    async fn live_invites(&self) -> Result<Vec<LiveInvite>, PlatformError> {
        Ok(self.core.live_invites.clone())
    }
}

/// Route a raw payload to the engine inputs it represents. A payload
/// without membership changes is a message.
pub fn classify(platform: Platform, payload: Value, now: DateTime<Utc>) -> Vec<EngineInput<Value>> {
    let membership: Vec<_> = match platform {
        Platform::Discord => DiscordAdapter::membership(&payload, now).into_iter().collect(),
        Platform::Telegram => TelegramAdapter::membership(&payload),
    };
    if membership.is_empty() {
        vec![EngineInput::Message(payload)]
    } else {
        membership
    }
}
