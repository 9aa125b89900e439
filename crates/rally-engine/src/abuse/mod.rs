//! Anti-Abuse Gate
//!
//! Sliding-window rate limiting, spam signature matching and an escalating
//! punishment state machine per user:
//!
//! ```text
//! NORMAL ──► WARNED(1) ──► ... ──► RESTRICTED ──(timer)──► NORMAL
//!                                   └─ BANNED (local) when the platform
//!                                      cannot restrict natively
//! ```
//!
//! Rate and spam rejections add a warning; repeated content is rejected
//! without a warning; short messages are accepted but earn no XP.

mod patterns;
mod window;

pub use patterns::*;
pub use window::*;

use crate::config::{AbuseConfig, WarningDecay};
use dashmap::DashMap;
use rally_core::UserKey;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Why a message was refused
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    Rate(RateViolation),
    Spam(SpamSignature),
    RepeatedContent,
}

impl RejectReason {
    /// Rate and spam rejections count towards a restriction
    pub fn escalates(&self) -> bool {
        !matches!(self, RejectReason::RepeatedContent)
    }

    pub fn label(&self) -> &'static str {
        match self {
            RejectReason::Rate(v) => v.label(),
            RejectReason::Spam(s) => s.label(),
            RejectReason::RepeatedContent => "repeated_content",
        }
    }
}

/// Gate verdict for one message
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateDecision {
    /// Passed every check; `award_xp` is false for messages under the length floor
    Accept { award_xp: bool },

    /// Refused; `warnings` is the counter after this message
    Reject { reason: RejectReason, warnings: u32 },

    /// Refused and the warning threshold was reached: restrict the user
    Restrict {
        reason: RejectReason,
        duration: Duration,
        offense: u32,
    },

    /// User is serving a restriction
    Punished { remaining: Duration },
}

/// Observable punishment state of a user
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Standing {
    Normal,
    Warned(u32),
    Restricted { remaining: Duration },
    Banned { remaining: Duration },
}

/// Per-user anti-abuse state
pub struct AntiAbuseGate {
    config: AbuseConfig,
    patterns: SpamPatterns,
    windows: DashMap<UserKey, RateWindow>,
}

impl AntiAbuseGate {
    pub fn new(config: AbuseConfig) -> Self {
        let patterns = SpamPatterns::new(config.builtin_patterns, &config.extra_patterns);
        Self {
            config,
            patterns,
            windows: DashMap::new(),
        }
    }

    /// Run every check for a message received at `now`
    pub fn check(&self, key: &UserKey, text: &str, now: Instant) -> GateDecision {
        let mut window = self
            .windows
            .entry(key.clone())
            .or_insert_with(|| RateWindow::new(now));
        window.last_seen = now;

        if let Some(until) = window.punished_until {
            if now < until {
                return GateDecision::Punished {
                    remaining: until - now,
                };
            }
            self.expire_punishment(&mut window, key);
        }

        window.prune(now);

        let rejection = window
            .violation(now, &self.config)
            .map(RejectReason::Rate)
            .or_else(|| self.patterns.detect(text).map(RejectReason::Spam))
            .or_else(|| {
                (window.last_text.as_deref() == Some(text)).then_some(RejectReason::RepeatedContent)
            });

        window.last_text = Some(text.to_string());

        match rejection {
            Some(reason) if reason.escalates() => self.escalate(&mut window, reason, now),
            Some(reason) => GateDecision::Reject {
                reason,
                warnings: window.warnings,
            },
            None => {
                window.record_accept(now);
                GateDecision::Accept {
                    award_xp: text.chars().count() >= self.config.min_length,
                }
            }
        }
    }

    /// The platform could not restrict natively; enforce the restriction as a local ban
    pub fn mark_banned_locally(&self, key: &UserKey) {
        if let Some(mut window) = self.windows.get_mut(key) {
            window.banned_locally = true;
        }
    }

    /// Current punishment state of a user
    pub fn standing(&self, key: &UserKey, now: Instant) -> Standing {
        let Some(window) = self.windows.get(key) else {
            return Standing::Normal;
        };

        match window.punished_until {
            Some(until) if now < until => {
                let remaining = until - now;
                if window.banned_locally {
                    Standing::Banned { remaining }
                } else {
                    Standing::Restricted { remaining }
                }
            }
            _ if window.warnings > 0 => Standing::Warned(window.warnings),
            _ => Standing::Normal,
        }
    }

    /// Evict windows idle for longer than the TTL; windows under punishment are kept
    pub fn evict_idle(&self, now: Instant) -> usize {
        let ttl = Duration::from_secs(self.config.window_idle_ttl_secs);
        let before = self.windows.len();
        self.windows.retain(|_, window| {
            window.is_punished(now) || now.saturating_duration_since(window.last_seen) < ttl
        });
        before - self.windows.len()
    }

    pub fn tracked_users(&self) -> usize {
        self.windows.len()
    }

    fn escalate(&self, window: &mut RateWindow, reason: RejectReason, now: Instant) -> GateDecision {
        window.warnings += 1;
        if window.warnings < self.config.warning_threshold {
            return GateDecision::Reject {
                reason,
                warnings: window.warnings,
            };
        }

        let ladder = &self.config.punishment_ladder_secs;
        let step = (window.offenses as usize).min(ladder.len().saturating_sub(1));
        let duration = Duration::from_secs(ladder.get(step).copied().unwrap_or(300));

        window.offenses += 1;
        window.punished_until = Some(now + duration);
        window.banned_locally = false;
        if self.config.warning_decay == WarningDecay::Reset {
            window.warnings = 0;
        }

        GateDecision::Restrict {
            reason,
            duration,
            offense: window.offenses,
        }
    }

    fn expire_punishment(&self, window: &mut RateWindow, key: &UserKey) {
        window.punished_until = None;
        window.banned_locally = false;
        if self.config.warning_decay == WarningDecay::DecayOnExpiry {
            window.warnings = window.warnings.saturating_sub(1);
        }
        tracing::debug!(user = %key, warnings = window.warnings, "Restriction expired");
    }
}
