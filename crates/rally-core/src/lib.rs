//! # Rally Core
//!
//! Core data model for the Rally engagement reward engine.
//!
//! This crate provides the fundamental building blocks shared by every
//! platform integration:
//! - `ActivityEvent` - a normalized chat message from any platform
//! - `UserActivity` - the persisted XP row of a user
//! - `Level` - the deterministic XP tier (Bronze through Diamond)
//! - `InviteRecord` / `InvitedUserRecord` - invite attribution state
//!
//! ## Pipeline
//!
//! ```text
//!   Platform event ──► Normalizer ──► Deduplicator ──► Anti-Abuse Gate
//!                                                           │
//!                                                           ▼
//!   Notification ◄── Level Resolver ◄── Persistence ◄── XP Batch Accumulator
//!                                        Gateway             │
//!                                           ▲                ▼
//!   Member joined ──► Invite Attribution ───┘        User State Cache
//! ```

pub mod error;
pub mod level;
pub mod types;

pub use error::*;
pub use level::*;
pub use types::*;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::error::{RallyError, Result, StoreError};
    pub use crate::level::{Level, LevelThresholds, LevelUp};
    pub use crate::types::*;
}
