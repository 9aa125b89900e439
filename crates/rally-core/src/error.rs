//! Error types for Rally

use thiserror::Error;

/// Result type alias for Rally operations
pub type Result<T> = std::result::Result<T, RallyError>;

/// Errors raised by the reward engine.
///
/// Duplicate events and rate/spam rejections are not errors; they are
/// reported as event outcomes.
#[derive(Error, Debug)]
pub enum RallyError {
    /// Storage call failed; retried on the next cycle
    #[error("Storage error: {0}")]
    Storage(#[from] StoreError),

    /// Persistence circuit is open, call rejected without touching storage
    #[error("Persistence circuit open, retry in {retry_in_ms}ms")]
    CircuitOpen { retry_in_ms: u64 },

    /// Invite resolution found no eligible inviter
    #[error("Invalid attribution: {0}")]
    InvalidAttribution(String),

    /// Missing or inconsistent configuration (fatal at startup only)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Platform collaborator failed
    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RallyError {
    /// Transient failures are logged and retried, never fatal
    pub fn is_transient(&self) -> bool {
        matches!(self, RallyError::Storage(_) | RallyError::CircuitOpen { .. })
    }
}

impl From<serde_json::Error> for RallyError {
    fn from(e: serde_json::Error) -> Self {
        RallyError::Serialization(e.to_string())
    }
}

/// Errors reported by the relational store collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store timed out after {0}ms")]
    Timeout(u64),

    #[error("write rejected: {0}")]
    Rejected(String),
}

/// Errors reported by the chat platform collaborator
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Native restriction not supported on this platform/chat")]
    RestrictionUnsupported,

    #[error("Restriction failed: {0}")]
    RestrictionFailed(String),

    #[error("Rate limited by platform: {0}")]
    RateLimited(String),

    #[error("Invalid credentials for platform: {0}")]
    InvalidCredentials(String),
}
