//! # Rally Engine
//!
//! Generic engagement reward engine. One [`RewardEngine`] runs per chat
//! platform; what differs between platforms lives behind
//! [`PlatformAdapter`], storage behind [`ActivityStore`].
//!
//! ## Components
//!
//! - [`Deduplicator`] - bounded, TTL-expiring set of seen event keys
//! - [`AntiAbuseGate`] - rate windows, spam signatures, escalating restrictions
//! - [`UserStateCache`] - LRU cache of committed XP plus pending deltas
//! - [`XpBatchAccumulator`] - per-user additive merge queue
//! - [`PersistenceGateway`] - circuit-breaker-wrapped storage calls
//! - [`InviteAttributionResolver`] - fallback chain for invite attribution
//!
//! All state lives in an [`EngineState`] owned by the engine; nothing is global.

pub mod abuse;
pub mod batch;
pub mod breaker;
pub mod cache;
pub mod clock;
pub mod config;
pub mod dedup;
pub mod engine;
pub mod gateway;
pub mod invite;
pub mod metrics;
pub mod platform;
pub mod store;

pub use abuse::{AntiAbuseGate, GateDecision, RateViolation, RejectReason, SpamSignature, Standing};
pub use batch::{BatchQueueEntry, FlushReport, XpBatchAccumulator};
pub use breaker::{BreakerState, CircuitBreaker};
pub use cache::{CacheEntry, CacheStats, UserStateCache};
pub use config::*;
pub use dedup::Deduplicator;
pub use engine::{EngineInput, EngineState, EventOutcome, InviteOutcome, MaintenanceReport, RewardEngine};
pub use gateway::PersistenceGateway;
pub use invite::{
    Attribution, AttributionSource, DeferredJoin, DeferredJoins, InviteAttributionResolver,
    InviteCode,
};
pub use metrics::EngineMetrics;
pub use platform::{LiveInvite, Notification, PlatformAdapter, RecordingAdapter};
pub use store::{ActivityStore, MemoryStore};
