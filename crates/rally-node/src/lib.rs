//! # Rally Node
//!
//! Runs the reward engine for Discord and Telegram: configuration, platform
//! adapters, JSON-lines ingest and the metrics endpoint.

pub mod adapters;
pub mod config;
pub mod ingest;
pub mod metrics;
pub mod node;

pub use adapters::{DiscordAdapter, Outbound, Outbox, TelegramAdapter};
pub use config::{Credentials, NodeConfig, PlatformSettings};
pub use ingest::{IngestStats, Router};
pub use node::{NodeReport, RallyNode};
