//! Engine configuration
//!
//! Every value is tunable; defaults are the reference values the engine
//! was sized for.

use rally_core::{LevelThresholds, RallyError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Complete engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// XP awarded per accepted message
    #[serde(default = "default_xp_per_message")]
    pub xp_per_message: u64,

    /// Only users who linked their account earn message XP
    #[serde(default = "default_true")]
    pub require_linked_account: bool,

    /// Interval of the eviction sweep over dedup keys, rate windows and cache
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,

    #[serde(default)]
    pub dedup: DedupConfig,

    #[serde(default)]
    pub abuse: AbuseConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub levels: LevelThresholds,

    #[serde(default)]
    pub invites: InviteConfig,
}

fn default_xp_per_message() -> u64 {
    1
}

fn default_true() -> bool {
    true
}

fn default_maintenance_interval() -> u64 {
    60
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            xp_per_message: default_xp_per_message(),
            require_linked_account: true,
            maintenance_interval_secs: default_maintenance_interval(),
            dedup: DedupConfig::default(),
            abuse: AbuseConfig::default(),
            cache: CacheConfig::default(),
            batch: BatchConfig::default(),
            breaker: BreakerConfig::default(),
            levels: LevelThresholds::default(),
            invites: InviteConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> Result<(), RallyError> {
        fn non_zero(value: u64, name: &str) -> Result<(), RallyError> {
            if value == 0 {
                return Err(RallyError::Configuration(format!("{} must be above 0", name)));
            }
            Ok(())
        }

        non_zero(self.dedup.capacity as u64, "dedup.capacity")?;
        non_zero(self.dedup.ttl_secs, "dedup.ttl_secs")?;
        non_zero(self.abuse.max_per_minute as u64, "abuse.max_per_minute")?;
        non_zero(self.abuse.max_per_hour as u64, "abuse.max_per_hour")?;
        non_zero(self.abuse.warning_threshold as u64, "abuse.warning_threshold")?;
        non_zero(self.cache.max_entries as u64, "cache.max_entries")?;
        non_zero(self.batch.batch_size as u64, "batch.batch_size")?;
        non_zero(self.batch.flush_interval_secs, "batch.flush_interval_secs")?;
        non_zero(self.breaker.failure_threshold as u64, "breaker.failure_threshold")?;
        non_zero(self.maintenance_interval_secs, "maintenance_interval_secs")?;

        if self.abuse.max_per_hour < self.abuse.max_per_minute {
            return Err(RallyError::Configuration(
                "abuse.max_per_hour must be >= abuse.max_per_minute".to_string(),
            ));
        }
        if self.abuse.punishment_ladder_secs.is_empty()
            || self.abuse.punishment_ladder_secs.contains(&0)
        {
            return Err(RallyError::Configuration(
                "abuse.punishment_ladder_secs needs at least one non-zero duration".to_string(),
            ));
        }
        for pattern in &self.abuse.extra_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                RallyError::Configuration(format!("invalid spam pattern {:?}: {}", pattern, e))
            })?;
        }
        if self.invites.code_prefix.is_empty() || self.invites.code_prefix.contains('-') {
            return Err(RallyError::Configuration(
                "invites.code_prefix must be non-empty and must not contain '-'".to_string(),
            ));
        }

        self.levels.validate()
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.batch.flush_interval_secs)
    }

    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_secs)
    }
}

/// Deduplicator settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Maximum remembered event keys
    #[serde(default = "default_dedup_capacity")]
    pub capacity: usize,

    /// How long a key is remembered
    #[serde(default = "default_dedup_ttl")]
    pub ttl_secs: u64,
}

fn default_dedup_capacity() -> usize {
    5000
}

fn default_dedup_ttl() -> u64 {
    300
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            capacity: default_dedup_capacity(),
            ttl_secs: default_dedup_ttl(),
        }
    }
}

/// What happens to the warning counter around a restriction
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningDecay {
    /// Warnings drop to zero as soon as a restriction is applied
    #[default]
    Reset,
    /// Warnings are kept during the restriction and drop by one when it expires
    DecayOnExpiry,
}

/// Anti-abuse gate settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AbuseConfig {
    /// Accepted messages allowed in any trailing 60s
    #[serde(default = "default_max_per_minute")]
    pub max_per_minute: u32,

    /// Accepted messages allowed in any trailing hour
    #[serde(default = "default_max_per_hour")]
    pub max_per_hour: u32,

    /// Minimum gap between accepted messages (ms)
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,

    /// Messages shorter than this (characters) earn no XP
    #[serde(default = "default_min_length")]
    pub min_length: usize,

    /// Warnings before a restriction is applied
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: u32,

    /// Restriction durations by offense count; the last entry repeats
    #[serde(default = "default_punishment_ladder")]
    pub punishment_ladder_secs: Vec<u64>,

    #[serde(default)]
    pub warning_decay: WarningDecay,

    /// Rate windows idle for this long are evicted (unless punished)
    #[serde(default = "default_window_idle_ttl")]
    pub window_idle_ttl_secs: u64,

    /// Enable the built-in spam signatures
    #[serde(default = "default_true")]
    pub builtin_patterns: bool,

    /// Additional spam signatures (regular expressions)
    #[serde(default)]
    pub extra_patterns: Vec<String>,
}

fn default_max_per_minute() -> u32 {
    10
}

fn default_max_per_hour() -> u32 {
    100
}

fn default_min_interval_ms() -> u64 {
    1000
}

fn default_min_length() -> usize {
    10
}

fn default_warning_threshold() -> u32 {
    2
}

fn default_punishment_ladder() -> Vec<u64> {
    vec![5 * 60, 30 * 60, 24 * 60 * 60]
}

fn default_window_idle_ttl() -> u64 {
    3600
}

impl Default for AbuseConfig {
    fn default() -> Self {
        Self {
            max_per_minute: default_max_per_minute(),
            max_per_hour: default_max_per_hour(),
            min_interval_ms: default_min_interval_ms(),
            min_length: default_min_length(),
            warning_threshold: default_warning_threshold(),
            punishment_ladder_secs: default_punishment_ladder(),
            warning_decay: WarningDecay::default(),
            window_idle_ttl_secs: default_window_idle_ttl(),
            builtin_patterns: true,
            extra_patterns: Vec::new(),
        }
    }
}

/// User state cache settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,

    #[serde(default = "default_cache_idle_ttl")]
    pub idle_ttl_secs: u64,
}

fn default_cache_entries() -> usize {
    1000
}

fn default_cache_idle_ttl() -> u64 {
    600
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
            idle_ttl_secs: default_cache_idle_ttl(),
        }
    }
}

/// What to do with entries of a failed batch flush
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Log and discard
    Drop,
    /// Merge back into the queue, at most `max_retries` times per entry
    Requeue { max_retries: u32 },
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Requeue { max_retries: 3 }
    }
}

/// XP batch accumulator settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Queue length that triggers an immediate flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Timer flush interval
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

fn default_batch_size() -> usize {
    50
}

fn default_flush_interval() -> u64 {
    30
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_secs: default_flush_interval(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

/// Circuit breaker settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the circuit stays open before a probe is allowed (ms)
    #[serde(default = "default_open_timeout")]
    pub open_timeout_ms: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout() -> u64 {
    60_000
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_ms: default_open_timeout(),
        }
    }
}

/// Invite attribution settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InviteConfig {
    /// XP awarded to the inviter, through the batch accumulator
    #[serde(default = "default_invite_xp")]
    pub xp_reward: u64,

    /// Token-style reward recorded for the inviter
    #[serde(default = "default_invite_tokens")]
    pub token_reward: u64,

    /// Days after leaving before a user can be attributed again
    #[serde(default = "default_rejoin_window")]
    pub rejoin_window_days: i64,

    /// Prefix of invite codes issued by this process
    #[serde(default = "default_code_prefix")]
    pub code_prefix: String,

    /// Joins held for retry after a storage failure; the oldest is dropped
    /// when full
    #[serde(default = "default_deferred_capacity")]
    pub deferred_capacity: usize,

    /// Retries of a deferred join before it is given up
    #[serde(default = "default_deferred_max_retries")]
    pub deferred_max_retries: u32,
}

fn default_invite_xp() -> u64 {
    50
}

fn default_invite_tokens() -> u64 {
    10
}

fn default_rejoin_window() -> i64 {
    30
}

fn default_code_prefix() -> String {
    "rly".to_string()
}

fn default_deferred_capacity() -> usize {
    1_000
}

fn default_deferred_max_retries() -> u32 {
    3
}

impl Default for InviteConfig {
    fn default() -> Self {
        Self {
            xp_reward: default_invite_xp(),
            token_reward: default_invite_tokens(),
            rejoin_window_days: default_rejoin_window(),
            code_prefix: default_code_prefix(),
            deferred_capacity: default_deferred_capacity(),
            deferred_max_retries: default_deferred_max_retries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"batch": {"batch_size": 30}}"#).unwrap();
        assert_eq!(config.batch.batch_size, 30);
        assert_eq!(config.batch.flush_interval_secs, 30);
        assert_eq!(config.abuse.max_per_minute, 10);
        assert_eq!(config.batch.retry_policy, RetryPolicy::Requeue { max_retries: 3 });
    }

    #[test]
    fn test_warning_decay_defaults_to_reset() {
        let config: AbuseConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.warning_decay, WarningDecay::Reset);

        let config: AbuseConfig =
            serde_json::from_str(r#"{"warning_decay": "decay_on_expiry"}"#).unwrap();
        assert_eq!(config.warning_decay, WarningDecay::DecayOnExpiry);
    }

    #[test]
    fn test_deferred_join_defaults() {
        let config: InviteConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.deferred_capacity, 1_000);
        assert_eq!(config.deferred_max_retries, 3);
    }

    #[test]
    fn test_retry_policy_tagged() {
        let config: BatchConfig = serde_json::from_str(r#"{"retry_policy": {"mode": "drop"}}"#).unwrap();
        assert_eq!(config.retry_policy, RetryPolicy::Drop);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = EngineConfig::default();
        config.batch.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.abuse.extra_patterns = vec!["(unclosed".to_string()];
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.abuse.punishment_ladder_secs.clear();
        assert!(config.validate().is_err());
    }
}
