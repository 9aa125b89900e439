//! Node configuration types

use rally_core::{Platform, RallyError};
use rally_engine::{EngineConfig, LiveInvite};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Prefix of environment overrides, e.g. `RALLY__METRICS__ENABLED=false`
pub const ENV_PREFIX: &str = "RALLY";

/// Complete node configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Reward engine tuning, shared by every platform
    #[serde(default)]
    pub engine: EngineConfig,

    /// Chat platforms to serve
    #[serde(default = "default_platforms")]
    pub platforms: Vec<PlatformSettings>,

    /// Event ingest
    #[serde(default)]
    pub ingest: IngestConfig,

    /// Activity store
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            platforms: default_platforms(),
            ingest: IngestConfig::default(),
            store: StoreConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_platforms() -> Vec<PlatformSettings> {
    vec![
        PlatformSettings::new(Platform::Discord, "DISCORD_BOT_TOKEN"),
        PlatformSettings::new(Platform::Telegram, "TELEGRAM_BOT_TOKEN"),
    ]
}

fn default_true() -> bool {
    true
}

/// One chat platform integration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlatformSettings {
    pub platform: Platform,

    /// Serve this platform
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Environment variable holding the bot token
    pub token_env: String,

    /// User id of the bot itself; attributions to it are ignored
    #[serde(default)]
    pub bot_user_id: Option<String>,

    /// The platform can mute users itself. Otherwise restrictions are
    /// enforced as local bans.
    #[serde(default = "default_true")]
    pub native_restrictions: bool,

    /// Invites that exist on the platform at startup
    #[serde(default)]
    pub live_invites: Vec<LiveInvite>,
}

impl PlatformSettings {
    pub fn new(platform: Platform, token_env: &str) -> Self {
        Self {
            platform,
            enabled: true,
            token_env: token_env.to_string(),
            bot_user_id: None,
            native_restrictions: true,
            live_invites: Vec::new(),
        }
    }
}

/// Bot token resolved from the environment
#[derive(Clone)]
pub struct Credentials {
    token: String,
}

impl Credentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Token safe for logs: first four characters only
    pub fn masked(&self) -> String {
        let visible: String = self.token.chars().take(4).collect();
        format!("{}…", visible)
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("token", &self.masked())
            .finish()
    }
}

/// Ingest configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IngestConfig {
    /// JSON-lines file of platform payloads; stdin when unset
    #[serde(default)]
    pub input: Option<PathBuf>,

    /// Bounded capacity of each engine's input channel
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,

    /// Keep the node running after the input is exhausted
    #[serde(default)]
    pub keep_running: bool,
}

fn default_channel_capacity() -> usize {
    1024
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            input: None,
            channel_capacity: default_channel_capacity(),
            keep_running: false,
        }
    }
}

/// Store configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// JSON snapshot loaded at startup and written on shutdown
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: `text` or `json`
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Metrics configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics address
    #[serde(default = "default_metrics_address")]
    pub address: String,
}

fn default_metrics_address() -> String {
    "127.0.0.1:9615".to_string()
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: default_metrics_address(),
        }
    }
}

impl NodeConfig {
    /// Load from an optional TOML file, then apply `RALLY__` environment overrides.
    ///
    /// A missing file is not an error; defaults fill every gap.
    pub fn load(path: Option<&Path>) -> Result<Self, RallyError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: NodeConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| RallyError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document without environment overrides
    pub fn from_toml(text: &str) -> Result<Self, RallyError> {
        let config: NodeConfig =
            toml::from_str(text).map_err(|e| RallyError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults rendered as TOML
    pub fn default_toml() -> Result<String, RallyError> {
        toml::to_string_pretty(&NodeConfig::default())
            .map_err(|e| RallyError::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<(), RallyError> {
        self.engine.validate()?;

        let mut seen = HashSet::new();
        for settings in &self.platforms {
            if !seen.insert(settings.platform) {
                return Err(RallyError::Configuration(format!(
                    "platform {} configured twice",
                    settings.platform
                )));
            }
            if settings.token_env.trim().is_empty() {
                return Err(RallyError::Configuration(format!(
                    "platform {} has no token_env",
                    settings.platform
                )));
            }
        }

        if self.ingest.channel_capacity == 0 {
            return Err(RallyError::Configuration(
                "ingest.channel_capacity must be greater than zero".to_string(),
            ));
        }

        match self.logging.format.as_str() {
            "text" | "json" => {}
            other => {
                return Err(RallyError::Configuration(format!(
                    "unknown log format: {}",
                    other
                )))
            }
        }

        Ok(())
    }

    /// Platforms to serve
    pub fn enabled_platforms(&self) -> impl Iterator<Item = &PlatformSettings> {
        self.platforms.iter().filter(|p| p.enabled)
    }

    /// Resolve the bot token of every enabled platform through `lookup`.
    ///
    /// A missing token is fatal: the node refuses to start half-configured.
    pub fn resolve_credentials<F>(
        &self,
        lookup: F,
    ) -> Result<Vec<(PlatformSettings, Credentials)>, RallyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolved: Vec<_> = self
            .enabled_platforms()
            .map(|settings| match lookup(&settings.token_env) {
                Some(token) if !token.trim().is_empty() => {
                    Ok((settings.clone(), Credentials::new(token)))
                }
                _ => Err(RallyError::Configuration(format!(
                    "missing bot token for {}: set {}",
                    settings.platform, settings.token_env
                ))),
            })
            .collect::<Result<_, _>>()?;

        if resolved.is_empty() {
            return Err(RallyError::Configuration(
                "no platform enabled".to_string(),
            ));
        }
        Ok(resolved)
    }
}
