use std::collections::BTreeMap;

use chrono_tz::Tz;
use config::{Case, Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// API key for the /api/v1 endpoints (optional - if not set, no auth required)
    #[serde(default)]
    pub api_key: Option<String>,

    /// Hourly call quota per account tier
    #[serde(default = "default_tier_limits")]
    pub tier_limits: BTreeMap<String, u64>,

    /// App-wide hourly ceiling imposed by the upstream API
    #[serde(default = "default_meta_api_limit")]
    pub meta_api_limit_per_account: u64,

    /// Action types accepted for admission (empty = any well-formed type)
    #[serde(default)]
    pub allowed_action_types: Vec<String>,

    /// Counter and queue store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Accounting window configuration
    #[serde(default)]
    pub window: WindowConfig,

    /// Window reset task configuration
    #[serde(default)]
    pub reset: ResetConfig,

    /// Deferred call dispatch configuration
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Stats endpoint configuration
    #[serde(default)]
    pub stats: StatsConfig,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Which backend holds counters and queues
    #[serde(default)]
    pub backend: StoreBackend,

    /// Database URL (SQLite connection string)
    #[serde(default = "default_database_url")]
    pub database_url: String,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Upper bound for any single store operation
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Consecutive failures before the store circuit opens
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// How long the store circuit stays open
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,

    /// Number of settled queue items kept for auditing
    #[serde(default = "default_audit_capacity")]
    pub audit_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            database_url: default_database_url(),
            max_connections: default_max_connections(),
            op_timeout_ms: default_op_timeout_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_cooldown_secs: default_breaker_cooldown_secs(),
            audit_capacity: default_audit_capacity(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WindowConfig {
    /// Extra lifetime of a counter past its window end, absorbing clock skew
    #[serde(default = "default_grace_secs")]
    pub grace_secs: u64,

    /// IANA timezone used for human-readable window labels
    #[serde(default = "default_timezone")]
    pub display_timezone: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            grace_secs: default_grace_secs(),
            display_timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResetConfig {
    /// Whether the background reset task runs
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How often the task checks for an hour boundary
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// How far past the hour start a boundary still counts as "just crossed"
    #[serde(default = "default_boundary_tolerance_secs")]
    pub boundary_tolerance_secs: u64,

    /// Window rotations a queued item may wait before it is marked failed
    #[serde(default = "default_max_replay_attempts")]
    pub max_replay_attempts: u32,

    /// Lease held on a window while draining it
    #[serde(default = "default_drain_lease_secs")]
    pub drain_lease_secs: u64,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
            boundary_tolerance_secs: default_boundary_tolerance_secs(),
            max_replay_attempts: default_max_replay_attempts(),
            drain_lease_secs: default_drain_lease_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct DispatchConfig {
    /// Webhook receiving replayed calls; calls are only logged when unset
    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Bearer token sent to the webhook
    #[serde(default)]
    pub webhook_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    /// How long the last good stats view is served while the store is down
    #[serde(default = "default_last_known_ttl_secs")]
    pub last_known_ttl_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            last_known_ttl_secs: default_last_known_ttl_secs(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_tier_limits() -> BTreeMap<String, u64> {
    BTreeMap::from([("free".to_string(), 200), ("pro".to_string(), 3000)])
}

fn default_meta_api_limit() -> u64 {
    200
}

fn default_database_url() -> String {
    "sqlite:data/callgate.db".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_op_timeout_ms() -> u64 {
    2000
}

fn default_breaker_failure_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    30
}

fn default_audit_capacity() -> usize {
    1000
}

fn default_grace_secs() -> u64 {
    3600
}

fn default_timezone() -> String {
    "UTC".to_string()
}

fn default_poll_interval_secs() -> u64 {
    5
}

fn default_boundary_tolerance_secs() -> u64 {
    30
}

fn default_max_replay_attempts() -> u32 {
    3
}

fn default_drain_lease_secs() -> u64 {
    300
}

fn default_last_known_ttl_secs() -> u64 {
    2 * 60 * 60
}

fn default_true() -> bool {
    true
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if present
        let _ = dotenvy::dotenv();

        let config = Config::builder()
            // Start with default values
            .set_default("host", default_host())?
            .set_default("port", default_port())?
            .set_default("meta_api_limit_per_account", default_meta_api_limit())?
            // Load from config file if present
            .add_source(File::with_name("config").required(false))
            .add_source(File::with_name("config.local").required(false))
            // Override with environment variables (prefixed with CALLGATE_)
            // e.g. CALLGATE_TIER_LIMITS__FREE=100, CALLGATE_STORE__BACKEND=sqlite
            .add_source(
                Environment::with_prefix("CALLGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .convert_case(Case::Snake)
                    .list_separator(",")
                    .with_list_parse_key("allowed_action_types")
                    .try_parsing(true),
            )
            .build()?;

        let config: AppConfig = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.tier_limits.is_empty() {
            return Err(ConfigError::Message(
                "tier_limits must define at least one tier".to_string(),
            ));
        }
        if self.reset.poll_interval_secs == 0 {
            return Err(ConfigError::Message(
                "reset.poll_interval_secs must be greater than zero".to_string(),
            ));
        }
        self.display_timezone()?;
        Ok(())
    }

    /// Parsed timezone for window labels
    pub fn display_timezone(&self) -> Result<Tz, ConfigError> {
        self.window.display_timezone.parse::<Tz>().map_err(|_| {
            ConfigError::Message(format!(
                "Invalid window.display_timezone: {}",
                self.window.display_timezone
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_toml(toml: &str) -> AppConfig {
        Config::builder()
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_toml("");
        assert_eq!(config.port, 3000);
        assert_eq!(config.tier_limits.get("free"), Some(&200));
        assert_eq!(config.tier_limits.get("pro"), Some(&3000));
        assert_eq!(config.meta_api_limit_per_account, 200);
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.op_timeout_ms, 2000);
        assert_eq!(config.reset.max_replay_attempts, 3);
        assert!(config.reset.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = from_toml(
            r#"
            meta_api_limit_per_account = 150
            allowed_action_types = ["dm_send", "comment_reply"]

            [tier_limits]
            free = 100
            pro = 5000

            [store]
            backend = "sqlite"
            database_url = "sqlite::memory:"

            [window]
            display_timezone = "America/Chicago"
            "#,
        );
        assert_eq!(config.tier_limits.get("free"), Some(&100));
        assert_eq!(config.meta_api_limit_per_account, 150);
        assert_eq!(config.allowed_action_types.len(), 2);
        assert_eq!(config.store.backend, StoreBackend::Sqlite);
        assert_eq!(config.display_timezone().unwrap(), chrono_tz::America::Chicago);
    }

    #[test]
    fn test_invalid_timezone_rejected() {
        let config = from_toml("[window]\ndisplay_timezone = \"Mars/Olympus\"");
        assert!(config.validate().is_err());
    }
}
