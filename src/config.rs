//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::http::{DenialMessages, RouteConfig};
use crate::ratelimit::{Escalation, Policy, PolicyClass, PolicyTable};

/// Prefix for environment overrides, e.g. `TOLLGATE__RATE_LIMITING__BACKEND=redis`.
pub const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which limiter backend to run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Volatile state in this process
    #[default]
    Memory,
    /// State shared through Redis
    Redis,
}

/// Shared-store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Prefix for every key written
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on each decision in milliseconds, connecting included
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Pause after a failed call before reconnecting, in milliseconds
    #[serde(default = "default_reconnect_backoff_ms")]
    pub reconnect_backoff_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
            reconnect_backoff_ms: default_reconnect_backoff_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    crate::ratelimit::DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    50
}

fn default_reconnect_backoff_ms() -> u64 {
    1_000
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: BackendKind,

    /// Shared-store settings, used when `backend` is `redis`
    #[serde(default)]
    pub redis: RedisConfig,

    /// Length of an escalation block in seconds
    #[serde(default = "default_block_duration")]
    pub block_duration_secs: u64,

    /// Multiple of the limit at which a client gets blocked
    #[serde(default = "default_escalation_multiplier")]
    pub escalation_multiplier: u32,

    /// How often idle in-process windows are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Per-class overrides of the built-in policy table
    #[serde(default)]
    pub policies: HashMap<PolicyClass, Policy>,

    /// Classifier path layout
    #[serde(default)]
    pub routes: RouteConfig,

    /// Messages returned to denied callers
    #[serde(default)]
    pub messages: DenialMessages,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            redis: RedisConfig::default(),
            block_duration_secs: default_block_duration(),
            escalation_multiplier: default_escalation_multiplier(),
            sweep_interval_secs: default_sweep_interval(),
            policies: HashMap::new(),
            routes: RouteConfig::default(),
            messages: DenialMessages::default(),
        }
    }
}

fn default_block_duration() -> u64 {
    crate::ratelimit::DEFAULT_BLOCK_DURATION_SECS
}

fn default_escalation_multiplier() -> u32 {
    crate::ratelimit::DEFAULT_ESCALATION_MULTIPLIER
}

fn default_sweep_interval() -> u64 {
    60
}

impl RateLimitingConfig {
    /// The escalation policy these settings describe.
    pub fn escalation(&self) -> Escalation {
        Escalation::new(self.block_duration_secs, self.escalation_multiplier)
    }

    /// The policy table with overrides applied.
    pub fn policy_table(&self) -> Result<PolicyTable> {
        PolicyTable::with_overrides(&self.policies)
    }

    /// Sweep interval as a duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Shared-store timeout as a duration.
    pub fn redis_timeout(&self) -> Duration {
        Duration::from_millis(self.redis.timeout_ms)
    }

    /// Shared-store reconnect backoff as a duration.
    pub fn redis_reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.redis.reconnect_backoff_ms)
    }
}

impl TollgateConfig {
    /// Load configuration from an optional YAML file plus `TOLLGATE__*`
    /// environment overrides, then validate it.
    pub fn load(path: Option<&str>) -> Result<Self> {
        Self::load_with_env_prefix(path, ENV_PREFIX)
    }

    fn load_with_env_prefix(path: Option<&str>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::new(path, config::FileFormat::Yaml).required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TollgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TollgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the service cannot run with.
    pub fn validate(&self) -> Result<()> {
        let rl = &self.rate_limiting;

        rl.policy_table()?;

        if rl.block_duration_secs == 0 {
            return Err(TollgateError::Config(
                "block_duration_secs must be positive".to_string(),
            ));
        }
        if rl.block_duration_secs > i32::MAX as u64 {
            return Err(TollgateError::Config(
                "block_duration_secs is too large".to_string(),
            ));
        }
        if rl.escalation_multiplier == 0 {
            return Err(TollgateError::Config(
                "escalation_multiplier must be at least 1".to_string(),
            ));
        }
        if rl.sweep_interval_secs == 0 {
            return Err(TollgateError::Config(
                "sweep_interval_secs must be positive".to_string(),
            ));
        }
        if rl.backend == BackendKind::Redis {
            if rl.redis.url.trim().is_empty() {
                return Err(TollgateError::Config(
                    "redis backend selected without a url".to_string(),
                ));
            }
            if rl.redis.timeout_ms == 0 {
                return Err(TollgateError::Config(
                    "redis.timeout_ms must be positive".to_string(),
                ));
            }
        }
        Ok(())
    }
}
