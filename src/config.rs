//! Configuration management for the quotamesh service.
//!
//! Settings are read from an optional YAML file and then overridden by
//! `QUOTAMESH__`-prefixed environment variables, e.g.
//! `QUOTAMESH__STORE__BACKEND=redis`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{QuotaError, Result};
use crate::keys::RuleSource;
use crate::ratelimit::{FailurePolicy, TokenInheritance};
use crate::store::StoreSettings;

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "QUOTAMESH";

/// Main configuration for the quotamesh service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Shared bucket store
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-request enforcement behavior
    #[serde(default)]
    pub enforcement: EnforcementConfig,

    /// Quota profile source
    #[serde(default)]
    pub profiles: ProfilesConfig,

    /// Rule engines by name
    #[serde(default)]
    pub rule_engines: BTreeMap<String, RuleSource>,
}

/// Which shared store holds bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local; only consistent within one instance
    #[default]
    Memory,
    /// Redis shared by every instance
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix prepended to every bucket key in Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How long an idle Redis record outlives the time its bucket takes to
    /// refill completely; 0 keeps records forever
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Compare-and-swap attempts before giving up with contention
    #[serde(default = "default_max_cas_retries")]
    pub max_cas_retries: u32,

    /// Bound on every store round-trip
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            ttl_secs: default_ttl_secs(),
            max_cas_retries: default_max_cas_retries(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl StoreConfig {
    pub fn settings(&self) -> StoreSettings {
        StoreSettings {
            max_cas_retries: self.max_cas_retries,
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1/".to_string()
}

fn default_key_prefix() -> String {
    "quotamesh:".to_string()
}

fn default_ttl_secs() -> u64 {
    3600
}

fn default_max_cas_retries() -> u32 {
    16
}

fn default_timeout_ms() -> u64 {
    500
}

/// Enforcement configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcementConfig {
    /// Global switch; when off every request is let through untouched
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Bound on one rule engine evaluation
    #[serde(default = "default_rule_engine_timeout_ms")]
    pub rule_engine_timeout_ms: u64,

    /// How live buckets are migrated when their profile changes
    #[serde(default)]
    pub token_inheritance: TokenInheritance,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            rule_engine_timeout_ms: default_rule_engine_timeout_ms(),
            token_inheritance: TokenInheritance::default(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl EnforcementConfig {
    pub fn rule_engine_timeout(&self) -> Duration {
        Duration::from_millis(self.rule_engine_timeout_ms)
    }
}

fn default_enabled() -> bool {
    true
}

fn default_rule_engine_timeout_ms() -> u64 {
    200
}

/// Profile source configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilesConfig {
    /// Path to the quota profile file
    pub path: Option<PathBuf>,

    /// Profile file reload interval in seconds; 0 disables reloading
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
}

impl Default for ProfilesConfig {
    fn default() -> Self {
        Self {
            path: None,
            reload_interval_secs: default_reload_interval(),
        }
    }
}

impl ProfilesConfig {
    /// The reload interval, unless reloading is disabled.
    pub fn reload_interval(&self) -> Option<Duration> {
        (self.reload_interval_secs > 0).then(|| Duration::from_secs(self.reload_interval_secs))
    }
}

fn default_reload_interval() -> u64 {
    60
}

impl ServiceConfig {
    /// Load configuration from an optional file plus the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::build(path, Environment::with_prefix(ENV_PREFIX))
    }

    /// Load configuration from a file path, without environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(config_error)
    }

    fn build(path: Option<&Path>, environment: Environment) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Yaml).required(true));
        }

        builder
            .add_source(environment.separator("__").try_parsing(true))
            .build()
            .and_then(|config| config.try_deserialize())
            .map_err(config_error)
    }
}

fn config_error(e: config::ConfigError) -> QuotaError {
    QuotaError::Config(e.to_string())
}
