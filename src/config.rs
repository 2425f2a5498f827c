//! Configuration management for keyrate.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{KeyrateError, Result};
use crate::ratelimit::options::{validate_burst, validate_rate};

/// Prefix of environment variables overriding file configuration,
/// e.g. `KEYRATE__LIMITER__RATE=10`.
pub const ENV_PREFIX: &str = "KEYRATE";

/// Environment keys holding comma-separated lists.
const ENV_LIST_KEYS: &[&str] = &["store.urls"];

/// Main configuration for keyrate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyrateConfig {
    /// Limiter defaults
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Construction-time limiter options.
///
/// `rate` and `burst` may be left unset here if every check supplies them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Default decay rate in Hz
    #[serde(default)]
    pub rate: Option<f64>,

    /// Default burst ceiling
    #[serde(default)]
    pub burst: Option<u64>,

    /// Namespace prepended to every identifier
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            rate: None,
            burst: None,
            prefix: default_prefix(),
        }
    }
}

fn default_prefix() -> String {
    "ratelimit".to_string()
}

impl LimiterConfig {
    pub fn new(rate: f64, burst: u64) -> Self {
        Self {
            rate: Some(rate),
            burst: Some(burst),
            ..Self::default()
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Check the values that are set.
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.rate {
            validate_rate(rate)?;
        }
        if let Some(burst) = self.burst {
            validate_burst(burst)?;
        }
        if self.prefix.is_empty() {
            return Err(KeyrateError::Config("prefix must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Store configuration.
///
/// With `urls` set, each URL is one Redis shard shared with every other
/// process using the same list. Otherwise an in-process store with `shards`
/// shards is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis server per shard, in shard order
    #[serde(default)]
    pub urls: Vec<String>,

    /// Number of in-process shards keys are spread over
    #[serde(default = "default_shards")]
    pub shards: usize,

    /// Expired key sweep interval in milliseconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            shards: default_shards(),
            sweep_interval_ms: default_sweep_interval(),
        }
    }
}

fn default_shards() -> usize {
    4
}

fn default_sweep_interval() -> u64 {
    1000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl KeyrateConfig {
    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: KeyrateConfig =
            serde_yaml::from_str(yaml).map_err(|e| KeyrateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file overlaid with
    /// `KEYRATE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            if !path.exists() {
                return Err(KeyrateError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("config file {} not found", path.display()),
                )));
            }
            builder = builder.add_source(
                config::File::from(path).format(config::FileFormat::Yaml),
            );
        }

        let mut env = config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true)
            .list_separator(",");
        for key in ENV_LIST_KEYS.iter().copied() {
            env = env.with_list_parse_key(key);
        }
        builder = builder.add_source(env);

        let config: KeyrateConfig = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| KeyrateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.limiter.validate()?;
        if self.store.shards == 0 {
            return Err(KeyrateError::Config(
                "store.shards must be at least 1".to_string(),
            ));
        }
        if self.store.urls.iter().any(|u| u.trim().is_empty()) {
            return Err(KeyrateError::Config(
                "store.urls must not contain empty entries".to_string(),
            ));
        }
        Ok(())
    }
}
