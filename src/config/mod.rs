//! Configuration management for wirefeed.
//!
//! Configuration is read from `~/.config/wirefeed/config.toml` at startup.
//! If the file doesn't exist, a default configuration with comments is created.

pub mod interval;

pub use interval::{format_interval, parse_interval};

use serde::Deserialize;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Upper bound for every configured duration, about ten years.
const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

fn secs(value: u64) -> Duration {
    Duration::from_secs(value.min(MAX_DURATION_SECS))
}

fn minutes(value: u64) -> Duration {
    secs(value.checked_mul(60).unwrap_or(MAX_DURATION_SECS))
}

fn chrono_minutes(value: i64) -> chrono::Duration {
    let max = (MAX_DURATION_SECS / 60) as i64;
    chrono::Duration::try_minutes(value.clamp(0, max)).unwrap_or_else(chrono::Duration::zero)
}

/// Main configuration struct.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub feed: FeedConfig,
    pub session: SessionConfig,
    pub inactivity: InactivityConfig,
    pub transport: TransportConfig,
}

/// Feed sync timing and memory bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub poll_interval_secs: u64,
    pub shadow_poll_interval_secs: u64,
    pub push_latency_buffer_secs: u64,
    pub max_articles_in_memory: usize,
    pub seen_cache_max: usize,
    pub seen_cache_ttl_secs: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            shadow_poll_interval_secs: 60,
            push_latency_buffer_secs: 5,
            max_articles_in_memory: 100,
            seen_cache_max: 500,
            seen_cache_ttl_secs: 86400,
        }
    }
}

impl FeedConfig {
    pub fn poll_interval(&self) -> Duration {
        secs(self.poll_interval_secs.max(1))
    }

    pub fn shadow_poll_interval(&self) -> Duration {
        secs(self.shadow_poll_interval_secs.max(1))
    }

    pub fn push_latency_buffer(&self) -> Duration {
        secs(self.push_latency_buffer_secs)
    }

    pub fn seen_cache_ttl(&self) -> chrono::Duration {
        let ttl = self.seen_cache_ttl_secs.min(MAX_DURATION_SECS) as i64;
        chrono::Duration::try_seconds(ttl).unwrap_or_else(chrono::Duration::zero)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Idle or hidden time after which a session counts as stale.
    pub soft_expiration_minutes: i64,
    /// Age after which a session is never restored.
    pub hard_logout_minutes: i64,
    pub sweep_interval_minutes: u64,
    /// How often the stored session is checked for writes by other processes.
    pub storage_poll_secs: u64,
    pub read_state_cap: usize,
    /// Keys that survive `end_session`. A trailing `*` matches a prefix.
    pub preserved_keys: Vec<String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            soft_expiration_minutes: 30,
            hard_logout_minutes: 120,
            sweep_interval_minutes: 5,
            storage_poll_secs: 2,
            read_state_cap: 1000,
            preserved_keys: vec!["pref:*".to_string()],
        }
    }
}

impl SessionConfig {
    pub fn soft_expiration(&self) -> chrono::Duration {
        chrono_minutes(self.soft_expiration_minutes)
    }

    pub fn hard_logout(&self) -> chrono::Duration {
        chrono_minutes(self.hard_logout_minutes)
    }

    pub fn sweep_interval(&self) -> Duration {
        minutes(self.sweep_interval_minutes.max(1))
    }

    pub fn storage_poll_interval(&self) -> Duration {
        secs(self.storage_poll_secs.max(1))
    }

    pub fn is_preserved(&self, key: &str) -> bool {
        self.preserved_keys.iter().any(|pattern| match pattern.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == pattern,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InactivityConfig {
    pub timeout_minutes: u64,
    pub warn_before_minutes: u64,
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 120,
            warn_before_minutes: 2,
        }
    }
}

impl InactivityConfig {
    pub fn timeout(&self) -> Duration {
        minutes(self.timeout_minutes)
    }

    pub fn warn_before(&self) -> Duration {
        minutes(self.warn_before_minutes)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub endpoint: String,
    pub request_timeout_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".to_string(),
            request_timeout_secs: 10,
        }
    }
}

impl TransportConfig {
    pub fn request_timeout(&self) -> Duration {
        secs(self.request_timeout_secs.max(1))
    }
}

impl Config {
    /// Load configuration from the default path.
    ///
    /// If the config file doesn't exist, creates a default one with comments.
    /// If the config file exists but is invalid, returns an error.
    /// Missing fields in the config file will use default values.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::default_config_path()?;

        if !config_path.exists() {
            Self::create_default_config(&config_path)?;
            return Ok(Self::default());
        }

        Self::load_from(&config_path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Get the default config file path: `~/.config/wirefeed/config.toml`
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join("wirefeed").join("config.toml"))
    }

    /// Create a default config file with comments.
    fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Io {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        let mut file = fs::File::create(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;

        file.write_all(Self::default_config_content().as_bytes())
            .map_err(|e| ConfigError::Io {
                path: path.to_path_buf(),
                source: e,
            })?;

        Ok(())
    }

    /// Generate the default config file content with comments.
    fn default_config_content() -> String {
        r##"# wirefeed configuration

[feed]
# Full re-fetch interval once the push channel has been abandoned
poll_interval_secs = 30

# How often the push channel is cross-checked against a full fetch
shadow_poll_interval_secs = 60

# Grace period for in-flight push deliveries before a shadow poll diff
push_latency_buffer_secs = 5

# Live articles kept in memory; older ones are trimmed
max_articles_in_memory = 100

# Trimmed/seen article ids remembered to prevent resurrection
seen_cache_max = 500
seen_cache_ttl_secs = 86400

[session]
# Hidden/idle time after which the session is restarted
soft_expiration_minutes = 30

# Sessions older than this are never restored
hard_logout_minutes = 120

# Staleness sweep interval
sweep_interval_minutes = 5

# How often the stored session is checked for changes by other wirefeed processes
storage_poll_secs = 2

# Read article ids remembered per session
read_state_cap = 1000

# Storage keys kept on logout ("prefix*" matches a prefix)
preserved_keys = ["pref:*"]

[inactivity]
timeout_minutes = 120
warn_before_minutes = 2

[transport]
endpoint = "http://localhost:8080"
request_timeout_secs = 10
"##
        .to_string()
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read/write config file at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}
