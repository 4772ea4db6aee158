use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json", "pretty" or "compact"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Timing and retry knobs for one classroom session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Longest a connection may sit outside `stable` before it is reset
    pub negotiation_timeout_ms: u64,
    /// How long a disconnected transport is tolerated before teardown
    pub disconnect_grace_secs: u64,
    /// Bounded wait for a screen-share lock response
    pub lock_request_timeout_ms: u64,
    /// Window in which track arrivals are coalesced into one classification
    pub classify_debounce_ms: u64,
    /// Consecutive resets of one pair before a connectivity warning is shown
    pub reset_warning_threshold: u32,
    /// Signaling send attempts after the first failure
    pub signaling_retry_attempts: usize,
    /// Interval of relay keep-alive messages
    pub heartbeat_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            negotiation_timeout_ms: 3000,
            disconnect_grace_secs: 12,
            lock_request_timeout_ms: 5000,
            classify_debounce_ms: 150,
            reset_warning_threshold: 3,
            signaling_retry_attempts: 3,
            heartbeat_interval_secs: 4,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub const fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    #[must_use]
    pub const fn disconnect_grace(&self) -> Duration {
        Duration::from_secs(self.disconnect_grace_secs)
    }

    #[must_use]
    pub const fn lock_request_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_request_timeout_ms)
    }

    #[must_use]
    pub const fn classify_debounce(&self) -> Duration {
        Duration::from_millis(self.classify_debounce_ms)
    }

    #[must_use]
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // CLASSROOM_SESSION__NEGOTIATION_TIMEOUT_MS, CLASSROOM_LOGGING__LEVEL, ...
        builder = builder.add_source(
            Environment::with_prefix("CLASSROOM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Validate configuration, returning every problem found
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let session = &self.session;

        if session.negotiation_timeout_ms == 0 {
            errors.push("session.negotiation_timeout_ms must be greater than 0".to_string());
        }
        if session.lock_request_timeout_ms == 0 {
            errors.push("session.lock_request_timeout_ms must be greater than 0".to_string());
        }
        if session.heartbeat_interval_secs == 0 {
            errors.push("session.heartbeat_interval_secs must be greater than 0".to_string());
        }
        if session.reset_warning_threshold == 0 {
            errors.push("session.reset_warning_threshold must be greater than 0".to_string());
        }
        if session.disconnect_grace() <= session.negotiation_timeout() {
            errors.push(
                "session.disconnect_grace_secs must exceed the negotiation timeout".to_string(),
            );
        }
        if session.heartbeat_interval() >= session.disconnect_grace() {
            errors.push(
                "session.heartbeat_interval_secs must be shorter than the disconnect grace"
                    .to_string(),
            );
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty" | "compact") {
            errors.push(format!(
                "logging.format must be \"json\", \"pretty\" or \"compact\", got {:?}",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
