//! Global configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Poll back-off schedule for `guest-exec-status`.
///
/// The interval starts at `initial_ms`, multiplies by `multiplier` after
/// each poll, and is capped at `max_ms`. The defaults are a documented
/// configuration surface, not protocol constants: the agent imposes no
/// particular schedule.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct PollConfig {
    /// First sleep between launch and the second poll, in milliseconds.
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    /// Upper bound on the sleep between polls, in milliseconds.
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    /// Growth factor applied after each poll.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_initial_ms() -> u64 {
    50
}

fn default_max_ms() -> u64 {
    2000
}

fn default_multiplier() -> f64 {
    2.0
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
        }
    }
}

impl PollConfig {
    /// First poll interval.
    #[must_use]
    pub fn initial(&self) -> Duration {
        Duration::from_millis(self.initial_ms)
    }

    /// Next interval after `current`, grown and capped.
    #[must_use]
    pub fn next(&self, current: Duration) -> Duration {
        let grown = current.mul_f64(self.multiplier);
        grown.min(Duration::from_millis(self.max_ms))
    }
}

/// Configurable timeout values (seconds).
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct TimeoutConfig {
    /// Per-RPC reply timeout.
    #[serde(default = "default_rpc_seconds")]
    pub rpc_seconds: u64,
    /// Whole-execution deadline; 0 means no deadline.
    #[serde(default)]
    pub exec_seconds: u64,
}

fn default_rpc_seconds() -> u64 {
    10
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            rpc_seconds: default_rpc_seconds(),
            exec_seconds: 0,
        }
    }
}

impl TimeoutConfig {
    /// Reply timeout applied inside each RPC call.
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_seconds)
    }

    /// Execution deadline, if one is configured.
    #[must_use]
    pub fn exec_deadline(&self) -> Option<Duration> {
        (self.exec_seconds > 0).then(|| Duration::from_secs(self.exec_seconds))
    }
}

/// Global configuration parsed from an optional TOML file.
///
/// All fields have defaults; CLI flags override file values.
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Default guest-agent device path.
    #[serde(default)]
    pub device: Option<PathBuf>,
    /// Poll back-off schedule.
    #[serde(default)]
    pub poll: PollConfig,
    /// Timeout settings.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if the file cannot be read, contains
    /// invalid TOML, or fails validation.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants on the poll schedule and timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Config`] naming the offending field.
    pub fn validate(&self) -> Result<()> {
        if self.poll.initial_ms == 0 {
            return Err(AppError::Config(
                "poll.initial_ms must be greater than zero".into(),
            ));
        }
        if self.poll.max_ms < self.poll.initial_ms {
            return Err(AppError::Config(
                "poll.max_ms must not be less than poll.initial_ms".into(),
            ));
        }
        if self.poll.multiplier < 1.0 {
            return Err(AppError::Config(
                "poll.multiplier must be at least 1.0".into(),
            ));
        }
        if self.timeouts.rpc_seconds == 0 {
            return Err(AppError::Config(
                "timeouts.rpc_seconds must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}
