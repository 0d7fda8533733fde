//! Worker configuration.
//!
//! Sources are layered, later ones overriding earlier ones:
//! 1. Default values
//! 2. `hearth.toml` in the current directory (if present)
//! 3. The file named by `--config` (if given)
//! 4. Environment variables with the `HEARTH_` prefix, `__` separating
//!    nested keys (`HEARTH_TIMEOUTS__HEARTBEAT=10s`)
//! 5. Command-line arguments

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use hearth_proto::Dialect;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::token::Token;
use crate::worker::WorkerSettings;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Failed to parse configuration.
    #[error("configuration error: {0}")]
    Parse(String),

    /// An explicitly requested file does not exist.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Command-line options understood by every worker binary.
///
/// Flatten into a binary's own `clap` parser with `#[command(flatten)]`.
#[derive(Debug, Clone, Default, clap::Args, Serialize)]
pub struct WorkerArgs {
    /// Path to a configuration file.
    #[arg(long, value_name = "FILE")]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Application name.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,

    /// Supervisor endpoint: a Unix socket path or `host:port`.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// Identifier sent in the handshake.
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    /// Wire protocol version (0 or 1).
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<u64>,

    /// Include stack traces in panic reports.
    #[arg(long)]
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub debug: bool,
}

/// Settings for one worker process.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// Application name, passed to token manager factories.
    #[serde(default = "default_app")]
    pub app: String,

    /// Supervisor endpoint.
    #[serde(default)]
    pub endpoint: String,

    /// Identifier sent in the handshake.
    #[serde(default)]
    pub uuid: String,

    /// Wire protocol version.
    #[serde(default)]
    pub protocol: u64,

    /// Include stack traces in panic reports and log at debug level.
    #[serde(default)]
    pub debug: bool,

    /// Log live sessions and events on SIGUSR1.
    #[serde(default = "default_true")]
    pub stack_signal: bool,

    /// Token for the token manager.
    #[serde(default)]
    pub token: Token,

    /// Timer settings.
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl WorkerConfig {
    /// Loads and validates configuration from every source.
    pub fn load(args: &WorkerArgs) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Toml::file("hearth.toml"));

        if let Some(path) = &args.config {
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.display().to_string()));
            }
            figment = figment.merge(Toml::file(path));
        }

        let figment = figment
            .merge(Env::prefixed("HEARTH_").split("__"))
            .merge(Serialized::defaults(args));
        Self::from_figment(&figment)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        Self::from_figment(&Figment::new().merge(Toml::string(content)))
    }

    fn from_figment(figment: &Figment) -> Result<Self, ConfigError> {
        let config: Self = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the worker cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Dialect::from_version(self.protocol).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if self.uuid.is_empty() {
            return Err(ConfigError::Invalid("uuid must be specified".into()));
        }
        if self.endpoint.is_empty() {
            return Err(ConfigError::Invalid("endpoint must be specified".into()));
        }
        for (name, value) in [
            ("heartbeat", self.timeouts.heartbeat),
            ("disown", self.timeouts.disown),
            ("termination", self.timeouts.termination),
            ("connect", self.timeouts.connect),
        ] {
            if value.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} timeout must be positive")));
            }
        }
        Ok(())
    }

    /// Runtime settings derived from this configuration.
    pub fn settings(&self) -> Result<WorkerSettings, ConfigError> {
        let dialect =
            Dialect::from_version(self.protocol).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        Ok(WorkerSettings {
            uuid: self.uuid.clone(),
            dialect,
            debug: self.debug,
            stack_signal: self.stack_signal,
            heartbeat_timeout: self.timeouts.heartbeat,
            disown_timeout: self.timeouts.disown,
            termination_timeout: self.timeouts.termination,
        })
    }
}

/// Worker timers.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct Timeouts {
    /// Interval between heartbeats.
    #[serde(default = "default_heartbeat", deserialize_with = "deserialize_duration")]
    pub heartbeat: Duration,

    /// How long to wait for a heartbeat reply.
    #[serde(default = "default_disown", deserialize_with = "deserialize_duration")]
    pub disown: Duration,

    /// Grace period for the termination hook.
    #[serde(default = "default_termination", deserialize_with = "deserialize_duration")]
    pub termination: Duration,

    /// Limit for connecting to the supervisor.
    #[serde(default = "default_connect", deserialize_with = "deserialize_duration")]
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            heartbeat: default_heartbeat(),
            disown: default_disown(),
            termination: default_termination(),
            connect: default_connect(),
        }
    }
}

fn default_app() -> String {
    "standalone".to_owned()
}

const fn default_true() -> bool {
    true
}

pub(crate) const fn default_heartbeat() -> Duration {
    Duration::from_secs(10)
}

pub(crate) const fn default_disown() -> Duration {
    Duration::from_secs(5)
}

pub(crate) const fn default_termination() -> Duration {
    Duration::from_secs(5)
}

const fn default_connect() -> Duration {
    Duration::from_secs(5)
}

/// Accepts `"250ms"`, `"10s"`, `"2m"` or a bare number of seconds.
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let invalid = || format!("invalid duration: {s}");
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse().map(Duration::from_millis).map_err(|_| invalid())
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse().map(Duration::from_secs).map_err(|_| invalid())
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.trim()
            .parse::<u64>()
            .map(|m| Duration::from_secs(m * 60))
            .map_err(|_| invalid())
    } else {
        s.parse().map(Duration::from_secs).map_err(|_| invalid())
    }
}
