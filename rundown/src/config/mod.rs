//! Configuration system for the `Rundown` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/rundown/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use rundown_proto::agenda::{ItemId, ServiceId};

use crate::session::{ReconnectConfig, SessionOptions};
use crate::sync::ClientOptions;

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file {path}: {source}")]
    ReadFile {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// Failed to parse the TOML configuration.
    #[error("failed to parse config file: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// No server URL from any layer.
    #[error("no server url configured (use --server-url or RUNDOWN_URL)")]
    MissingServerUrl,

    /// No token from any layer.
    #[error("no token configured (use --token or RUNDOWN_TOKEN)")]
    MissingToken,
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    server: ServerFileConfig,
    display: DisplayFileConfig,
    reconnect: ReconnectFileConfig,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    url: Option<String>,
    token: Option<String>,
    connect_timeout_secs: Option<u64>,
    request_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

/// `[display]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct DisplayFileConfig {
    tick_interval_ms: Option<u64>,
}

/// `[reconnect]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ReconnectFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server WebSocket URL.
    pub server_url: Option<String>,
    /// Bearer token.
    pub token: Option<String>,
    /// Timeout for the WebSocket connect.
    pub connect_timeout: Duration,
    /// Timeout for request replies.
    pub request_timeout: Duration,
    /// Capacity for event and update channels.
    pub channel_capacity: usize,
    /// Display refresh period.
    pub tick_interval: Duration,
    /// Reconnect backoff.
    pub reconnect: ReconnectConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: None,
            token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            channel_capacity: 256,
            tick_interval: Duration::from_secs(1),
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or a config file cannot be parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        Self {
            server_url: cli.server_url.clone().or_else(|| file.server.url.clone()),
            token: cli.token.clone().or_else(|| file.server.token.clone()),
            connect_timeout: file
                .server
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            request_timeout: file
                .server
                .request_timeout_secs
                .map_or(defaults.request_timeout, Duration::from_secs),
            channel_capacity: file
                .server
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            tick_interval: file
                .display
                .tick_interval_ms
                .map_or(defaults.tick_interval, Duration::from_millis),
            reconnect: ReconnectConfig {
                initial_delay: file
                    .reconnect
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: file
                    .reconnect
                    .max_delay_secs
                    .map_or(defaults.reconnect.max_delay, Duration::from_secs),
                max_attempts: file
                    .reconnect
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
            },
        }
    }

    /// Connection options for a one-shot [`crate::sync::SyncClient`].
    #[must_use]
    pub const fn client_options(&self) -> ClientOptions {
        ClientOptions {
            connect_timeout: self.connect_timeout,
            request_timeout: self.request_timeout,
            event_capacity: self.channel_capacity,
        }
    }

    /// Options for a [`crate::session::ServiceSession`].
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingServerUrl`] or [`ConfigError::MissingToken`].
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        let (url, token) = self.credentials()?;
        Ok(SessionOptions {
            url: url.to_string(),
            token: token.to_string(),
            client: self.client_options(),
            tick: self.tick_interval,
            reconnect: self.reconnect.clone(),
            update_capacity: self.channel_capacity,
        })
    }

    /// Server URL and token, both required to talk to the server.
    ///
    /// # Errors
    ///
    /// [`ConfigError::MissingServerUrl`] or [`ConfigError::MissingToken`].
    pub fn credentials(&self) -> Result<(&str, &str), ConfigError> {
        let url = self
            .server_url
            .as_deref()
            .ok_or(ConfigError::MissingServerUrl)?;
        let token = self.token.as_deref().ok_or(ConfigError::MissingToken)?;
        Ok((url, token))
    }
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Service rundowns with a shared live timer")]
pub struct CliArgs {
    /// WebSocket URL of the rundown server.
    #[arg(long, env = "RUNDOWN_URL")]
    pub server_url: Option<String>,

    /// Bearer token issued for your user.
    #[arg(long, env = "RUNDOWN_TOKEN")]
    pub token: Option<String>,

    /// Path to config file (default: `~/.config/rundown/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "RUNDOWN_LOG")]
    pub log_level: String,

    /// Log file path (default: `/tmp/rundown.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// What to do.
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Client subcommands.
#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// List services.
    List,
    /// Create a service.
    Create {
        /// Service title.
        title: String,
        /// Service date (YYYY-MM-DD).
        date: NaiveDate,
    },
    /// Delete a service.
    Delete {
        /// Service id.
        service: ServiceId,
    },
    /// Show a service's agenda.
    Show {
        /// Service id.
        service: ServiceId,
    },
    /// Follow a service's live timer.
    Watch {
        /// Service id.
        service: ServiceId,
    },
    /// Append an item to a service's agenda.
    AddItem {
        /// Service id.
        service: ServiceId,
        /// Item title.
        title: String,
        /// Duration in minutes (fractions allowed).
        minutes: f64,
    },
    /// Remove an item from a service's agenda.
    RemoveItem {
        /// Service id.
        service: ServiceId,
        /// Item id.
        item: ItemId,
    },
    /// Control a service's timer.
    Timer {
        /// Service id.
        service: ServiceId,
        /// Timer action.
        #[command(subcommand)]
        action: TimerAction,
    },
}

/// Timer actions for [`Command::Timer`].
#[derive(clap::Subcommand, Debug, Clone)]
pub enum TimerAction {
    /// Start an item from zero.
    Start {
        /// Item id.
        item: ItemId,
    },
    /// Pause the running timer.
    Pause,
    /// Resume the paused timer.
    Resume,
    /// Back to idle.
    Reset,
    /// Skip to an item.
    Skip {
        /// Item id.
        item: ItemId,
    },
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    }

    let Some(config_dir) = dirs::config_dir() else {
        return Ok(ConfigFile::default());
    };
    let path = config_dir.join("rundown").join("config.toml");

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
