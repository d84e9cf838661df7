//! Configuration system for the huddle console client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/huddle/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use huddle_proto::ids::RoomId;

use crate::session::SessionConfig;

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
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    connection: ConnectionFileConfig,
    session: SessionFileConfig,
}

/// `[connection]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConnectionFileConfig {
    server_url: Option<String>,
    credential: Option<String>,
    rooms: Vec<i64>,
}

/// `[session]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SessionFileConfig {
    initial_delay_ms: Option<u64>,
    max_delay_secs: Option<u64>,
    max_attempts: Option<u32>,
    stability_threshold_secs: Option<u64>,
    ping_interval_secs: Option<u64>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Reconnection tuning for the session manager.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Ceiling for the doubling backoff delay.
    pub max_delay: Duration,
    /// Consecutive failed attempts before the session gives up.
    pub max_attempts: u32,
    /// Connection uptime after which the attempt counter resets.
    pub stability_threshold: Duration,
    /// Interval between keepalive pings on a live connection.
    pub ping_interval: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
            stability_threshold: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Fully resolved client configuration.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Chat server WebSocket URL.
    pub server_url: Option<String>,
    /// Signed credential presented on connect.
    pub credential: Option<String>,
    /// Rooms to join as soon as the session is up.
    pub rooms: Vec<RoomId>,
    /// Reconnection tuning.
    pub reconnect: ReconnectConfig,
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// CLI args and env vars are parsed via `clap`. If `--config` is given
    /// and the file does not exist, returns an error. If no `--config` is
    /// given, the default path (`~/.config/huddle/config.toml`) is tried
    /// and silently ignored if missing.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ClientConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default. `--join` flags replace the file's
    /// room list wholesale rather than merging with it. This is separated
    /// from `load()` to enable unit testing without CLI parsing.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();

        let rooms = if cli.join.is_empty() {
            &file.connection.rooms
        } else {
            &cli.join
        };

        Self {
            server_url: cli
                .server_url
                .clone()
                .or_else(|| file.connection.server_url.clone()),
            credential: cli
                .credential
                .clone()
                .or_else(|| file.connection.credential.clone()),
            rooms: rooms.iter().copied().map(RoomId::new).collect(),
            reconnect: ReconnectConfig {
                initial_delay: file
                    .session
                    .initial_delay_ms
                    .map_or(defaults.reconnect.initial_delay, Duration::from_millis),
                max_delay: file
                    .session
                    .max_delay_secs
                    .map_or(defaults.reconnect.max_delay, Duration::from_secs),
                max_attempts: file
                    .session
                    .max_attempts
                    .unwrap_or(defaults.reconnect.max_attempts),
                stability_threshold: file
                    .session
                    .stability_threshold_secs
                    .map_or(defaults.reconnect.stability_threshold, Duration::from_secs),
                ping_interval: file
                    .session
                    .ping_interval_secs
                    .map_or(defaults.reconnect.ping_interval, Duration::from_secs),
            },
        }
    }

    /// Build a [`SessionConfig`] from this configuration, if the required
    /// connection fields are present.
    ///
    /// Returns `None` if `server_url` or `credential` is missing (offline
    /// mode: nothing to connect to).
    #[must_use]
    pub fn session(&self) -> Option<SessionConfig> {
        let server_url = self.server_url.clone()?;
        let credential = self.credential.clone()?;

        if credential.is_empty() {
            return None;
        }

        Some(SessionConfig {
            server_url,
            credential,
            rooms: self.rooms.clone(),
            reconnect: self.reconnect.clone(),
        })
    }
}

/// CLI arguments parsed by clap.
///
/// Environment variables are supported via `env` attributes so the client
/// can be pointed at a server without flags.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Console client for huddle support chat")]
pub struct CliArgs {
    /// WebSocket URL of the chat server.
    #[arg(long, env = "HUDDLE_URL")]
    pub server_url: Option<String>,

    /// Signed credential identifying you to the server.
    #[arg(long, env = "HUDDLE_CREDENTIAL", hide_env_values = true)]
    pub credential: Option<String>,

    /// Room to join on connect (repeatable).
    #[arg(long = "join", value_name = "ROOM_ID")]
    pub join: Vec<i64>,

    /// Path to config file (default: `~/.config/huddle/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "HUDDLE_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

/// Load and parse a TOML config file.
///
/// If `explicit_path` is `Some`, the file must exist (error if not).
/// If `explicit_path` is `None`, the default path is tried and missing file
/// is treated as empty config.
fn load_config_file(explicit_path: Option<&std::path::Path>) -> Result<ConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            // No config dir on this platform, fall back to defaults.
            return Ok(ConfigFile::default());
        };
        config_dir.join("huddle").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
