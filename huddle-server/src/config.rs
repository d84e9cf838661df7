//! Configuration system for the huddle server.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/huddle-server/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

use huddle_proto::room::RoomKind;
use huddle_proto::user::Role;

use crate::gateway::GatewaySettings;

/// Errors that can occur when loading server configuration.
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
// TOML file structs (scalar fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure for the server.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerConfigFile {
    server: ServerFileSection,
    chat: ChatFileSection,
    seed: SeedFileSection,
}

/// `[server]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileSection {
    bind_addr: Option<String>,
    secret: Option<String>,
}

/// `[chat]` section: behavior tuning for the gateway.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileSection {
    auth_timeout_secs: Option<u64>,
    typing_window_secs: Option<u64>,
    idle_threshold_secs: Option<u64>,
    sweep_interval_secs: Option<u64>,
    resume_gap_limit: Option<usize>,
}

/// `[seed]` section: accounts and rooms for the in-memory services.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SeedFileSection {
    users: Vec<SeedUser>,
    rooms: Vec<SeedRoom>,
}

/// A user account declared under `[[seed.users]]`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SeedUser {
    /// Stable account id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Optional avatar URL.
    #[serde(default)]
    pub avatar: Option<String>,
    /// Account role; member when omitted.
    #[serde(default)]
    pub role: Option<Role>,
    /// Whether the account may connect; active when omitted.
    #[serde(default)]
    pub active: Option<bool>,
}

/// A room declared under `[[seed.rooms]]`.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct SeedRoom {
    /// Stable room id.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Room kind; group when omitted.
    #[serde(default)]
    pub kind: Option<RoomKind>,
    /// Whether the room accepts joins; active when omitted.
    #[serde(default)]
    pub active: Option<bool>,
    /// User ids allowed into the room.
    pub participants: Vec<i64>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the huddle server.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Huddle support-chat server")]
pub struct ServerCliArgs {
    /// Address to bind the WebSocket listener to.
    #[arg(short, long, env = "HUDDLE_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/huddle-server/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// HMAC secret used to sign and verify credentials.
    #[arg(long, env = "HUDDLE_SECRET", hide_env_values = true)]
    pub secret: Option<String>,

    /// Seconds a connection may stay silent before eviction.
    #[arg(long)]
    pub idle_threshold_secs: Option<u64>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "HUDDLE_LOG")]
    pub log_level: String,

    /// Maintenance subcommand; the server runs when omitted.
    #[command(subcommand)]
    pub command: Option<ServerCommand>,
}

/// Maintenance subcommands.
#[derive(clap::Subcommand, Debug, Clone)]
pub enum ServerCommand {
    /// Mint a signed development credential for a user id.
    Token {
        /// User id the credential identifies.
        #[arg(long)]
        user: i64,

        /// Credential lifetime in seconds.
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the listener to (e.g., `0.0.0.0:4010`).
    pub bind_addr: String,
    /// HMAC secret for credential verification.
    pub secret: String,
    /// Whether the secret was generated for this process run. Tokens
    /// signed against a generated secret die with the process.
    pub generated_secret: bool,
    /// Behavior tuning for the gateway.
    pub settings: GatewaySettings,
    /// Users to seed into the in-memory directory.
    pub seed_users: Vec<SeedUser>,
    /// Rooms to seed into the in-memory directory.
    pub seed_rooms: Vec<SeedRoom>,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for ServerConfig {
    /// A default configuration carries a freshly generated ephemeral
    /// secret.
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4010".to_string(),
            secret: uuid::Uuid::now_v7().simple().to_string(),
            generated_secret: true,
            settings: GatewaySettings::default(),
            seed_users: Vec::new(),
            seed_rooms: Vec::new(),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an
    /// error. If no `--config` is given, the default path is tried and a
    /// missing file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the explicit config file cannot be read
    /// or parsed.
    pub fn load(cli: &ServerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Resolve a `ServerConfig` from CLI args and a parsed config file.
    ///
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &ServerCliArgs, file: &ServerConfigFile) -> Self {
        let defaults = Self::default();
        let tuning = GatewaySettings::default();

        let (secret, generated_secret) = match cli
            .secret
            .clone()
            .or_else(|| file.server.secret.clone())
        {
            Some(secret) => (secret, false),
            None => (defaults.secret, true),
        };

        let settings = GatewaySettings {
            auth_timeout: secs_or(file.chat.auth_timeout_secs, tuning.auth_timeout),
            typing_window: secs_or(file.chat.typing_window_secs, tuning.typing_window),
            idle_threshold: secs_or(
                cli.idle_threshold_secs.or(file.chat.idle_threshold_secs),
                tuning.idle_threshold,
            ),
            sweep_interval: secs_or(file.chat.sweep_interval_secs, tuning.sweep_interval),
            resume_gap_limit: file.chat.resume_gap_limit.unwrap_or(tuning.resume_gap_limit),
        };

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            secret,
            generated_secret,
            settings,
            seed_users: file.seed.users.clone(),
            seed_rooms: file.seed.rooms.clone(),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn secs_or(value: Option<u64>, fallback: Duration) -> Duration {
    value.map_or(fallback, Duration::from_secs)
}

/// Load and parse a TOML config file for the server.
fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<ServerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(ServerConfigFile::default());
        };
        config_dir.join("huddle-server").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ServerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
