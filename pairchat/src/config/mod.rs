//! Configuration system for the `pairchat` client.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/pairchat/config.toml`)
//! 4. Compiled defaults
//!
//! Missing config file is not an error (defaults are used). An explicit
//! `--config` path that doesn't exist is an error.

use std::path::PathBuf;
use std::time::Duration;

use pairchat_proto::address::{ParticipantId, Role};

use crate::chat::ChatConfig;
use crate::connection::{ConnectionConfig, Credential};
use crate::resolver::{CounterpartRef, Participant};

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

    /// A setting required to start a session is absent.
    #[error("missing required setting `{0}`")]
    Missing(&'static str),

    /// A setting is present but unusable.
    #[error("invalid setting `{key}`: {reason}")]
    Invalid {
        /// The offending key.
        key: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// TOML file structs (all fields Option for partial overrides)
// ---------------------------------------------------------------------------

/// Top-level TOML config file structure.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ConfigFile {
    network: NetworkFileConfig,
    chat: ChatFileConfig,
    identity: IdentityFileConfig,
}

/// `[network]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkFileConfig {
    endpoint: Option<String>,
    history_url: Option<String>,
    connect_timeout_ms: Option<u64>,
    reconnect_delay_ms: Option<u64>,
    heartbeat_ms: Option<u64>,
    auth_max_attempts: Option<u32>,
    channel_capacity: Option<usize>,
    history_timeout_secs: Option<u64>,
}

/// `[chat]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ChatFileConfig {
    dedup_tolerance_ms: Option<u64>,
    event_buffer: Option<usize>,
}

/// `[identity]` section of the config file.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct IdentityFileConfig {
    participant_id: Option<String>,
    role: Option<String>,
    counterpart: Option<String>,
    token: Option<String>,
}

// ---------------------------------------------------------------------------
// Resolved configuration (concrete types, all fields populated)
// ---------------------------------------------------------------------------

/// Fully resolved client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // -- Network --
    /// Broker WebSocket URL.
    pub endpoint: Option<String>,
    /// Base URL of the history endpoint. Derived from `endpoint` when unset.
    pub history_url: Option<String>,
    /// Bound on one connect + handshake attempt; `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
    /// Delay between reconnection attempts.
    pub reconnect_delay: Duration,
    /// Heart-beat interval offered to the broker.
    pub heartbeat: Duration,
    /// Authentication failures tolerated before giving up.
    pub auth_max_attempts: u32,
    /// Channel capacity for inbound deliveries and publish commands.
    pub channel_capacity: usize,
    /// Timeout for one history request.
    pub history_timeout: Duration,

    // -- Chat --
    /// Reconciliation and event settings.
    pub chat: ChatConfig,

    // -- Identity --
    /// Local participant id.
    pub participant_id: Option<String>,
    /// Local role (`A` or `B`).
    pub role: Option<String>,
    /// Counterpart id; unset means no one is assigned yet.
    pub counterpart: Option<String>,
    /// Bearer token.
    pub token: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            history_url: None,
            connect_timeout: None,
            reconnect_delay: Duration::from_millis(3000),
            heartbeat: Duration::from_millis(4000),
            auth_max_attempts: 3,
            channel_capacity: 256,
            history_timeout: Duration::from_secs(10),
            chat: ChatConfig::default(),
            participant_id: None,
            role: None,
            counterpart: None,
            token: None,
        }
    }
}

/// Everything needed to build a [`crate::chat::ChatSession`].
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Who we are.
    pub participant: Participant,
    /// Credential for the broker and history endpoint.
    pub credential: Credential,
    /// Who we talk to.
    pub counterpart: CounterpartRef,
    /// Live channel tunables.
    pub connection: ConnectionConfig,
    /// History endpoint base URL.
    pub history_url: String,
    /// History request timeout.
    pub history_timeout: Duration,
    /// Chat tunables.
    pub chat: ChatConfig,
}

impl ClientConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// If no `--config` is given, the default path
    /// (`~/.config/pairchat/config.toml`) is tried and silently ignored if
    /// missing.
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
    /// Priority: CLI > file > default.
    #[must_use]
    fn resolve(cli: &CliArgs, file: &ConfigFile) -> Self {
        let defaults = Self::default();
        let pick = |cli: &Option<String>, file: &Option<String>| cli.clone().or_else(|| file.clone());

        Self {
            endpoint: pick(&cli.endpoint, &file.network.endpoint),
            history_url: pick(&cli.history_url, &file.network.history_url),
            connect_timeout: file
                .network
                .connect_timeout_ms
                .map(Duration::from_millis)
                .or(defaults.connect_timeout),
            reconnect_delay: file
                .network
                .reconnect_delay_ms
                .map_or(defaults.reconnect_delay, Duration::from_millis),
            heartbeat: file
                .network
                .heartbeat_ms
                .map_or(defaults.heartbeat, Duration::from_millis),
            auth_max_attempts: file
                .network
                .auth_max_attempts
                .unwrap_or(defaults.auth_max_attempts),
            channel_capacity: file
                .network
                .channel_capacity
                .unwrap_or(defaults.channel_capacity),
            history_timeout: file
                .network
                .history_timeout_secs
                .map_or(defaults.history_timeout, Duration::from_secs),
            chat: ChatConfig {
                dedup_tolerance: file
                    .chat
                    .dedup_tolerance_ms
                    .map_or(defaults.chat.dedup_tolerance, Duration::from_millis),
                event_buffer: file
                    .chat
                    .event_buffer
                    .unwrap_or(defaults.chat.event_buffer),
            },
            participant_id: pick(&cli.participant_id, &file.identity.participant_id),
            role: pick(&cli.role, &file.identity.role),
            counterpart: pick(&cli.counterpart, &file.identity.counterpart),
            token: pick(&cli.token, &file.identity.token),
        }
    }

    /// Build the channel tunables, if an endpoint is configured.
    #[must_use]
    pub fn to_connection_config(&self) -> Option<ConnectionConfig> {
        let endpoint = self.endpoint.clone()?;
        Some(ConnectionConfig {
            endpoint,
            reconnect_delay: self.reconnect_delay,
            heartbeat: self.heartbeat,
            connect_timeout: self.connect_timeout,
            auth_max_attempts: self.auth_max_attempts.max(1),
            channel_capacity: self.channel_capacity.max(1),
        })
    }

    /// Validate the identity settings and assemble a [`SessionSettings`].
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`] if endpoint, participant id, role or token
    ///   is unset.
    /// - [`ConfigError::Invalid`] if the participant id or role does not
    ///   parse, or no history URL can be derived.
    pub fn to_session_settings(&self) -> Result<SessionSettings, ConfigError> {
        let connection = self.to_connection_config().ok_or(ConfigError::Missing("endpoint"))?;
        let raw_id = self
            .participant_id
            .as_deref()
            .ok_or(ConfigError::Missing("participant_id"))?;
        let id = ParticipantId::new(raw_id).map_err(|e| ConfigError::Invalid {
            key: "participant_id",
            reason: e.to_string(),
        })?;
        let role: Role = self
            .role
            .as_deref()
            .ok_or(ConfigError::Missing("role"))?
            .parse()
            .map_err(|e: pairchat_proto::address::AddressError| ConfigError::Invalid {
                key: "role",
                reason: e.to_string(),
            })?;
        let token = self.token.as_deref().ok_or(ConfigError::Missing("token"))?;
        let history_url = match &self.history_url {
            Some(url) => url.clone(),
            None => derive_history_url(&connection.endpoint).ok_or_else(|| ConfigError::Invalid {
                key: "endpoint",
                reason: "cannot derive a history URL; set history_url".to_string(),
            })?,
        };

        Ok(SessionSettings {
            participant: Participant::new(role, id),
            credential: Credential::new(token),
            counterpart: CounterpartRef::from_option(self.counterpart.as_deref()),
            connection,
            history_url,
            history_timeout: self.history_timeout,
            chat: self.chat.clone(),
        })
    }
}

/// `ws://host:port/ws` -> `http://host:port/`, `wss://` -> `https://`.
fn derive_history_url(endpoint: &str) -> Option<String> {
    let mut url = url::Url::parse(endpoint).ok()?;
    let scheme = match url.scheme() {
        "ws" => "http",
        "wss" => "https",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    url.set_path("/");
    url.set_query(None);
    Some(url.to_string())
}

/// CLI arguments parsed by clap.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Two-party real-time chat client")]
pub struct CliArgs {
    /// WebSocket URL of the broker.
    #[arg(long, env = "PAIRCHAT_ENDPOINT")]
    pub endpoint: Option<String>,

    /// Base URL of the history endpoint (default: derived from the endpoint).
    #[arg(long, env = "PAIRCHAT_HISTORY_URL")]
    pub history_url: Option<String>,

    /// Your participant id.
    #[arg(long, env = "PAIRCHAT_PARTICIPANT")]
    pub participant_id: Option<String>,

    /// Your role in the conversation (A or B).
    #[arg(long, env = "PAIRCHAT_ROLE")]
    pub role: Option<String>,

    /// The participant to talk to.
    #[arg(long, env = "PAIRCHAT_COUNTERPART")]
    pub counterpart: Option<String>,

    /// Bearer token presented to the broker.
    #[arg(long, env = "PAIRCHAT_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Path to config file (default: `~/.config/pairchat/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PAIRCHAT_LOG")]
    pub log_level: String,

    /// Path to log file (default: `$TMPDIR/pairchat.log`).
    #[arg(long)]
    pub log_file: Option<PathBuf>,
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
            return Ok(ConfigFile::default());
        };
        config_dir.join("pairchat").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
