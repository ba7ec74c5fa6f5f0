//! Configuration for the `PairChat` broker.
//!
//! Supports layered configuration with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables (via clap `env` attribute)
//! 3. TOML config file (`~/.config/pairchat-broker/config.toml`)
//! 4. Compiled defaults

use std::path::PathBuf;
use std::time::Duration;

/// Errors that can occur when loading broker configuration.
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

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct BrokerConfigFile {
    server: ServerFileConfig,
    auth: AuthFileConfig,
}

/// `[server]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct ServerFileConfig {
    bind_addr: Option<String>,
    heartbeat_ms: Option<u64>,
    max_body_size: Option<usize>,
    max_log_size: Option<usize>,
}

/// `[auth]` section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct AuthFileConfig {
    tokens: Option<Vec<String>>,
}

// ---------------------------------------------------------------------------
// CLI arguments
// ---------------------------------------------------------------------------

/// CLI arguments for the broker.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "PairChat STOMP broker")]
pub struct BrokerCliArgs {
    /// Address to bind the broker to.
    #[arg(short, long, env = "PAIRCHAT_BROKER_ADDR")]
    pub bind: Option<String>,

    /// Path to config file (default: `~/.config/pairchat-broker/config.toml`).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Accepted bearer token. Repeat for several; none accepts any token.
    #[arg(
        long = "token",
        env = "PAIRCHAT_BROKER_TOKENS",
        value_delimiter = ',',
        hide_env_values = true
    )]
    pub tokens: Vec<String>,

    /// Heart-beat interval offered to clients, in milliseconds (0 disables).
    #[arg(long)]
    pub heartbeat_ms: Option<u64>,

    /// Maximum `SEND` body size in bytes.
    #[arg(long)]
    pub max_body_size: Option<usize>,

    /// Maximum number of messages kept per conversation.
    #[arg(long)]
    pub max_log_size: Option<usize>,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, default_value = "info", env = "PAIRCHAT_BROKER_LOG")]
    pub log_level: String,
}

// ---------------------------------------------------------------------------
// Resolved configuration
// ---------------------------------------------------------------------------

/// Fully resolved broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address to bind the server to (e.g., `0.0.0.0:9000`).
    pub bind_addr: String,
    /// Accepted bearer tokens; empty accepts any.
    pub tokens: Vec<String>,
    /// Heart-beat interval offered in `CONNECTED`.
    pub heartbeat: Duration,
    /// Maximum `SEND` body size in bytes.
    pub max_body_size: usize,
    /// Maximum number of messages kept per conversation.
    pub max_log_size: usize,
    /// Log level filter string.
    pub log_level: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:9000".to_string(),
            tokens: Vec::new(),
            heartbeat: Duration::from_secs(4),
            max_body_size: 64 * 1024,
            max_log_size: 10_000,
            log_level: "info".to_string(),
        }
    }
}

impl BrokerConfig {
    /// Load configuration by merging CLI args, env vars, and a TOML file.
    ///
    /// If `--config` is given and the file does not exist, returns an error.
    /// Otherwise a missing default file is treated as empty config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the config file cannot be read or parsed.
    pub fn load(cli: &BrokerCliArgs) -> Result<Self, ConfigError> {
        let file = load_config_file(cli.config.as_deref())?;
        Ok(Self::resolve(cli, &file))
    }

    /// Priority: CLI > file > default.
    fn resolve(cli: &BrokerCliArgs, file: &BrokerConfigFile) -> Self {
        let defaults = Self::default();

        let tokens = if cli.tokens.is_empty() {
            file.auth.tokens.clone().unwrap_or(defaults.tokens)
        } else {
            cli.tokens.clone()
        };

        Self {
            bind_addr: cli
                .bind
                .clone()
                .or_else(|| file.server.bind_addr.clone())
                .unwrap_or(defaults.bind_addr),
            tokens,
            heartbeat: cli
                .heartbeat_ms
                .or(file.server.heartbeat_ms)
                .map_or(defaults.heartbeat, Duration::from_millis),
            max_body_size: cli
                .max_body_size
                .or(file.server.max_body_size)
                .unwrap_or(defaults.max_body_size),
            max_log_size: cli
                .max_log_size
                .or(file.server.max_log_size)
                .unwrap_or(defaults.max_log_size),
            log_level: cli.log_level.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal helpers
// ---------------------------------------------------------------------------

fn load_config_file(
    explicit_path: Option<&std::path::Path>,
) -> Result<BrokerConfigFile, ConfigError> {
    let path = if let Some(p) = explicit_path {
        let contents = std::fs::read_to_string(p).map_err(|e| ConfigError::ReadFile {
            path: p.to_path_buf(),
            source: e,
        })?;
        return Ok(toml::from_str(&contents)?);
    } else {
        let Some(config_dir) = dirs::config_dir() else {
            return Ok(BrokerConfigFile::default());
        };
        config_dir.join("pairchat-broker").join("config.toml")
    };

    match std::fs::read_to_string(&path) {
        Ok(contents) => Ok(toml::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BrokerConfigFile::default()),
        Err(e) => Err(ConfigError::ReadFile { path, source: e }),
    }
}
