//! Configuration module for the line relay.
//!
//! The listening port is the only required input and comes from the command
//! line. Everything else can be set with flags or a TOML file; CLI arguments
//! take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the relay
#[derive(Parser, Debug)]
#[command(name = "line-relay")]
#[command(author = "line-relay authors")]
#[command(version = "0.1.0")]
#[command(about = "A line-oriented TCP chat relay", long_about = None)]
pub struct CliArgs {
    /// TCP port to listen on
    pub port: u16,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1 or 0.0.0.0)
    #[arg(short = 'l', long)]
    pub host: Option<String>,

    /// Listen backlog (pending connection queue length)
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Maximum number of simultaneously connected clients
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Size of a single socket read in bytes
    #[arg(long)]
    pub read_buffer_size: Option<usize>,

    /// What to do when sending to a client fails
    #[arg(long, value_enum)]
    pub send_failure: Option<SendFailurePolicy>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

/// Reaction to a hard error while writing to a broadcast recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SendFailurePolicy {
    /// Disconnect the failing recipient and keep serving everyone else.
    #[default]
    Drop,
    /// Stop the server.
    Fatal,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Maximum number of simultaneously connected clients
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Size of a single socket read
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
    /// Readiness events fetched per poll
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            backlog: default_backlog(),
            max_connections: default_max_connections(),
            read_buffer_size: default_read_buffer_size(),
            event_capacity: default_event_capacity(),
        }
    }
}

/// Relay behaviour configuration
#[derive(Debug, Deserialize, Default)]
pub struct RelayConfig {
    #[serde(default)]
    pub send_failure: SendFailurePolicy,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_backlog() -> i32 {
    100
}

fn default_max_connections() -> usize {
    1024
}

fn default_read_buffer_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_event_capacity() -> usize {
    1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: i32,
    pub max_connections: usize,
    pub read_buffer_size: usize,
    pub event_capacity: usize,
    pub send_failure: SendFailurePolicy,
    pub log_level: String,
}

impl Config {
    /// Load configuration from the process arguments and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_cli(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_cli(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port,
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            read_buffer_size: cli
                .read_buffer_size
                .unwrap_or(toml_config.server.read_buffer_size),
            event_capacity: toml_config.server.event_capacity,
            send_failure: cli.send_failure.unwrap_or(toml_config.relay.send_failure),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog <= 0 {
            return Err(ConfigError::Invalid("backlog must be positive"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be positive"));
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid("read_buffer_size must be positive"));
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::Invalid("event_capacity must be positive"));
        }
        Ok(())
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    Invalid(&'static str),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::Invalid(msg) => write!(f, "Invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {}
