//! Configuration module for the echo relay server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Command-line arguments for the echo relay
#[derive(Parser, Debug)]
#[command(name = "echo-relay")]
#[command(version)]
#[command(about = "A readiness-driven TCP echo relay", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:7007)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum concurrent sessions per worker
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Maximum bytes read from a socket at once
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Per-session overflow limit in bytes (0 = unbounded)
    #[arg(long)]
    pub max_overflow: Option<usize>,

    /// Close sessions idle for this many seconds (0 = never)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,
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
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Maximum concurrent sessions per worker
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Poll events processed per iteration
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            workers: None,
            max_connections: default_max_connections(),
            batch_size: default_batch_size(),
        }
    }
}

/// Relay-related configuration
#[derive(Debug, Deserialize)]
pub struct RelayConfig {
    /// Maximum bytes per read
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Overflow limit in bytes (0 = unbounded)
    #[serde(default)]
    pub max_overflow: usize,
    /// Idle timeout in seconds (0 = never)
    #[serde(default)]
    pub idle_timeout: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_overflow: 0,
            idle_timeout: 0,
        }
    }
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

fn default_listen() -> String {
    "127.0.0.1:7007".to_string()
}

fn default_max_connections() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    1024
}

fn default_chunk_size() -> usize {
    8 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: SocketAddr,
    /// Worker threads (`None` = one per CPU core)
    pub workers: Option<usize>,
    pub max_connections: usize,
    pub batch_size: usize,
    pub chunk_size: usize,
    /// Overflow limit in bytes (`None` = unbounded)
    pub max_overflow: Option<usize>,
    /// Idle timeout (`None` = never)
    pub idle_timeout: Option<Duration>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    /// CLI arguments take precedence over TOML file values.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        // Load TOML config if specified
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|source| ConfigError::FileRead {
                    path: config_path.clone(),
                    source,
                })?;
            toml::from_str(&contents)
                .map_err(|source| ConfigError::TomlParse {
                    path: config_path.clone(),
                    source,
                })?
        } else {
            TomlConfig::default()
        };

        Self::merge(cli, toml_config)
    }

    /// Merge CLI args with TOML config (CLI takes precedence) and validate.
    pub fn merge(cli: CliArgs, toml_config: TomlConfig) -> Result<Self, ConfigError> {
        let listen = cli.listen.unwrap_or(toml_config.server.listen);
        let listen = listen
            .parse::<SocketAddr>()
            .map_err(|_| ConfigError::InvalidListen(listen.clone()))?;

        let chunk_size = cli.chunk_size.unwrap_or(toml_config.relay.chunk_size);
        if chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than 0"));
        }

        let workers = cli.workers.or(toml_config.server.workers);
        if workers == Some(0) {
            return Err(ConfigError::Invalid("workers must be greater than 0"));
        }

        let max_connections = cli
            .max_connections
            .unwrap_or(toml_config.server.max_connections);
        if max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be greater than 0"));
        }

        let max_overflow = cli.max_overflow.unwrap_or(toml_config.relay.max_overflow);
        let idle_timeout = cli.idle_timeout.unwrap_or(toml_config.relay.idle_timeout);

        Ok(Config {
            listen,
            workers,
            max_connections,
            batch_size: toml_config.server.batch_size.max(1),
            chunk_size,
            max_overflow: (max_overflow > 0).then_some(max_overflow),
            idle_timeout: (idle_timeout > 0).then(|| Duration::from_secs(idle_timeout)),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {source}", .path.display())]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file '{}': {source}", .path.display())]
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid listen address '{0}'")]
    InvalidListen(String),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("echo-relay").chain(args.iter().copied()))
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.listen, "127.0.0.1:7007");
        assert_eq!(config.server.max_connections, 10_000);
        assert_eq!(config.relay.chunk_size, 8 * 1024);
        assert_eq!(config.relay.max_overflow, 0);
        assert_eq!(config.relay.idle_timeout, 0);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            listen = "0.0.0.0:9000"
            workers = 4
            batch_size = 256

            [relay]
            chunk_size = 16384
            max_overflow = 1048576
            idle_timeout = 30

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.batch_size, 256);
        assert_eq!(config.relay.chunk_size, 16384);
        assert_eq!(config.relay.max_overflow, 1048576);
        assert_eq!(config.relay.idle_timeout, 30);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_merge_defaults() {
        let config = Config::merge(cli(&[]), TomlConfig::default()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:7007".parse().unwrap());
        assert_eq!(config.workers, None);
        assert_eq!(config.chunk_size, 8 * 1024);
        assert_eq!(config.max_overflow, None);
        assert_eq!(config.idle_timeout, None);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            listen = "0.0.0.0:9000"
            [relay]
            max_overflow = 4096
            idle_timeout = 10
            [logging]
            level = "warn"
        "#,
        )
        .unwrap();

        let config = Config::merge(
            cli(&[
                "--listen",
                "127.0.0.1:9100",
                "--idle-timeout",
                "5",
                "--log-level",
                "trace",
            ]),
            toml_config,
        )
        .unwrap();

        assert_eq!(config.listen.port(), 9100);
        assert_eq!(config.max_overflow, Some(4096));
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::merge(cli(&["--listen", "not-an-address"]), TomlConfig::default())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidListen(_)));

        let err = Config::merge(cli(&["--chunk-size", "0"]), TomlConfig::default()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid configuration: chunk_size must be greater than 0"
        );

        let err = Config::merge(cli(&["-w", "0"]), TomlConfig::default()).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
