//! Configuration for the demo server binary.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::framing::{Framing, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_LINE_LENGTH};
use crate::server::{ServerOptions, DEFAULT_MAX_CONNECTIONS};

/// Command-line arguments for the demo server
#[derive(Parser, Debug, Default)]
#[command(name = "socketr")]
#[command(version)]
#[command(about = "A minimal asynchronous TCP server", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IPv4 or IPv6 address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Framing mode: text (newline-delimited) or raw (fixed-size chunks)
    #[arg(short, long)]
    pub framing: Option<Framing>,

    /// Raw chunk size in bytes
    #[arg(short, long)]
    pub buffer_size: Option<usize>,

    /// Maximum number of concurrent connections
    #[arg(short = 'm', long)]
    pub max_connections: Option<usize>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

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
    pub framing: FramingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// How long shutdown waits for connections, in milliseconds
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_connections: default_max_connections(),
            workers: None,
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

/// Framing configuration
#[derive(Debug, Deserialize)]
pub struct FramingConfig {
    #[serde(default)]
    pub mode: Framing,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_max_line_length")]
    pub max_line_length: usize,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            mode: Framing::default(),
            buffer_size: default_buffer_size(),
            max_line_length: default_max_line_length(),
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

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    12345
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_max_line_length() -> usize {
    DEFAULT_MAX_LINE_LENGTH
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub framing: Framing,
    pub buffer_size: usize,
    pub max_line_length: usize,
    pub max_connections: usize,
    pub shutdown_grace: Duration,
    pub workers: Option<usize>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::resolve(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point to, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn resolve(cli: CliArgs) -> Result<Self, ConfigError> {
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
            port: cli.port.unwrap_or(toml_config.server.port),
            framing: cli.framing.unwrap_or(toml_config.framing.mode),
            buffer_size: cli.buffer_size.unwrap_or(toml_config.framing.buffer_size),
            max_line_length: toml_config.framing.max_line_length,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            shutdown_grace: Duration::from_millis(toml_config.server.shutdown_grace_ms),
            workers: cli.workers.or(toml_config.server.workers),
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
        if self.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be greater than 0"));
        }
        if self.max_line_length == 0 {
            return Err(ConfigError::Invalid("max_line_length must be greater than 0"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::Invalid("max_connections must be greater than 0"));
        }
        Ok(())
    }

    /// Options for the [`Server`](crate::Server).
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            buffer_size: self.buffer_size,
            max_line_length: self.max_line_length,
            max_connections: self.max_connections,
            shutdown_grace: self.shutdown_grace,
        }
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{}': {}", .0.display(), .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{}': {}", .0.display(), .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 12345);
        assert_eq!(config.framing.mode, Framing::Text);
        assert_eq!(config.framing.buffer_size, 1024);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "::1"
            port = 9000
            workers = 4
            shutdown_grace_ms = 250

            [framing]
            mode = "raw"
            buffer_size = 4096

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "::1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.shutdown_grace_ms, 250);
        assert_eq!(config.framing.mode, Framing::Raw);
        assert_eq!(config.framing.buffer_size, 4096);
        assert_eq!(config.framing.max_line_length, DEFAULT_MAX_LINE_LENGTH);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_framing_rejected() {
        let toml_str = r#"
            [framing]
            mode = "lines"
        "#;
        assert!(toml::from_str::<TomlConfig>(toml_str).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut file = tempfile_path("socketr-config-test.toml");
        writeln!(
            file.1,
            "[server]\nport = 9000\n[framing]\nmode = \"raw\"\n[logging]\nlevel = \"warn\""
        )
        .unwrap();

        let cli = CliArgs {
            config: Some(file.0.clone()),
            port: Some(7000),
            log_level: "info".to_string(),
            ..CliArgs::default()
        };
        let config = Config::resolve(cli).unwrap();
        assert_eq!(config.port, 7000);
        assert_eq!(config.framing, Framing::Raw);
        assert_eq!(config.log_level, "warn");
        assert_eq!(config.server_options().buffer_size, 1024);

        std::fs::remove_file(&file.0).ok();
    }

    #[test]
    fn test_cli_parsing() {
        let cli = CliArgs::parse_from(["socketr", "--port", "4000", "--framing", "raw"]);
        assert_eq!(cli.port, Some(4000));
        assert_eq!(cli.framing, Some(Framing::Raw));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn test_missing_file() {
        let cli = CliArgs {
            config: Some(PathBuf::from("/nonexistent/socketr.toml")),
            log_level: "info".to_string(),
            ..CliArgs::default()
        };
        assert!(matches!(
            Config::resolve(cli),
            Err(ConfigError::FileRead(..))
        ));
    }

    #[test]
    fn test_zero_buffer_rejected() {
        let cli = CliArgs {
            buffer_size: Some(0),
            log_level: "info".to_string(),
            ..CliArgs::default()
        };
        assert!(matches!(Config::resolve(cli), Err(ConfigError::Invalid(_))));
    }

    fn tempfile_path(name: &str) -> (PathBuf, std::fs::File) {
        let path = std::env::temp_dir().join(format!("{}-{}", std::process::id(), name));
        let file = std::fs::File::create(&path).unwrap();
        (path, file)
    }
}
