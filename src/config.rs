//! Configuration module for the multiconn server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use multiconn::{ConnectionOptions, Encoding, ServerOptions};
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "multiconn-server")]
#[command(author = "multiconn authors")]
#[command(version = "0.1.0")]
#[command(about = "A multi-client TCP server for <<EOF>>-framed text messages", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Length of the pending connection queue
    #[arg(long)]
    pub backlog: Option<u32>,

    /// Maximum number of concurrent clients
    #[arg(long)]
    pub max_clients: Option<usize>,

    /// Close a connection once this many unframed bytes are buffered
    #[arg(long)]
    pub max_receive_buffer: Option<usize>,

    /// Close a connection once this many sent bytes are waiting to be written
    #[arg(long)]
    pub max_send_queue: Option<usize>,

    /// Text encoding used on the wire
    #[arg(long, value_enum)]
    pub encoding: Option<Encoding>,

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
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Maximum number of concurrent clients
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            max_clients: default_max_clients(),
        }
    }
}

/// Per-connection configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Receive buffer limit in bytes (unbounded when absent)
    pub max_receive_buffer: Option<usize>,
    /// Send queue limit in bytes
    #[serde(default = "default_max_send_queue")]
    pub max_send_queue: usize,
    /// Text encoding
    #[serde(default)]
    pub encoding: Encoding,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_receive_buffer: None,
            max_send_queue: default_max_send_queue(),
            encoding: Encoding::default(),
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
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    5500
}

fn default_backlog() -> u32 {
    multiconn::server::DEFAULT_BACKLOG
}

fn default_max_clients() -> usize {
    multiconn::server::DEFAULT_MAX_CLIENTS
}

fn default_max_send_queue() -> usize {
    multiconn::connection::DEFAULT_MAX_SEND_QUEUE
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub backlog: u32,
    pub max_clients: usize,
    pub max_receive_buffer: Option<usize>,
    pub max_send_queue: usize,
    pub encoding: Encoding,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args over the TOML file they name, if any.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            host: cli.host.unwrap_or(toml_config.server.host),
            port: cli.port.unwrap_or(toml_config.server.port),
            backlog: cli.backlog.unwrap_or(toml_config.server.backlog),
            max_clients: cli.max_clients.unwrap_or(toml_config.server.max_clients),
            max_receive_buffer: cli
                .max_receive_buffer
                .or(toml_config.connection.max_receive_buffer),
            max_send_queue: cli
                .max_send_queue
                .unwrap_or(toml_config.connection.max_send_queue),
            encoding: cli.encoding.unwrap_or(toml_config.connection.encoding),
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }

    /// Options for the server library.
    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            max_clients: self.max_clients,
            backlog: self.backlog,
            connection: ConnectionOptions {
                encoding: self.encoding,
                max_receive_buffer: self.max_receive_buffer,
                max_send_queue: Some(self.max_send_queue),
            },
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 5500);
        assert_eq!(config.server.backlog, 100);
        assert_eq!(config.server.max_clients, 100);
        assert_eq!(config.connection.max_receive_buffer, None);
        assert_eq!(config.connection.max_send_queue, 16 * 1024 * 1024);
        assert_eq!(config.connection.encoding, Encoding::Utf8);
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 6000
            max_clients = 8

            [connection]
            max_receive_buffer = 65536
            max_send_queue = 1048576
            encoding = "latin-1"

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 6000);
        assert_eq!(config.server.backlog, 100);
        assert_eq!(config.server.max_clients, 8);
        assert_eq!(config.connection.max_receive_buffer, Some(65536));
        assert_eq!(config.connection.max_send_queue, 1048576);
        assert_eq!(config.connection.encoding, Encoding::Latin1);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_cli_overrides() {
        let cli = CliArgs::parse_from([
            "multiconn-server",
            "--port",
            "7000",
            "--max-clients",
            "3",
            "--encoding",
            "latin-1",
            "--max-receive-buffer",
            "1024",
            "--max-send-queue",
            "4096",
        ]);
        let config = Config::from_args(cli).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 7000);

        let options = config.server_options();
        assert_eq!(options.max_clients, 3);
        assert_eq!(options.backlog, 100);
        assert_eq!(options.connection.encoding, Encoding::Latin1);
        assert_eq!(options.connection.max_receive_buffer, Some(1024));
        assert_eq!(options.connection.max_send_queue, Some(4096));
    }

    #[test]
    fn test_missing_config_file() {
        let cli = CliArgs::parse_from(["multiconn-server", "-c", "/nonexistent/multiconn.toml"]);
        assert!(matches!(Config::from_args(cli), Err(ConfigError::FileRead(..))));
    }
}
