//! Configuration module for the telemetry server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

/// Command-line arguments for the telemetry server
#[derive(Parser, Debug)]
#[command(name = "telemsink")]
#[command(version = "0.1.0")]
#[command(about = "A TCP server that acknowledges framed telemetry packets", long_about = None)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to bind to (e.g., 127.0.0.1:8080)
    #[arg(short = 'l', long)]
    pub listen: Option<String>,

    /// Close each connection after receiving this many packets
    /// (for bounded test or benchmark runs)
    #[arg(short = 'n', long)]
    pub max_packets: Option<u64>,

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
    pub limits: LimitsConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
        }
    }
}

/// Per-connection limits and timeouts
#[derive(Debug, Deserialize)]
pub struct LimitsConfig {
    /// Packet budget per connection (absent = unbounded)
    pub max_packets: Option<u64>,
    /// Idle read deadline in seconds; a silent connection is dropped
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    /// Write deadline in seconds for each response
    #[serde(default = "default_write_timeout")]
    pub write_timeout: u64,
    /// Seconds to wait before closing a finished connection,
    /// letting in-flight bytes drain
    #[serde(default = "default_close_grace")]
    pub close_grace: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_packets: None,
            idle_timeout: default_idle_timeout(),
            write_timeout: default_write_timeout(),
            close_grace: default_close_grace(),
        }
    }
}

/// Statistics reporting configuration
#[derive(Debug, Deserialize)]
pub struct StatsConfig {
    /// Seconds between per-connection snapshot reports
    #[serde(default = "default_report_interval")]
    pub report_interval: u64,
    /// Seconds between aggregate flushes to the log
    #[serde(default = "default_flush_interval")]
    pub flush_interval: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            report_interval: default_report_interval(),
            flush_interval: default_flush_interval(),
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
    "127.0.0.1:8080".to_string()
}

fn default_idle_timeout() -> u64 {
    180
}

fn default_write_timeout() -> u64 {
    10
}

fn default_close_grace() -> u64 {
    5
}

fn default_report_interval() -> u64 {
    30
}

fn default_flush_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen: String,
    pub max_packets: Option<u64>,
    pub idle_timeout: u64,
    pub write_timeout: u64,
    pub close_grace: u64,
    pub report_interval: u64,
    pub flush_interval: u64,
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
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        // Merge CLI args with TOML config (CLI takes precedence)
        Ok(Config {
            listen: cli.listen.unwrap_or(toml_config.server.listen),
            max_packets: cli.max_packets.or(toml_config.limits.max_packets),
            idle_timeout: toml_config.limits.idle_timeout,
            write_timeout: toml_config.limits.write_timeout,
            close_grace: toml_config.limits.close_grace,
            report_interval: toml_config.stats.report_interval,
            flush_interval: toml_config.stats.flush_interval,
            log_level: if cli.log_level != "info" {
                cli.log_level
            } else {
                toml_config.logging.level
            },
        })
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
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
        }
    }
}

impl std::error::Error for ConfigError {}
