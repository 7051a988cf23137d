//! Configuration module for fortune-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;
use tokio::sync::Semaphore;

use crate::pipeline::Collaborator;

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "fortune-server")]
#[command(author = "fortune-server authors")]
#[command(version = "0.1.0")]
#[command(
    about = "Answers every TCP connection with a fortune rendered by cowsay",
    long_about = None
)]
pub struct CliArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Host address to bind to (e.g., 0.0.0.0)
    #[arg(long)]
    pub host: Option<String>,

    /// TCP port to listen on
    #[arg(short, long, env = "FORTUNE_SERVER_PORT")]
    pub port: Option<u16>,

    /// Listen backlog passed to listen(2)
    #[arg(long)]
    pub backlog: Option<i32>,

    /// Number of worker threads (defaults to number of CPU cores)
    #[arg(short = 'w', long)]
    pub workers: Option<usize>,

    /// Maximum number of connections handled at once (unbounded if unset)
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Program that produces the quote
    #[arg(long)]
    pub quote_program: Option<String>,

    /// Argument for the quote program (repeatable)
    #[arg(long = "quote-arg", allow_hyphen_values = true)]
    pub quote_args: Vec<String>,

    /// Program that renders the quote read from its stdin
    #[arg(long)]
    pub render_program: Option<String>,

    /// Argument for the render program (repeatable)
    #[arg(long = "render-arg", allow_hyphen_values = true)]
    pub render_args: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub collaborators: CollaboratorsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
    /// Listen backlog
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Number of worker threads
    pub workers: Option<usize>,
    /// Cap on concurrently handled connections
    pub max_connections: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            backlog: default_backlog(),
            workers: None,
            max_connections: None,
        }
    }
}

/// External programs run for every connection
#[derive(Debug, Deserialize)]
pub struct CollaboratorsConfig {
    #[serde(default = "default_quote")]
    pub quote: Collaborator,
    #[serde(default = "default_render")]
    pub render: Collaborator,
}

impl Default for CollaboratorsConfig {
    fn default() -> Self {
        Self {
            quote: default_quote(),
            render: default_render(),
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
    4499
}

fn default_backlog() -> i32 {
    1024
}

fn default_quote() -> Collaborator {
    Collaborator::new("fortune")
}

fn default_render() -> Collaborator {
    Collaborator::new("cowsay")
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
    pub workers: Option<usize>,
    pub max_connections: Option<usize>,
    pub quote: Collaborator,
    pub render: Collaborator,
    pub log_level: String,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        let cli = CliArgs::parse();

        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let config = Self::merge(cli, toml_config);
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// A cap of zero would never accept, and the semaphore backing the cap
    /// cannot hold more than `Semaphore::MAX_PERMITS` permits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self.max_connections {
            Some(limit) if limit == 0 || limit > Semaphore::MAX_PERMITS => {
                Err(ConfigError::ConnectionLimit(limit))
            }
            _ => Ok(()),
        }
    }

    /// Merge CLI args over TOML values (CLI takes precedence).
    fn merge(cli: CliArgs, toml_config: TomlConfig) -> Self {
        let TomlConfig {
            server,
            collaborators,
            logging,
        } = toml_config;

        Config {
            host: cli.host.unwrap_or(server.host),
            port: cli.port.unwrap_or(server.port),
            backlog: cli.backlog.unwrap_or(server.backlog),
            workers: cli.workers.or(server.workers),
            max_connections: cli.max_connections.or(server.max_connections),
            quote: collaborators
                .quote
                .overridden(cli.quote_program, cli.quote_args),
            render: collaborators
                .render
                .overridden(cli.render_program, cli.render_args),
            log_level: cli.log_level.unwrap_or(logging.level),
        }
    }

    /// Address string handed to the resolver, e.g. `0.0.0.0:4499`.
    pub fn listen_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Collaborator {
    /// Replace program and/or args with values given on the command line.
    fn overridden(self, program: Option<String>, args: Vec<String>) -> Self {
        let args = if args.is_empty() { self.args } else { args };
        Collaborator::with_args(program.unwrap_or(self.program), args)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
    ConnectionLimit(usize),
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
            ConfigError::ConnectionLimit(limit) => write!(
                f,
                "max_connections must be between 1 and {}, got {}",
                Semaphore::MAX_PERMITS,
                limit
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_cli(args: &[&str]) -> CliArgs {
        CliArgs::try_parse_from(std::iter::once("fortune-server").chain(args.iter().copied()))
            .unwrap()
    }

    #[test]
    fn test_default_config() {
        let config = TomlConfig::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 4499);
        assert_eq!(config.server.backlog, 1024);
        assert_eq!(config.server.max_connections, None);
        assert_eq!(config.collaborators.quote, Collaborator::new("fortune"));
        assert_eq!(config.collaborators.render, Collaborator::new("cowsay"));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_toml_parsing() {
        let toml_str = r#"
            [server]
            host = "127.0.0.1"
            port = 5000
            workers = 4
            max_connections = 64

            [collaborators.quote]
            program = "/usr/games/fortune"
            args = ["-s"]

            [collaborators.render]
            program = "cowsay"
            args = ["-f", "tux"]

            [logging]
            level = "debug"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.server.workers, Some(4));
        assert_eq!(config.server.max_connections, Some(64));
        assert_eq!(config.collaborators.quote.program, "/usr/games/fortune");
        assert_eq!(config.collaborators.quote.args, vec!["-s"]);
        assert_eq!(config.collaborators.render.args, vec!["-f", "tux"]);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_partial_collaborator_table() {
        let toml_str = r#"
            [collaborators.render]
            program = "tr"
        "#;

        let config: TomlConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.collaborators.quote, Collaborator::new("fortune"));
        assert_eq!(config.collaborators.render, Collaborator::new("tr"));
    }

    #[test]
    fn test_cli_overrides_toml() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            port = 5000
            backlog = 16

            [collaborators.render]
            program = "cowsay"
            args = ["-f", "tux"]

            [logging]
            level = "warn"
            "#,
        )
        .unwrap();

        let cli = parse_cli(&[
            "--port",
            "6000",
            "--render-program",
            "tr",
            "--render-arg",
            "a-z",
            "--render-arg",
            "A-Z",
            "--log-level",
            "trace",
        ]);

        let config = Config::merge(cli, toml_config);
        assert_eq!(config.port, 6000);
        assert_eq!(config.backlog, 16);
        assert_eq!(config.render.program, "tr");
        assert_eq!(config.render.args, vec!["a-z", "A-Z"]);
        assert_eq!(config.quote, Collaborator::new("fortune"));
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn test_cli_program_keeps_file_args() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [collaborators.quote]
            program = "fortune"
            args = ["-s"]
            "#,
        )
        .unwrap();

        let cli = parse_cli(&["--quote-program", "/usr/games/fortune"]);
        let config = Config::merge(cli, toml_config);
        assert_eq!(config.quote.program, "/usr/games/fortune");
        assert_eq!(config.quote.args, vec!["-s"]);
    }

    #[test]
    fn test_hyphenated_collaborator_args() {
        let cli = parse_cli(&["--quote-arg", "-c", "--quote-arg", "printf hi"]);
        assert_eq!(cli.quote_args, vec!["-c", "printf hi"]);
    }

    #[test]
    fn test_connection_limit_bounds() {
        let mut config = Config::merge(parse_cli(&[]), TomlConfig::default());
        assert!(config.validate().is_ok());

        config.max_connections = Some(1);
        assert!(config.validate().is_ok());

        config.max_connections = Some(Semaphore::MAX_PERMITS);
        assert!(config.validate().is_ok());

        config.max_connections = Some(0);
        assert!(matches!(config.validate(), Err(ConfigError::ConnectionLimit(0))));

        config.max_connections = Some(usize::MAX);
        assert!(matches!(config.validate(), Err(ConfigError::ConnectionLimit(usize::MAX))));
    }

    #[test]
    fn test_zero_connection_limit_from_file() {
        let toml_config: TomlConfig = toml::from_str(
            r#"
            [server]
            max_connections = 0
            "#,
        )
        .unwrap();

        let config = Config::merge(parse_cli(&[]), toml_config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_listen_addr() {
        let mut config = Config::merge(parse_cli(&[]), TomlConfig::default());
        assert_eq!(config.listen_addr(), "0.0.0.0:4499");

        config.host = "::1".to_string();
        config.port = 80;
        assert_eq!(config.listen_addr(), "[::1]:80");
    }
}
