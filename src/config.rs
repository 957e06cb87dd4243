use crate::error::{ApiError, ErrorCode, BridgeResult};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub ssh: SshConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub auth_token: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8790".to_string(),
            auth_token: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub output_buffer_max_chars: usize,
    pub default_cols: u16,
    pub default_rows: u16,
    pub term: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            output_buffer_max_chars: 100_000,
            default_cols: 80,
            default_rows: 24,
            term: "xterm-256color".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub openssh_path: String,
    pub connect_timeout_ms: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            openssh_path: "ssh".to_string(),
            connect_timeout_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
        }
    }
}

#[derive(Debug, Parser)]
#[command(author, version = crate::version::VERSION, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Run the session server.
    Serve(ServeArgs),
}

#[derive(Debug, Parser, Clone)]
pub struct ServeArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub auth_token: Option<String>,
    #[arg(long)]
    pub buffer_max_chars: Option<usize>,
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Config {
    pub fn load(args: &ServeArgs) -> BridgeResult<Self> {
        let mut config = if let Some(path) = &args.config {
            Self::from_file(path)?
        } else if Path::new("termbridge.toml").exists() {
            Self::from_file(Path::new("termbridge.toml"))?
        } else {
            Self::default()
        };

        config.apply_env();
        config.apply_cli(args);
        Ok(config)
    }

    fn from_file(path: &Path) -> BridgeResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to read config file")
                .with_details(err.to_string())
        })?;
        let parsed: Self = toml::from_str(&content).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to parse config file")
                .with_details(err.to_string())
        })?;
        Ok(parsed)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("TERMBRIDGE_LISTEN") {
            self.server.listen = value;
        }
        if let Ok(value) = env::var("TERMBRIDGE_AUTH_TOKEN") {
            self.server.auth_token = value;
        }
        if let Ok(value) = env::var("TERMBRIDGE_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Ok(value) = env::var("TERMBRIDGE_BUFFER_MAX_CHARS")
            && let Ok(parsed) = value.parse::<usize>()
        {
            self.session.output_buffer_max_chars = parsed;
        }
    }

    fn apply_cli(&mut self, args: &ServeArgs) {
        if let Some(listen) = &args.listen {
            self.server.listen = listen.clone();
        }
        if let Some(token) = &args.auth_token {
            self.server.auth_token = token.clone();
        }
        if let Some(max_chars) = args.buffer_max_chars {
            self.session.output_buffer_max_chars = max_chars;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.session.output_buffer_max_chars, 100_000);
        assert_eq!(config.session.default_cols, 80);
        assert_eq!(config.session.default_rows, 24);
        assert_eq!(config.ssh.connect_timeout_ms, 30_000);
    }

    #[test]
    fn cli_overrides_win_over_file_defaults() {
        let args = ServeArgs {
            config: None,
            listen: Some("0.0.0.0:9000".to_string()),
            auth_token: None,
            buffer_max_chars: Some(500),
            log_level: Some("debug".to_string()),
        };
        let mut config = Config::default();
        config.apply_cli(&args);
        assert_eq!(config.server.listen, "0.0.0.0:9000");
        assert_eq!(config.session.output_buffer_max_chars, 500);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn parses_toml_tables() {
        let parsed: Config = toml::from_str(
            r#"
            [server]
            listen = "127.0.0.1:7000"

            [session]
            output_buffer_max_chars = 4096
            "#,
        )
        .expect("parse");
        assert_eq!(parsed.server.listen, "127.0.0.1:7000");
        assert_eq!(parsed.session.output_buffer_max_chars, 4096);
        assert_eq!(parsed.session.max_sessions, 100);
    }
}
