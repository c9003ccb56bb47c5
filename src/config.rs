use crate::error::{ApiError, BridgeResult, ErrorCode};
use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "termbridge.toml";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, ValueEnum, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum AuthMode {
    #[default]
    Disabled,
    Jwt,
    Portal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
#[derive(Default)]
pub enum TelnetLineEnding {
    Cr,
    Crlf,
    Lf,
    #[default]
    #[serde(alias = "pass_through")]
    PassThrough,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct Config {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub ssh: SshConfig,
    pub telnet: TelnetConfig,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub allowed_origins: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8000".to_string(),
            allowed_origins: vec![
                "http://localhost:3000".to_string(),
                "http://localhost:3001".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub max_sessions: usize,
    pub outbound_queue: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 100,
            outbound_queue: 256,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    pub connect_timeout_ms: u64,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    pub poll_interval_ms: u64,
    pub keepalive_interval_ms: u64,
    pub write_queue: usize,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
            poll_interval_ms: 10,
            keepalive_interval_ms: 30_000,
            write_queue: 64,
        }
    }
}

impl SshConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelnetConfig {
    pub connect_min_wait_ms: u64,
    pub connect_max_wait_ms: u64,
    pub settle_delay_ms: u64,
    pub read_timeout_ms: u64,
    pub term: String,
    pub cols: u16,
    pub rows: u16,
    pub line_ending: TelnetLineEnding,
}

impl Default for TelnetConfig {
    fn default() -> Self {
        Self {
            connect_min_wait_ms: 200,
            connect_max_wait_ms: 5_000,
            settle_delay_ms: 500,
            read_timeout_ms: 100,
            term: "xterm".to_string(),
            cols: 80,
            rows: 24,
            line_ending: TelnetLineEnding::PassThrough,
        }
    }
}

impl TelnetConfig {
    pub fn min_wait(&self) -> Duration {
        Duration::from_millis(self.connect_min_wait_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.connect_max_wait_ms.max(self.connect_min_wait_ms))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub jwt_secret: String,
    pub verify_url: String,
    pub verify_timeout_ms: u64,
    pub login_url: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Disabled,
            jwt_secret: String::new(),
            verify_url: "http://localhost:4000/users/verify-token".to_string(),
            verify_timeout_ms: 5_000,
            login_url: String::new(),
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
#[command(author, version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    #[command(about = "Run the WebSocket terminal bridge")]
    Serve(ServeArgs),
    #[command(about = "Print the effective configuration as TOML")]
    Config(ServeArgs),
}

#[derive(Debug, Parser, Clone, Default)]
pub struct ServeArgs {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub listen: Option<String>,
    #[arg(long)]
    pub auth_mode: Option<AuthMode>,
    #[arg(long)]
    pub log_level: Option<String>,
}

impl Config {
    pub fn load(args: &ServeArgs) -> BridgeResult<Self> {
        let _ = dotenvy::dotenv();
        let mut config = if let Some(path) = &args.config {
            Self::from_file(path)?
        } else if Path::new(DEFAULT_CONFIG_FILE).exists() {
            Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?
        } else {
            Self::default()
        };

        config.apply_env();
        config.apply_cli(args);
        config.validate()?;
        Ok(config)
    }

    fn from_file(path: &Path) -> BridgeResult<Self> {
        let content = fs::read_to_string(path).map_err(|err| {
            ApiError::new(ErrorCode::IoError, "Failed to read config file")
                .with_details(err.to_string())
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> BridgeResult<Self> {
        let parsed: Self = toml::from_str(content).map_err(|err| {
            ApiError::new(ErrorCode::InvalidArgument, "Failed to parse config file")
                .with_details(err.to_string())
        })?;
        Ok(parsed)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = env::var("TERMBRIDGE_LISTEN") {
            self.server.listen = value;
        }
        if let Ok(value) = env::var("TERMBRIDGE_ALLOWED_ORIGINS") {
            self.server.allowed_origins = value
                .split(',')
                .map(str::trim)
                .filter(|origin| !origin.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Ok(value) = env::var("TERMBRIDGE_LOG_LEVEL") {
            self.logging.level = value;
        }
        if let Ok(value) = env::var("TERMBRIDGE_AUTH_MODE")
            && let Some(mode) = parse_auth_mode(&value)
        {
            self.auth.mode = mode;
        }
        if let Ok(value) = env::var("TERMBRIDGE_JWT_SECRET") {
            self.auth.jwt_secret = value;
        }
        if let Ok(value) = env::var("TERMBRIDGE_VERIFY_URL") {
            self.auth.verify_url = value;
        }
        if let Ok(value) = env::var("TERMBRIDGE_LOGIN_URL") {
            self.auth.login_url = value;
        }
    }

    fn apply_cli(&mut self, args: &ServeArgs) {
        if let Some(listen) = &args.listen {
            self.server.listen = listen.clone();
        }
        if let Some(mode) = args.auth_mode {
            self.auth.mode = mode;
        }
        if let Some(level) = &args.log_level {
            self.logging.level = level.clone();
        }
    }

    pub fn validate(&self) -> BridgeResult<()> {
        if self.auth.mode == AuthMode::Jwt && self.auth.jwt_secret.is_empty() {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "auth.jwt_secret is required when auth.mode = \"jwt\"",
            )
            .into());
        }
        if self.auth.mode == AuthMode::Portal && self.auth.verify_url.is_empty() {
            return Err(ApiError::new(
                ErrorCode::InvalidArgument,
                "auth.verify_url is required when auth.mode = \"portal\"",
            )
            .into());
        }
        if self.session.outbound_queue == 0 || self.ssh.write_queue == 0 {
            return Err(
                ApiError::new(ErrorCode::InvalidArgument, "Queue sizes must be non-zero").into(),
            );
        }
        Ok(())
    }
}

fn parse_auth_mode(value: &str) -> Option<AuthMode> {
    match value.to_ascii_lowercase().as_str() {
        "disabled" | "none" | "off" => Some(AuthMode::Disabled),
        "jwt" => Some(AuthMode::Jwt),
        "portal" => Some(AuthMode::Portal),
        _ => None,
    }
}
