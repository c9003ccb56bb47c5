mod ssh;
mod telnet;

use crate::config::{SshConfig, TelnetConfig};
use crate::error::{ApiError, BridgeResult, ErrorCode};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

pub use ssh::{SshConnectParams, SshTransport};
pub use telnet::{TelnetConnectParams, TelnetTransport};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Ssh,
    Telnet,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ssh => "ssh",
            Protocol::Telnet => "telnet",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Ssh => 22,
            Protocol::Telnet => 23,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Protocol::Ssh => "SSH",
            Protocol::Telnet => "Telnet",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ApiError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ssh" => Ok(Protocol::Ssh),
            "telnet" => Ok(Protocol::Telnet),
            _ => Err(ApiError::new(
                ErrorCode::Unsupported,
                format!("Unsupported protocol: {value}"),
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadChunk {
    Data(Bytes),
    Empty,
    Eof,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn protocol(&self) -> Protocol;

    async fn read_chunk(&self) -> BridgeResult<ReadChunk>;

    async fn write_chunk(&self, data: &[u8]) -> BridgeResult<()>;

    async fn resize(&self, cols: u16, rows: u16) -> BridgeResult<()>;

    // Must tolerate repeated calls.
    async fn close(&self);

    fn idle_backoff(&self) -> Duration {
        Duration::ZERO
    }
}

#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, session_id: &str, request: &ConnectRequest)
    -> BridgeResult<Arc<dyn Transport>>;
}

pub struct RemoteConnector {
    ssh: SshConfig,
    telnet: TelnetConfig,
}

impl RemoteConnector {
    pub fn new(ssh: SshConfig, telnet: TelnetConfig) -> Self {
        Self { ssh, telnet }
    }
}

#[async_trait]
impl Connector for RemoteConnector {
    async fn connect(
        &self,
        session_id: &str,
        request: &ConnectRequest,
    ) -> BridgeResult<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match request.protocol {
            Protocol::Ssh => {
                let username = request.username.clone().ok_or_else(|| {
                    ApiError::new(ErrorCode::InvalidArgument, "SSH requires a username")
                })?;
                let password = request.password.clone().ok_or_else(|| {
                    ApiError::new(ErrorCode::InvalidArgument, "SSH requires a password")
                })?;
                let transport = SshTransport::connect(SshConnectParams {
                    session_id,
                    host: &request.host,
                    port: request.port,
                    username,
                    password,
                    config: &self.ssh,
                })
                .await?;
                Arc::new(transport)
            }
            Protocol::Telnet => {
                let transport = TelnetTransport::connect(TelnetConnectParams {
                    session_id,
                    host: &request.host,
                    port: request.port,
                    username: request.username.clone(),
                    password: request.password.clone(),
                    config: &self.telnet,
                })
                .await?;
                Arc::new(transport)
            }
        };
        Ok(transport)
    }
}
