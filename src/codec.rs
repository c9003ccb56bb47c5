use crate::error::{ApiError, BridgeResult, ErrorCode};
use crate::transport::Protocol;
use axum::extract::ws::Message;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::sync::mpsc;

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Connect {
        #[serde(default)]
        protocol: Option<String>,
        data: ConnectParams,
    },
    Data {
        data: DataPayload,
    },
    Resize {
        #[serde(default)]
        data: ResizeParams,
    },
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ConnectParams {
    pub host: String,
    #[serde(default, deserialize_with = "port_number")]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum DataPayload {
    Text(String),
    Bytes(Vec<u8>),
}

impl DataPayload {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            DataPayload::Text(text) => text.as_bytes(),
            DataPayload::Bytes(bytes) => bytes,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ResizeParams {
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for ResizeParams {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

// Accepts `22` or `"22"`.
fn port_number<'de, D>(deserializer: D) -> Result<Option<u16>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawPort {
        Number(u16),
        Text(String),
    }

    match Option::<RawPort>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawPort::Number(port)) => Ok(Some(port)),
        Some(RawPort::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(RawPort::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("invalid port: {text}"))),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected {
        data: String,
        protocol: Protocol,
    },
    Error {
        data: String,
    },
}

impl ServerMessage {
    pub fn connected(protocol: Protocol) -> Self {
        ServerMessage::Connected {
            data: "Successfully connected".to_string(),
            protocol,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            data: message.into(),
        }
    }
}

pub type OutboundSender = mpsc::Sender<Outbound>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Envelope(ServerMessage),
    Output(Bytes),
}

impl Outbound {
    pub fn into_message(self) -> BridgeResult<Message> {
        match self {
            Outbound::Envelope(envelope) => Ok(Message::Text(serde_json::to_string(&envelope)?)),
            Outbound::Output(bytes) => Ok(Message::Binary(bytes.to_vec())),
        }
    }
}

pub fn decode(frame: &str) -> BridgeResult<ClientMessage> {
    serde_json::from_str(frame).map_err(|err| {
        ApiError::new(ErrorCode::ProtocolViolation, "Malformed client message")
            .with_details(err.to_string())
            .into()
    })
}
