use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidArgument,
    Unauthorized,
    ConnectTimeout,
    ConnectFailed,
    AuthFailed,
    ProtocolError,
    ProtocolViolation,
    RemoteClosed,
    IoError,
    Unsupported,
    TooManySessions,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error_code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn user_message(&self) -> String {
        match &self.details {
            Some(details) if !details.is_empty() => format!("{}: {}", self.message, details),
            _ => self.message.clone(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_code, self.message)
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{0}")]
    Api(ApiError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ApiError> for BridgeError {
    fn from(value: ApiError) -> Self {
        Self::Api(value)
    }
}

impl BridgeError {
    pub fn code(&self) -> ErrorCode {
        match self {
            BridgeError::Api(api) => api.error_code.clone(),
            BridgeError::Io(_) => ErrorCode::IoError,
            BridgeError::Json(_) => ErrorCode::ProtocolViolation,
        }
    }

    pub fn user_message(&self) -> String {
        match self {
            BridgeError::Api(api) => api.user_message(),
            other => other.to_string(),
        }
    }

    pub fn into_api(self) -> ApiError {
        match self {
            BridgeError::Api(api) => api,
            other => ApiError::new(other.code(), other.to_string()),
        }
    }
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::Unauthorized => "UNAUTHORIZED",
            ErrorCode::ConnectTimeout => "CONNECT_TIMEOUT",
            ErrorCode::ConnectFailed => "CONNECT_FAILED",
            ErrorCode::AuthFailed => "AUTH_FAILED",
            ErrorCode::ProtocolError => "PROTOCOL_ERROR",
            ErrorCode::ProtocolViolation => "PROTOCOL_VIOLATION",
            ErrorCode::RemoteClosed => "REMOTE_CLOSED",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::Unsupported => "UNSUPPORTED",
            ErrorCode::TooManySessions => "TOO_MANY_SESSIONS",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;
