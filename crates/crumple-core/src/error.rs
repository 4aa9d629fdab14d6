use std::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed taxonomy of transform failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    AuthError,
    RateLimitError,
    InvalidRequest,
    ServerError,
    NetworkError,
    TimeoutError,
    Cancelled,
    UnknownError,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitError | Self::ServerError | Self::NetworkError | Self::TimeoutError
        )
    }

    /// Machine-readable code, identical to the serialized form
    pub fn code(&self) -> &'static str {
        match self {
            Self::AuthError => "AUTH_ERROR",
            Self::RateLimitError => "RATE_LIMIT_ERROR",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::ServerError => "SERVER_ERROR",
            Self::NetworkError => "NETWORK_ERROR",
            Self::TimeoutError => "TIMEOUT_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::UnknownError => "UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// A classified failure of one transform attempt or operation
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct TransformError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status when the failure came from a response
    pub status: Option<u16>,
}

impl TransformError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "transform cancelled")
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Raw outcome of a failed exchange, before classification
#[derive(Debug, Clone, PartialEq)]
pub enum TransportFailure {
    Status { code: u16, body: String },
    Timeout,
    Network(String),
    Cancelled,
    MissingApiKey,
    /// Response body could not be understood
    Malformed(String),
    /// Well-formed response reporting `success: false`
    Rejected(String),
}

/// Map a transport failure onto exactly one [`ErrorKind`]
pub fn classify(failure: &TransportFailure) -> TransformError {
    match failure {
        TransportFailure::Status { code, body } => {
            let kind = match code {
                401 | 403 => ErrorKind::AuthError,
                429 => ErrorKind::RateLimitError,
                400..=499 => ErrorKind::InvalidRequest,
                500..=599 => ErrorKind::ServerError,
                _ => ErrorKind::UnknownError,
            };
            let message = if body.trim().is_empty() {
                format!("HTTP {code}")
            } else {
                format!("HTTP {code}: {}", body.trim())
            };
            TransformError {
                kind,
                message,
                status: Some(*code),
            }
        }
        TransportFailure::Timeout => TransformError::new(ErrorKind::TimeoutError, "request timed out"),
        TransportFailure::Network(msg) => TransformError::new(ErrorKind::NetworkError, msg.clone()),
        TransportFailure::Cancelled => TransformError::cancelled(),
        TransportFailure::MissingApiKey => TransformError::new(ErrorKind::AuthError, "API key is not configured"),
        TransportFailure::Malformed(msg) => {
            TransformError::new(ErrorKind::UnknownError, format!("malformed response: {msg}"))
        }
        TransportFailure::Rejected(msg) => {
            TransformError::new(ErrorKind::UnknownError, format!("service rejected request: {msg}"))
        }
    }
}
