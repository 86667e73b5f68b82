//! Error types surfaced to callers

use callbridge_api::{ErrorKind, ErrorPayload};
use serde_json::Value;
use thiserror::Error;

/// Result delivered to a response handler
pub type CallResult = Result<Value, BridgeError>;

/// A classified call failure
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{kind}: {message}")]
pub struct BridgeError {
    pub kind: ErrorKind,
    pub message: String,
    /// Code reported by the host, when there was one
    pub code: Option<String>,
    /// Extra data attached by the plugin
    pub data: Option<Value>,
}

impl BridgeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            code: None,
            data: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::MalformedPayload, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TransportUnavailable, message)
    }

    /// Whether the host could not resolve the target plugin or method
    pub fn is_not_found(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::PluginNotFound | ErrorKind::MethodNotFound
        )
    }
}

impl From<ErrorPayload> for BridgeError {
    fn from(payload: ErrorPayload) -> Self {
        Self {
            kind: payload.kind(),
            message: payload.message,
            code: payload.code,
            data: payload.data,
        }
    }
}

/// Errors raised by a transport collaborator
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Transport unavailable")]
    Unavailable,

    #[error("Transport send failed: {0}")]
    Send(String),
}

impl From<TransportError> for BridgeError {
    fn from(e: TransportError) -> Self {
        BridgeError::unavailable(e.to_string())
    }
}
