use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the venue adapter
#[derive(Error, Debug)]
pub enum AdapterError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Missing required credential: {0}")]
    MissingCredential(&'static str),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // Network errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Socket {0} is not connected")]
    NotConnected(usize),

    #[error("No authenticated connection available")]
    NoAuthenticatedConnection,

    #[error("Transport error: {0}")]
    Transport(String),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Domain errors
    #[error("invalid time frame [unknown width]: {0}")]
    UnknownTimeframe(String),

    #[error("Sample source error: {0}")]
    SampleSource(String),

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // Signing errors
    #[error("Signature error: {0}")]
    Signature(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for AdapterError
pub type Result<T> = std::result::Result<T, AdapterError>;

/// Connection-level fault surfaced to subscribers as a `meta:error` event.
///
/// Kept separate from [`AdapterError`] because events are broadcast and must be `Clone`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportFault {
    /// Index of the socket that failed, if the fault is socket specific
    pub index: Option<usize>,
    pub message: String,
}

impl TransportFault {
    pub fn new(index: Option<usize>, message: impl Into<String>) -> Self {
        Self {
            index,
            message: message.into(),
        }
    }

    pub fn from_error(index: Option<usize>, err: &AdapterError) -> Self {
        Self::new(index, err.to_string())
    }
}

impl std::fmt::Display for TransportFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.index {
            Some(i) => write!(f, "socket {}: {}", i, self.message),
            None => write!(f, "{}", self.message),
        }
    }
}
