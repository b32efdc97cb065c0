//! Error type shared by every public entry point of the sync layer.
//!
//! Background tasks (socket reader/writer, dial task, coalescer flush) never
//! return these to callers; they log and carry on. Only the handle methods on
//! [`ConnectionManager`](crate::ConnectionManager) surface them.

use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Sync layer errors.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("No valid auth token available")]
    AuthUnavailable,

    #[error("Socket did not open within {0:?}")]
    OpenTimeout(Duration),

    #[error("Socket is not open")]
    NotConnected,

    #[error("Send of '{action}' abandoned after {attempts} attempts")]
    SendAbandoned { action: String, attempts: u32 },

    #[error("Connection manager has shut down")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SyncError {
    /// Whether the failure should feed the reconnect path rather than be
    /// reported as a dead end.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::InvalidRequest(_) | Self::Closed)
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
