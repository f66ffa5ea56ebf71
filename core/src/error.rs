//! Error types for the chat sync core

use thiserror::Error;

/// Connection-level failures. These are absorbed by the connection manager
/// and the send pipeline; they never reach the UI as blocking errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Not connected")]
    NotConnected,

    #[error("Connection dropped: {0}")]
    ConnectionDropped(String),

    #[error("Timed out after {0} ms")]
    Timeout(u64),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("HTTP transport error: {0}")]
    Http(String),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Send failed for message {message_id}: {reason}")]
    SendFailed { message_id: String, reason: String },

    #[error("Merge conflict on message {message_id}")]
    MergeConflict { message_id: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    #[error("Server rejected request ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid conversation {0}: {1}")]
    InvalidConversation(String, String),

    #[error("Unknown conversation: {0}")]
    UnknownConversation(String),

    #[error("Unknown message: {0}")]
    UnknownMessage(String),

    #[error("Message {0} was deleted before it was acknowledged")]
    DeletedBeforeAck(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the send pipeline may retry after this error.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Transport(_) => true,
            Error::Rejected { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Transport(TransportError::Http(e.to_string()))
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::Transport(TransportError::WebSocket(e.to_string()))
    }
}

impl From<toml::de::Error> for Error {
    fn from(e: toml::de::Error) -> Self {
        Error::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Transport(TransportError::NotConnected).is_transient());
        assert!(Error::Rejected { status: 503, body: String::new() }.is_transient());
        assert!(!Error::Rejected { status: 403, body: String::new() }.is_transient());
        assert!(!Error::AuthRejected("expired".into()).is_transient());
    }
}
