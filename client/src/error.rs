//! Error types for ensemble-client

use std::path::PathBuf;
use thiserror::Error;

/// Local persistence is unavailable.
///
/// Fatal to the single operation that hit it; always surfaced to the caller.
#[derive(Debug, Error)]
pub enum StorageFailure {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot for {key} could not be encoded: {source}")]
    Encode {
        key: String,
        #[source]
        source: ensemble_engine::Error,
    },

    #[error("snapshot for {key} is unreadable: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: ensemble_engine::Error,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

/// The remote mirror could not be reached or answered unexpectedly.
///
/// Recovered locally by falling back to the last-known local snapshot.
#[derive(Debug, Error)]
pub enum NetworkFailure {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {url}")]
    Status { status: u16, url: String },

    #[error("websocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("server rejected request: {0}")]
    Rejected(String),

    #[error("no answer within {0:?}")]
    Timeout(std::time::Duration),

    #[error("remote unreachable")]
    Offline,
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkFailure {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        NetworkFailure::WebSocket(Box::new(err))
    }
}

impl From<url::ParseError> for NetworkFailure {
    fn from(err: url::ParseError) -> Self {
        NetworkFailure::InvalidUrl(err.to_string())
    }
}

/// Errors returned by the orchestrator and the binding.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Storage(#[from] StorageFailure),

    #[error(transparent)]
    Network(#[from] NetworkFailure),

    #[error(transparent)]
    Engine(#[from] ensemble_engine::Error),
}

impl SyncError {
    /// Whether no data access of any kind was possible.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, SyncError::Storage(_))
    }
}

/// Result type alias for sync operations
pub type Result<T, E = SyncError> = std::result::Result<T, E>;
