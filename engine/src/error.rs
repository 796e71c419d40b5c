//! Error types for the ensemble engine.

use crate::CollectionKey;
use thiserror::Error;

/// All possible errors from the ensemble engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("collection '{key}' is not a JSON array: got {got}")]
    NotACollection { key: CollectionKey, got: String },

    #[error("unknown collection: {0}")]
    UnknownCollection(CollectionKey),

    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),

    #[error("invalid sync record: {0}")]
    InvalidRecord(String),
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
