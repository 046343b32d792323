//! Error types for the persistence plugin.

use persist_codec::CodecError;
use thiserror::Error;

use crate::observable::ObservableError;
use crate::storage::StorageError;

/// Result type alias for persistence operations.
pub type PersistResult<T> = Result<T, PersistError>;

/// Errors surfaced by restore and change handling.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("storage error on '{key}': {source}")]
    Storage {
        key: String,
        #[source]
        source: StorageError,
    },

    #[error("codec error on '{key}': {source}")]
    Codec {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("malformed meta record: {0}")]
    Meta(String),

    #[error("transform failed for '{key}': {message}")]
    Transform { key: String, message: String },

    #[error("observable '{key}' rejected restored value: {source}")]
    Observable {
        key: String,
        #[source]
        source: ObservableError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}
