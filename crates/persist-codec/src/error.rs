//! Error types for the value codec.

use thiserror::Error;

/// Result type alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur while encoding or decoding values.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown tag: {0}")]
    UnknownTag(String),

    #[error("malformed {0} payload")]
    MalformedTag(&'static str),

    #[error("reference to undefined node {0}")]
    DanglingReference(u64),

    #[error("node {0} defined twice")]
    DuplicateNode(u64),

    #[error("date out of range: {0}ms")]
    InvalidDate(i64),

    #[error("invalid regex: {0}")]
    InvalidRegex(String),

    #[error("number {0} has no i64 or f64 form")]
    UnrepresentableNumber(String),

    #[error("value nested deeper than {0} levels")]
    TooDeep(usize),
}
