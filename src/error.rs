//! Error types shared by the store-facing components

use thiserror::Error;

/// Failures raised by lookups, row mapping and the audit writer.
///
/// Expected denials are never errors; they resolve to
/// [`HookResponse::Next`](crate::webhook::HookResponse::Next).
#[derive(Debug, Error)]
pub enum Error {
    /// The store could not be reached (connection acquisition failed)
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// A store call was made but failed
    #[error("store query failed: {0}")]
    Query(String),

    /// The policy JSON attached to a token could not be parsed
    #[error("invalid security policy: {0}")]
    InvalidPolicy(#[from] serde_json::Error),

    /// The store returned a token type this crate does not know
    #[error("unknown token type: {0}")]
    UnknownTokenType(String),

    /// The store returned a row without a required value
    #[error("incomplete row: missing {0}")]
    IncompleteRow(&'static str),

    /// The audit writer thread could not be started
    #[error("failed to start audit writer: {0}")]
    WriterSpawn(#[source] std::io::Error),
}

/// Result alias for store-facing operations
pub type Result<T> = std::result::Result<T, Error>;
