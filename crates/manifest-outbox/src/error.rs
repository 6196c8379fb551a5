//! Error types for the outbox layer.
//!
//! These are infrastructure failures only. Business-rule rejections
//! never reach this layer; a failed command stages no transaction.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OutboxError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Outbox record not found: {id}")]
    RecordNotFound { id: String },

    #[error("Duplicate event sequence {seq} for aggregate {aggregate_type}/{aggregate_id}")]
    DuplicateSequence {
        aggregate_type: String,
        aggregate_id: String,
        seq: u64,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for outbox operations.
pub type OutboxResult<T> = std::result::Result<T, OutboxError>;
