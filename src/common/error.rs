//! Error types for the CDC source pipeline
//!
//! Every failure either stops the poll loop or is surfaced to the
//! supervising caller; nothing is auto-suppressed.

use thiserror::Error;

/// CDC pipeline errors
#[derive(Error, Debug)]
pub enum CdcError {
    /// Upstream unreachable or authentication failed. Fatal at startup;
    /// retried by an external supervisor, never internally.
    #[error("connect error: {0}")]
    Connect(String),

    /// Metadata for a filtered table is missing or could not be loaded.
    /// Fatal per batch: emitting records with wrong column alignment is
    /// worse than halting.
    #[error("schema not found for {schema}.{table}")]
    SchemaNotFound {
        /// Schema (database) name
        schema: String,
        /// Table name
        table: String,
    },

    /// Malformed wire unit. Fatal for the whole fetch cycle, no partial
    /// silent drop.
    #[error("decode error: {0}")]
    Decode(String),

    /// Failed to advance the upstream read cursor. Not data loss: the unit
    /// will be redelivered on retry, so downstream consumers must tolerate
    /// duplicate delivery of an entire unit.
    #[error("ack error: {0}")]
    Ack(String),

    /// Replication stream error
    #[error("replication error: {0}")]
    Replication(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Invalid state transition in the poll loop
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CdcError {
    /// Create a new connect error
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a new schema-not-found error
    pub fn schema_not_found(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self::SchemaNotFound {
            schema: schema.into(),
            table: table.into(),
        }
    }

    /// Create a new decode error
    pub fn decode(msg: impl Into<String>) -> Self {
        Self::Decode(msg.into())
    }

    /// Create a new ack error
    pub fn ack(msg: impl Into<String>) -> Self {
        Self::Ack(msg.into())
    }

    /// Create a new replication error
    pub fn replication(msg: impl Into<String>) -> Self {
        Self::Replication(msg.into())
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new invalid-state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors where retrying the fetch cycle may
    /// succeed. `Ack` is retriable by definition: the unit is simply
    /// redelivered.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Connect(_) | Self::Ack(_) => true,

            Self::Replication(msg) => {
                msg.contains("connection reset")
                    || msg.contains("connection lost")
                    || msg.contains("temporarily")
            }

            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::SchemaNotFound { .. }
            | Self::Decode(_)
            | Self::Config(_)
            | Self::InvalidState(_)
            | Self::Json(_) => false,
        }
    }
}

/// Result type for CDC operations
pub type Result<T> = std::result::Result<T, CdcError>;
