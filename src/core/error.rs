//! Recorder error taxonomy.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by recorder components.
///
/// Configuration absence is never an error: disabled features are inert.
#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("Session for call {call_id} no longer accepts events")]
    SessionClosed { call_id: String },

    #[error("Relational store error: {0}")]
    Store(String),

    #[error("Object storage error: {0}")]
    Storage(String),

    #[error("Egress platform error: {0}")]
    Egress(String),

    #[error("{operation} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl RecorderError {
    /// Transient failures are worth another attempt
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Store(_) | Self::Storage(_) | Self::Egress(_) | Self::Timeout { .. }
        )
    }
}

pub type Result<T, E = RecorderError> = std::result::Result<T, E>;
