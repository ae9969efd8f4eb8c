//! Error types for the OTA client.
//!
//! Network and storage failures inside a download are not errors in this
//! sense: the engine absorbs them into retries, checkpoints and
//! notifications. `OtaError` covers what a host can act on directly, such
//! as a rejected configuration or an unreadable recovery record.

use thiserror::Error;

/// Errors surfaced to the host application.
#[derive(Debug, Error)]
pub enum OtaError {
    /// Invalid configuration provided.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The mesh stack refused to queue a request.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The recovery store could not persist or remove a checkpoint.
    #[error("Recovery store error: {0}")]
    Recovery(String),

    /// A persisted checkpoint exists but cannot be decoded.
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem access failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OtaError {
    /// Create an invalid configuration error.
    #[must_use]
    pub fn invalid_configuration(reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration(reason.into())
    }

    /// Create a recovery store error.
    #[must_use]
    pub fn recovery(reason: impl Into<String>) -> Self {
        Self::Recovery(reason.into())
    }

    /// Create a corrupt checkpoint error.
    #[must_use]
    pub fn corrupt_checkpoint(reason: impl Into<String>) -> Self {
        Self::CorruptCheckpoint(reason.into())
    }

    /// Whether retrying the same operation later could succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Recovery(_) | Self::Io(_))
    }
}

/// Failure reported by the mesh stack when a frame cannot be queued.
///
/// The engine treats a failed send exactly like an unanswered request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    /// No route to the destination is currently known.
    #[error("no route to destination")]
    NoRoute,

    /// The stack's transmit queue is full.
    #[error("transmit queue full")]
    QueueFull,

    /// The node is not joined to a network.
    #[error("node is not joined to a network")]
    NotJoined,
}

/// Result type alias for OTA client operations.
pub type OtaResult<T> = Result<T, OtaError>;
