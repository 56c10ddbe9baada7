//! Error types for the Matrixon room server
//!
//! Every failure that can end an event admission is expressed here. Errors fall
//! into four groups which callers treat differently:
//!
//! * transient infrastructure failures (`Database`, `Federation`, `Timeout`,
//!   `Cancelled`) which may be retried by re-submitting the whole admission,
//! * protocol rejections (`Rejected`), which are final for the event,
//! * missing dependencies (`AuthChainUnavailable`, `MissingPrevEvents`),
//! * data integrity failures from a peer (`MissingAuthEvent`, `Signature`,
//!   `BadServerResponse`).

use std::io;

use ruma::{OwnedEventId, OwnedServerName};
use thiserror::Error;

/// Why an event was refused admission into the room graph.
///
/// A rejected event is still persisted so that descendants can use it as an
/// auth dependency, but it never reaches the room's current state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RejectionReason {
    /// The authorization oracle refused the event against its own auth events
    #[error("not allowed by auth events: {0}")]
    NotAllowed(String),

    /// The event is valid per its auth chain but not against current room state
    #[error("soft-failed against the current room state")]
    SoftFailed,

    /// Backfilling the missing prev events failed
    #[error("failed to fetch missing prev events: {0}")]
    MissingState(String),

    /// Prev events are unknown and no peer could be asked for them
    #[error("missing prev events and no servers available")]
    NoServersAvailable,
}

/// Matrixon room server error types
#[derive(Debug, Error)]
pub enum MatrixonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Event store failure
    #[error("Database error: {0}")]
    Database(String),

    /// Federation request failure
    #[error("Federation error: {0}")]
    Federation(String),

    /// The event was persisted but refused admission
    #[error("Event {event_id} rejected: {reason}")]
    Rejected {
        event_id: OwnedEventId,
        reason: RejectionReason,
    },

    /// Signature verification of an event failed
    #[error("Signature verification failed for {event_id}: {reason}")]
    Signature {
        event_id: OwnedEventId,
        reason: String,
    },

    /// An auth event could not be resolved to a known event
    #[error("Missing auth event {missing} for {event_id}")]
    MissingAuthEvent {
        event_id: OwnedEventId,
        missing: OwnedEventId,
    },

    /// No candidate server returned the auth chain of an event
    #[error("No servers provided event auth for event ID {event_id}, tried servers {tried:?}")]
    AuthChainUnavailable {
        event_id: OwnedEventId,
        tried: Vec<OwnedServerName>,
    },

    /// The causal history of an event could not be reconstructed
    #[error("Missing prev events for {event_id}: {reason}")]
    MissingPrevEvents {
        event_id: OwnedEventId,
        reason: String,
    },

    /// A remote server answered with malformed data
    #[error("Bad server response: {0}")]
    BadServerResponse(String),

    /// Invalid state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The caller abandoned the operation
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Result type for Matrixon operations
pub type Result<T> = std::result::Result<T, MatrixonError>;

impl MatrixonError {
    /// Builds a rejection error for `event_id`.
    pub fn rejected(event_id: OwnedEventId, reason: RejectionReason) -> Self {
        MatrixonError::Rejected { event_id, reason }
    }

    /// True for protocol-level rejections, which are never retried.
    pub fn is_rejection(&self) -> bool {
        matches!(self, MatrixonError::Rejected { .. })
    }

    /// The rejection reason, if this is a rejection.
    pub fn rejection_reason(&self) -> Option<&RejectionReason> {
        match self {
            MatrixonError::Rejected { reason, .. } => Some(reason),
            _ => None,
        }
    }

    /// True for transient infrastructure failures.
    ///
    /// Re-submitting the same admission after one of these re-derives the same
    /// decisions from the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MatrixonError::Database(_)
                | MatrixonError::Federation(_)
                | MatrixonError::Timeout(_)
                | MatrixonError::Cancelled(_)
                | MatrixonError::Io(_)
        )
    }
}

impl From<serde_json::Error> for MatrixonError {
    fn from(err: serde_json::Error) -> Self {
        MatrixonError::Serialization(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for MatrixonError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        MatrixonError::Timeout(err.to_string())
    }
}
