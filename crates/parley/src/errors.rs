//! Parley error types.
//!
//! Every exposed operation either completes or returns exactly one variant
//! from this taxonomy. Expected caller-side timeouts are *not* errors: the
//! blocking operations return tagged outcomes (`SendOutcome`, `TurnOutcome`)
//! instead, so callers never have to pattern-match an exception taxonomy to
//! tell "no reply yet" apart from a real failure.

use crate::models::ContextKind;
use crate::types::MeetingId;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using [`ParleyError`].
pub type Result<T> = std::result::Result<T, ParleyError>;

/// Parley error taxonomy.
#[derive(Debug, Error)]
pub enum ParleyError {
    /// Agent lookup by external id failed.
    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    /// Organization lookup by external id failed.
    #[error("Organization not found: {0}")]
    OrganizationNotFound(String),

    /// Session lookup failed.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Meeting lookup failed.
    #[error("Meeting not found: {0}")]
    MeetingNotFound(MeetingId),

    /// Agent is not a participant of the meeting.
    #[error("Agent {agent} is not a participant of meeting {meeting_id}")]
    ParticipantNotFound {
        meeting_id: MeetingId,
        agent: String,
    },

    /// Operation is invalid for the current session/meeting/participant state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Caller attempted to speak while another agent holds the turn.
    #[error("Not your turn: current speaker is {current}")]
    NotYourTurn { current: String },

    /// Host-only operation called by a non-host.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Lock could not be acquired within the attempt window.
    ///
    /// Surfaced distinctly (never silently retried) so callers can decide
    /// whether to queue, fail fast, or retry with backoff.
    #[error("Lock unavailable for key {0}")]
    LockUnavailable(i64),

    /// A handler invocation exceeded its own deadline while a response was
    /// structurally required. Distinct from the caller-side wait timing out.
    #[error("Handler timed out after {0:?}")]
    HandlerTimeout(Duration),

    /// A conversation handler was required but none is registered.
    #[error("No {kind} handler registered for agent {agent}")]
    NoHandlerRegistered { agent: String, kind: ContextKind },

    /// A synchronously-awaited handler returned an error or panicked.
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    /// Storage layer failure.
    #[error("Database error: {0}")]
    Database(String),

    /// Payload (de)serialization failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The SDK instance has been shut down.
    #[error("SDK is shut down")]
    Shutdown,
}

impl ParleyError {
    /// Bounded category label for logs and metrics.
    pub fn category(&self) -> &'static str {
        match self {
            ParleyError::AgentNotFound(_)
            | ParleyError::OrganizationNotFound(_)
            | ParleyError::SessionNotFound(_)
            | ParleyError::MeetingNotFound(_)
            | ParleyError::ParticipantNotFound { .. } => "not_found",
            ParleyError::InvalidState(_) | ParleyError::NotYourTurn { .. } => "state",
            ParleyError::PermissionDenied(_) => "permission",
            ParleyError::LockUnavailable(_) => "lock",
            ParleyError::HandlerTimeout(_) => "handler_timeout",
            ParleyError::NoHandlerRegistered { .. } => "no_handler",
            ParleyError::HandlerFailed(_) => "handler_failed",
            ParleyError::Database(_) => "database",
            ParleyError::Serialization(_) => "serialization",
            ParleyError::Shutdown => "shutdown",
        }
    }
}

impl From<sqlx::Error> for ParleyError {
    fn from(err: sqlx::Error) -> Self {
        ParleyError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for ParleyError {
    fn from(err: serde_json::Error) -> Self {
        ParleyError::Serialization(err.to_string())
    }
}
