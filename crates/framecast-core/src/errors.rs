use crate::ids::{ConnectionId, SessionId};
use crate::session::SessionState;

/// Error taxonomy for relay operations.
/// Classifies errors as recoverable (reported, nothing else changes) or
/// terminal for the affected session/link.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
pub enum RelayError {
    // Recoverable — reported to the caller, state untouched
    #[error("cannot {command} a session that is {state}")]
    InvalidState {
        command: &'static str,
        state: SessionState,
    },
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),
    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
    #[error("capacity exceeded: at most {limit} {resource}")]
    CapacityExceeded { resource: &'static str, limit: usize },
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Terminal for the session
    #[error("frame source failed: {0}")]
    SourceFailed(String),

    // Terminal for the link
    #[error("transport failure: {0}")]
    Transport(String),
}

impl RelayError {
    pub fn invalid_state(command: &'static str, state: SessionState) -> Self {
        Self::InvalidState { command, state }
    }

    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::SourceFailed(_) | Self::Transport(_))
    }

    /// Short classification string, used as the wire error code.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidState { .. } => "invalid_state",
            Self::UnknownSession(_) => "unknown_session",
            Self::UnknownConnection(_) => "unknown_connection",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::SourceFailed(_) => "source_failed",
            Self::Transport(_) => "transport_failure",
        }
    }
}
