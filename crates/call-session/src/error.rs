use session_description::SdpKind;
use thiserror::Error;

use crate::connection::SenderHandle;
use crate::coordinator::NegotiationState;

/// Failure reported by a [`Connection`](crate::Connection) implementation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    #[error("{operation} failed: {message}")]
    Operation {
        operation: &'static str,
        message: String,
    },
    #[error("invalid session description: {0}")]
    InvalidDescription(String),
    #[error("unknown sender {0}")]
    UnknownSender(SenderHandle),
    #[error("connection closed")]
    Closed,
}

impl ConnectionError {
    pub fn operation(operation: &'static str, err: impl std::fmt::Display) -> Self {
        ConnectionError::Operation {
            operation,
            message: err.to_string(),
        }
    }
}

/// Errors surfaced to the call-service layer.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport rejected the requested operation. Never retried here.
    #[error("transport failure during {operation}: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: ConnectionError,
    },
    /// The transport reported success without a usable result.
    #[error("protocol violation during {operation}: {reason}")]
    ProtocolViolation {
        operation: &'static str,
        reason: String,
    },
    #[error("{operation} expects a {expected} description, got {actual}")]
    UnexpectedDescription {
        operation: &'static str,
        expected: SdpKind,
        actual: SdpKind,
    },
    /// The description was not generated by this session's coordinator,
    /// or a newer one has replaced it.
    #[error("{operation} only accepts the description this session last generated")]
    ForeignDescription { operation: &'static str },
    #[error("{0} is not ready")]
    NotReady(&'static str),
    #[error("{0} already exists")]
    AlreadyExists(&'static str),
    #[error("another negotiation operation is in flight")]
    Busy,
    #[error("cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: NegotiationState,
    },
    #[error("session is closed")]
    Closed,
}

impl SessionError {
    pub(crate) fn transport(operation: &'static str, source: ConnectionError) -> Self {
        SessionError::Transport { operation, source }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionError::Closed)
    }
}

pub type SessionResult<T> = Result<T, SessionError>;
