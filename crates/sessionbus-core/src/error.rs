//! Error taxonomy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::message::{HandleState, LockToken, SessionId};

/// Result alias used across the workspace.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Identifies the message a settlement targeted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "by", content = "value", rename_all = "snake_case")]
pub enum MessageRef {
    LockToken(LockToken),
    SequenceNumber(i64),
}

impl fmt::Display for MessageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LockToken(token) => write!(f, "lock token {token}"),
            Self::SequenceNumber(seq) => write!(f, "sequence number {seq}"),
        }
    }
}

/// Session client error.
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("Timeout: {0}")]
    Timeout(String),
    #[error("Communication error: {0}")]
    Communication(String),
    #[error("Session lock lost: {session_id}")]
    SessionLockLost { session_id: SessionId },
    #[error("Message lock lost or already settled in session {session_id}: {target}")]
    MessageLockLost {
        session_id: SessionId,
        target: MessageRef,
    },
    #[error("Session cannot be locked, it is held by another receiver: {session_id}")]
    SessionCannotBeLocked { session_id: SessionId },
    #[error("Message not found in session {session_id}: sequence number {sequence_number}")]
    MessageNotFound {
        session_id: SessionId,
        sequence_number: i64,
    },
    #[error("Entity not found: {0}")]
    EntityNotFound(String),
    #[error("Session state of {size} bytes exceeds the {max} byte limit: {session_id}")]
    StateTooLarge {
        session_id: SessionId,
        size: usize,
        max: usize,
    },
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Session {session_id} is {state}")]
    IllegalState {
        session_id: SessionId,
        state: HandleState,
    },
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl Error {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Communication(_))
    }

    /// Whether the error means the session lock is gone for good.
    #[must_use]
    pub const fn is_session_lock_lost(&self) -> bool {
        matches!(
            self,
            Self::SessionLockLost { .. }
                | Self::IllegalState {
                    state: HandleState::Expired,
                    ..
                }
        )
    }

    /// Whether the error is a timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
