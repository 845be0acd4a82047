#![forbid(unsafe_code)]

// Domain errors. Not-found results are ordinary values; nothing here is fatal.

use thiserror::Error;

/// Room Store lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomError {
    #[error("room not found: {0}")]
    NotFound(String),
}

/// Reasons an inbound signaling message was dropped without a reply.
#[derive(Debug, Error)]
pub enum SignalError {
    /// Missing or out-of-range field; the message is dropped and logged.
    #[error("malformed {event}: {reason}")]
    Malformed { event: &'static str, reason: String },

    /// Room-scoped message from a connection that has not joined a room.
    #[error("connection {0} is not in a room")]
    NotInRoom(String),

    /// Connection id that the registry no longer knows (already closed).
    #[error("connection {0} is not registered")]
    UnknownConnection(String),
}

impl SignalError {
    pub fn malformed(event: &'static str, reason: impl Into<String>) -> Self {
        Self::Malformed { event, reason: reason.into() }
    }
}
