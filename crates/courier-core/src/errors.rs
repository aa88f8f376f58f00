//! Error taxonomy.
//!
//! Two families with different propagation rules:
//!
//! - [`ManagerError`]: structural / programmer errors. Returned synchronously
//!   to the immediate caller so misuse is caught early.
//! - [`DeliveryError`]: per-connection transport outcomes. Never raised to the
//!   caller of a send; recorded in reports and counters instead.
//!
//! [`TransportError`] is what a transport implementation reports; the
//! dispatcher folds it into a [`DeliveryError`].

use thiserror::Error;

use crate::ids::{ConnectionId, UserId};

/// Structural errors surfaced to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ManagerError {
    /// The facade factory was called without a user context.
    #[error("missing user context: a manager cannot be created without a user")]
    MissingUserContext,

    /// A synthetic (test/diagnostic) facade reached a production code path.
    #[error("synthetic user context refused on a production path")]
    SyntheticContext,

    /// A connection record is missing required identity fields.
    #[error("invalid connection: {0}")]
    InvalidConnection(String),

    /// The connection ID is already owned by a different user.
    #[error("connection id {connection_id} is already owned by user {owner}")]
    ConnectionIdConflict {
        /// Colliding connection ID.
        connection_id: ConnectionId,
        /// User currently owning it.
        owner: UserId,
    },

    /// An isolation token was already issued for this connection.
    #[error("isolation token already issued for connection {0}")]
    DuplicateConnection(ConnectionId),

    /// Send target user ID was empty.
    #[error("invalid user id: must not be empty")]
    InvalidUserId,
}

impl ManagerError {
    /// Stable machine-readable code for logs and HTTP bodies.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingUserContext => "MISSING_USER_CONTEXT",
            Self::SyntheticContext => "SYNTHETIC_CONTEXT",
            Self::InvalidConnection(_) => "INVALID_CONNECTION",
            Self::ConnectionIdConflict { .. } => "CONNECTION_ID_CONFLICT",
            Self::DuplicateConnection(_) => "DUPLICATE_CONNECTION",
            Self::InvalidUserId => "INVALID_USER_ID",
        }
    }
}

/// Result alias for structural operations.
pub type Result<T> = std::result::Result<T, ManagerError>;

/// Failure reported by a transport send.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The peer or the socket is gone.
    #[error("transport closed")]
    Closed,
    /// Unrecoverable I/O failure.
    #[error("transport i/o error: {0}")]
    Io(String),
    /// Temporarily unable to accept a frame.
    #[error("transport busy")]
    Busy,
}

/// Outcome class of a failed per-connection delivery.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// Connection removed or closed before the frame went out.
    #[error("connection closed")]
    Closed,
    /// Hard transport failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// Transport send exceeded the configured timeout.
    #[error("send timed out")]
    Timeout,
    /// Outbound queue stayed full for the whole send timeout.
    #[error("outbound queue full")]
    Backpressure,
    /// The frame was not prepared for this connection's owner; never sent.
    #[error("isolation violation: {0}")]
    IsolationViolation(String),
}

impl DeliveryError {
    /// Transient failures get a higher pruning threshold than hard ones.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Timeout | Self::Backpressure)
    }

    /// Short label used for metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Transport(_) => "transport",
            Self::Timeout => "timeout",
            Self::Backpressure => "backpressure",
            Self::IsolationViolation(_) => "isolation",
        }
    }
}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Closed => Self::Closed,
            TransportError::Io(msg) => Self::Transport(msg),
            TransportError::Busy => Self::Backpressure,
        }
    }
}
