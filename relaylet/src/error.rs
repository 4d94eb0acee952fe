//! Error and warning types.
//!
//! Parsing and validation errors are returned synchronously to the caller.
//! Everything that happens on the far side of the hub is reported through
//! connection state, hub observers, or [`RelayWarning`]s; nothing propagates
//! across a hop as an error.

use crate::address::{ConnectionId, MalformedIdentifierError};
use crate::bridge::protocol::CorrelationToken;

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Malformed(#[from] MalformedIdentifierError),

    #[error("connection '{0}' is not connected to the hub")]
    NotConnected(String),

    #[error("name '{0}' is already registered in this scope")]
    DuplicateName(String),

    #[error("hub rejected connection name '{0}'")]
    InvalidName(String),

    /// The pending call was discarded before a response arrived.
    #[error("connection closed before a response arrived")]
    Disconnected,

    #[error("failed to open port to hub: {0}")]
    Channel(#[from] std::io::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("background hub is already initialized for this host")]
    AlreadyInitialized,

    #[error("background hub is not running")]
    NotRunning,

    #[error("hub I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Non-fatal relay conditions. Logged by the hub and passed to the warning
/// observer, never returned to a sender.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayWarning {
    #[error("no registered connection matches '{target}' (from {sender})")]
    UnresolvedTarget { sender: ConnectionId, target: String },

    #[error("response {token} from {responder} matches no outstanding request")]
    StaleResponse {
        responder: ConnectionId,
        token: CorrelationToken,
    },

    #[error("malformed target '{target}' from {sender}: {error}")]
    MalformedTarget {
        sender: ConnectionId,
        target: String,
        error: MalformedIdentifierError,
    },

    #[error("request token {token} from {sender} is already outstanding")]
    DuplicateRequestToken {
        sender: ConnectionId,
        token: CorrelationToken,
    },
}
