//! Error types for botlink.

use thiserror::Error;

/// Main error type for all botlink operations.
#[derive(Debug, Error)]
pub enum BotlinkError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame could not be decoded (bad direction tag, bad param tag,
    /// negative string length, ...).
    #[error("decode error: {0}")]
    Decode(String),

    /// A decoded packet referenced a command id not present in the registry.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    /// A response arrived for a request id that is missing from the pending
    /// table — it either expired or never existed. Signals protocol desync.
    #[error("response to missing or expired request {request_id}")]
    UnmatchedResponse {
        /// The orphaned request id carried by the response.
        request_id: i32,
    },

    /// `respond_to` was given a response packet; responses cannot be
    /// responded to.
    #[error("cannot respond to a response")]
    RespondToResponse,

    /// A second request or response handler was assigned to a command.
    #[error("command {0:?} already has a handler of that kind")]
    HandlerAlreadyAssigned(String),

    /// A command id did not match the `[A-Z_]{4}` format.
    #[error("command id {0:?} is not four uppercase/underscore characters")]
    InvalidCommandId(String),

    /// A command id was registered twice.
    #[error("command {0:?} is already registered")]
    DuplicateCommand(String),

    /// A typed response conversion found the wrong parameter shape.
    #[error("unexpected response shape: {0}")]
    UnexpectedResponse(String),

    /// A lifecycle call raced the connection's current state, e.g. connect
    /// while a teardown is still in progress.
    #[error("connection state conflict: {0}")]
    StateConflict(String),

    /// An operation that requires an open connection was called while the
    /// connection was not open.
    #[error("not connected, open the connection first")]
    NotConnected,

    /// The connection (or an internal channel backed by it) closed while an
    /// operation was still waiting on it.
    #[error("connection closed")]
    ConnectionClosed,
}

/// Result type alias using BotlinkError.
pub type Result<T> = std::result::Result<T, BotlinkError>;
