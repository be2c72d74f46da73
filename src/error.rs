//! Fault taxonomy for the endpoint.
//!
//! Every local fault funnels through [`Fault`] and tears the endpoint
//! down: malformed input, protocol violations, peer disconnect, handler
//! failures, and transport I/O errors are all handled identically — the
//! fault is reported once through the `on_error` hook and the connection
//! is released. A peer-delivered `error` envelope is not a fault; it is
//! ordinary business-level failure information routed to the error
//! callback of the pending outbound command.

use thiserror::Error;

use crate::transport::TransportError;

/// Error type applications return from handlers and reply callbacks.
///
/// An error escaping a handler becomes a [`Fault::Handler`] and closes
/// the endpoint.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// A line that could not be decoded into a message envelope.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message is not a JSON object")]
    NotAnObject,

    #[error("\"{key}\" name is not a string")]
    NameNotString { key: &'static str },

    #[error("message has none of the command/notification/return/error keys")]
    UnrecognizedShape,
}

/// A peer message that violates the protocol's ordering or dispatch rules.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("unexpected \"command\" message: a command is already pending inbound")]
    CommandAlreadyPending,

    #[error("no handler for command {0}")]
    UnknownCommand(String),

    #[error("no handler for notification {0}")]
    UnknownNotification(String),

    #[error("unexpected \"return\" message: no command pending outbound")]
    UnmatchedReturn,

    #[error("unexpected \"error\" message: no command pending outbound")]
    UnmatchedError,

    #[error("no return callback specified for command {0}")]
    MissingReturnCallback(String),

    #[error("no error callback specified for command {0}")]
    MissingErrorCallback(String),
}

/// A local fault. Any of these closes the endpoint unconditionally.
#[derive(Debug, Error)]
pub enum Fault {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    #[error("peer closed the stream")]
    PeerClosed,

    #[error("handler fault: {0}")]
    Handler(#[source] HandlerError),

    #[error("transport fault: {0}")]
    Transport(#[from] TransportError),
}

/// Errors returned to callers of the send operations.
///
/// These are surfaced to the caller rather than raised as faults; a
/// handler that cannot make progress on one propagates it, at which
/// point it becomes a [`Fault::Handler`].
#[derive(Debug, Error)]
pub enum SendError {
    #[error("endpoint is not active")]
    NotActive,

    #[error("a command is already in flight")]
    CommandInFlight,

    #[error("payload serialization failed: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport write failed: {0}")]
    Transport(#[from] TransportError),
}
