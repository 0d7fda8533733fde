//! Error types for the worker runtime.

use hearth_core::TransportError;
use hearth_proto::ProtocolError;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors returned when reading a [`Request`](crate::Request).
#[derive(Error, Debug)]
pub enum RequestError {
    /// The caller sent an error frame on this session.
    #[error("remote error [{category}, {code}]: {message}")]
    Remote {
        /// Error category.
        category: i64,
        /// Error code.
        code: i64,
        /// Description sent by the caller.
        message: String,
    },

    /// The read was cancelled. The request is left as it was.
    #[error("read cancelled")]
    Cancelled,

    /// No data arrived within the read timeout. The request is left as it was.
    #[error("read timed out")]
    Timeout,

    /// A frame on this session could not be decoded.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Errors returned when writing a [`Response`](crate::Response).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResponseError {
    /// The response was already closed by `close` or `error_msg`.
    #[error("response stream is closed")]
    Closed,

    /// The connection to the supervisor is gone; the frame was dropped.
    #[error("connection is closed")]
    Disconnected,

    /// Data could not be serialised. Carries the encoder's message.
    #[error("failed to serialise response data: {0}")]
    Serialisation(String),
}

/// Fatal outcomes of [`Worker::run`](crate::Worker::run) and worker setup.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// No heartbeat reply arrived in time.
    #[error("disowned by the supervisor")]
    Disowned,

    /// The supervisor connection closed while the worker was running.
    #[error("the connection to the supervisor has been lost")]
    ConnectionLost,

    /// The supervisor could not be reached.
    #[error("unable to connect to the supervisor: {0}")]
    Connect(#[from] TransportError),

    /// Protocol setup failed, such as an unsupported version.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Configuration was invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The token manager could not be created.
    #[error(transparent)]
    Token(#[from] crate::token::TokenError),
}
