//! Error types for the protocol.

use thiserror::Error;

/// Protocol errors.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Unsupported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(u64),

    /// Frame exceeded the size limit.
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// The outer `[session, type, payload, headers?]` array is malformed.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Payload does not have the shape its message type requires.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Invoke payload carried no usable event name.
    #[error("invoke payload has no event name")]
    MissingEventName,

    /// Message type is not defined for the dialect.
    #[error("unknown message type {ty} on session {session}")]
    UnknownMessageType { session: u64, ty: u64 },

    /// A new session opened with something other than an invoke.
    #[error("session {session} must start with an invoke, got type {ty}")]
    OutOfSequence { session: u64, ty: u64 },

    /// Serialisation error.
    #[error("serialisation error: {0}")]
    Serialisation(String),

    /// Deserialisation error.
    #[error("deserialisation error: {0}")]
    Deserialisation(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Error codes the framework itself puts into error frames.
///
/// Application handlers choose their own codes; these are reserved for
/// conditions detected by the worker runtime or the outbound client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A handler panicked before closing its response.
    PanicInHandler,
    /// No handler and no custom fallback matched the event.
    NoEventHandler,
    /// The connection carrying an outbound call went away.
    Disconnected,
}

impl ErrorCode {
    /// Category for framework-generated errors.
    pub const FRAMEWORK_CATEGORY: i64 = 1;

    /// Category for errors raised by application handlers.
    pub const APPLICATION_CATEGORY: i64 = 0;

    /// Returns the numeric value written on the wire.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::PanicInHandler => 100,
            Self::NoEventHandler => 200,
            Self::Disconnected => -100,
        }
    }

    /// Creates an error code from its wire value.
    #[must_use]
    pub const fn from_code(value: i64) -> Option<Self> {
        match value {
            100 => Some(Self::PanicInHandler),
            200 => Some(Self::NoEventHandler),
            -100 => Some(Self::Disconnected),
            _ => None,
        }
    }

    /// Category paired with this code in V1 error frames.
    #[must_use]
    pub const fn category(self) -> i64 {
        Self::FRAMEWORK_CATEGORY
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PanicInHandler => "panic_in_handler",
            Self::NoEventHandler => "no_event_handler",
            Self::Disconnected => "disconnected",
        };
        write!(f, "{s}")
    }
}
