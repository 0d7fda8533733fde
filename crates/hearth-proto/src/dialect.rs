//! The two wire dialects and their frame constructors.
//!
//! V0 gives every frame its own type code. V1 reuses a handful of codes
//! and relies on session bookkeeping to tell an invoke from a chunk; see
//! [`crate::ProtocolState`].

use rmpv::Value;

use crate::error::{ProtocolError, Result};
use crate::message::{Message, Payload};

/// Type codes of the V0 dialect.
pub mod v0 {
    /// Reserved session for connection-level frames.
    pub const UTILITY_SESSION: u64 = 0;

    pub const HANDSHAKE: u64 = 0;
    pub const HEARTBEAT: u64 = 1;
    pub const TERMINATE: u64 = 2;
    pub const INVOKE: u64 = 3;
    pub const CHUNK: u64 = 4;
    pub const ERROR: u64 = 5;
    pub const CHOKE: u64 = 6;
}

/// Type codes of the V1 dialect.
pub mod v1 {
    /// Reserved session for connection-level frames.
    pub const UTILITY_SESSION: u64 = 1;

    // Utility session.
    pub const HANDSHAKE: u64 = 0;
    pub const HEARTBEAT: u64 = 0;
    pub const TERMINATE: u64 = 1;

    // Request sessions.
    pub const INVOKE: u64 = 0;
    pub const WRITE: u64 = 0;
    pub const ERROR: u64 = 1;
    pub const CLOSE: u64 = 2;
}

/// Wire dialect spoken on a connection.
///
/// Chosen once when the worker is built and fixed for the connection's
/// lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Dialect {
    /// Legacy dialect with one type code per frame kind.
    V0,
    /// Compact dialect with implicit invokes.
    #[default]
    V1,
}

impl Dialect {
    /// Resolves a protocol version number.
    pub fn from_version(version: u64) -> Result<Self> {
        match version {
            0 => Ok(Self::V0),
            1 => Ok(Self::V1),
            other => Err(ProtocolError::UnsupportedVersion(other)),
        }
    }

    /// Protocol version number of this dialect.
    #[must_use]
    pub const fn version(self) -> u64 {
        match self {
            Self::V0 => 0,
            Self::V1 => 1,
        }
    }

    /// Session id reserved for handshake, heartbeat and terminate.
    #[must_use]
    pub const fn utility_session(self) -> u64 {
        match self {
            Self::V0 => v0::UTILITY_SESSION,
            Self::V1 => v1::UTILITY_SESSION,
        }
    }

    /// First frame a worker sends, identifying itself by `uuid`.
    #[must_use]
    pub fn handshake(self, uuid: &str) -> Message {
        let ty = match self {
            Self::V0 => v0::HANDSHAKE,
            Self::V1 => v1::HANDSHAKE,
        };
        Message::new(self.utility_session(), ty, Payload::builder().str(uuid).build())
    }

    /// Liveness ping, echoed by the supervisor.
    #[must_use]
    pub fn heartbeat(self) -> Message {
        let ty = match self {
            Self::V0 => v0::HEARTBEAT,
            Self::V1 => v1::HEARTBEAT,
        };
        Message::new(self.utility_session(), ty, Payload::empty())
    }

    /// Termination notice carrying a reason.
    #[must_use]
    pub fn terminate(self, code: i64, reason: &str) -> Message {
        match self {
            Self::V0 => Message::new(
                v0::UTILITY_SESSION,
                v0::TERMINATE,
                Payload::builder().int(code).str(reason).build(),
            ),
            Self::V1 => Message::new(
                v1::UTILITY_SESSION,
                v1::TERMINATE,
                Payload::builder().pair(0, code).str(reason).build(),
            ),
        }
    }

    /// Opens a session for `event`.
    #[must_use]
    pub fn invoke(self, session: u64, event: &str) -> Message {
        let ty = match self {
            Self::V0 => v0::INVOKE,
            Self::V1 => v1::INVOKE,
        };
        Message::new(session, ty, Payload::builder().str(event).build())
    }

    /// One unit of stream data.
    ///
    /// V0 writes the body as `bin`, V1 as `str` with the raw bytes.
    #[must_use]
    pub fn chunk(self, session: u64, data: &[u8]) -> Message {
        match self {
            Self::V0 => Message::new(session, v0::CHUNK, Payload::builder().bin(data).build()),
            Self::V1 => Message::new(session, v1::WRITE, Payload::builder().str_bytes(data).build()),
        }
    }

    /// Error frame. V0 has no notion of category and drops it.
    #[must_use]
    pub fn error(self, session: u64, category: i64, code: i64, message: &str) -> Message {
        match self {
            Self::V0 => Message::new(
                session,
                v0::ERROR,
                Payload::builder().int(code).str(message).build(),
            ),
            Self::V1 => Message::new(
                session,
                v1::ERROR,
                Payload::builder().pair(category, code).str(message).build(),
            ),
        }
    }

    /// End-of-stream frame.
    #[must_use]
    pub fn choke(self, session: u64) -> Message {
        let ty = match self {
            Self::V0 => v0::CHOKE,
            Self::V1 => v1::CLOSE,
        };
        Message::new(session, ty, Payload::empty())
    }

    /// Parses the payload of an error frame.
    pub fn parse_error(self, payload: &Payload) -> Result<ErrorFrame> {
        let values = payload.values()?;
        let (category, code, message) = match (self, values.as_slice()) {
            (Self::V0, [code, message]) => (0, as_i64(code)?, message),
            (Self::V1, [Value::Array(pair), message]) => match pair.as_slice() {
                [category, code] => (as_i64(category)?, as_i64(code)?, message),
                _ => return Err(invalid_error_payload()),
            },
            // Some peers send a bare code in V1 too.
            (Self::V1, [code, message]) => (0, as_i64(code)?, message),
            _ => return Err(invalid_error_payload()),
        };

        let message = match message {
            Value::String(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
            Value::Binary(b) => String::from_utf8_lossy(b).into_owned(),
            Value::Nil => String::new(),
            other => other.to_string(),
        };
        Ok(ErrorFrame {
            category,
            code,
            message,
        })
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "v{}", self.version())
    }
}

fn as_i64(value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| ProtocolError::InvalidPayload(format!("expected integer, got {value}")))
}

fn invalid_error_payload() -> ProtocolError {
    ProtocolError::InvalidPayload("error frame must be [[category, code], message]".into())
}

/// Decoded body of an error frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorFrame {
    /// Error category, zero in V0.
    pub category: i64,
    /// Error code.
    pub code: i64,
    /// Human-readable description.
    pub message: String,
}
