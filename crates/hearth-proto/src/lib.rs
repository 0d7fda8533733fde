//! Wire protocol for hearth workers.
//!
//! A worker holds one long-lived stream to its supervisor and multiplexes
//! many request sessions over it. This crate provides:
//!
//! - The [`Message`] envelope (session id, type code, payload, headers)
//! - A [`MessageCodec`] for `tokio_util` framed streams
//! - Both wire [`Dialect`]s with constructors for every frame kind
//! - [`ProtocolState`], which classifies inbound frames per connection
//! - Trace-id [`Headers`]
//!
//! # Wire Format
//!
//! Every frame is a single MessagePack array; the encoding is
//! self-delimiting, so there is no separate length prefix:
//!
//! ```text
//! ┌──────────────┬──────────────┬──────────────────┬────────────────────┐
//! │ session: uint│  type: uint  │ payload: array   │ headers: array     │
//! │              │              │                  │ (optional)         │
//! └──────────────┴──────────────┴──────────────────┴────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use hearth_proto::{Dialect, Inbound, ProtocolState};
//!
//! let mut state = ProtocolState::new(Dialect::V1);
//! let invoke = Dialect::V1.invoke(5, "echo");
//! assert_eq!(state.classify(&invoke).unwrap(), Inbound::Invoke("echo".into()));
//! ```

pub mod codec;
pub mod dialect;
mod error;
mod message;
mod protocol;
mod trace;

pub use codec::{MessageCodec, MAX_MESSAGE_SIZE};
pub use dialect::{Dialect, ErrorFrame};
pub use error::{ErrorCode, ProtocolError, Result};
pub use message::{Message, Payload, PayloadBuilder};
pub use protocol::{Inbound, ProtocolState};
pub use trace::{Headers, TraceInfo, PARENT_ID, SPAN_ID, TRACE_ID};

/// Re-exported so callers can build and inspect payload values.
pub use rmpv::Value;
