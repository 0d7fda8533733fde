//! Worker runtime for hearth.
//!
//! A worker is a long-lived process spawned by a supervisor. It connects
//! back over a socket, announces itself with a handshake and then serves
//! invocations of named events until it is told to stop. Each invocation
//! is a session with a [`Request`] stream in and a [`Response`] stream out.
//!
//! ```text
//! supervisor ──frames──▶ Worker::run ──Request──▶ handler task
//!            ◀─────────── AsyncSocket ◀─Response──┘
//! ```
//!
//! Handlers are registered on an [`EventHandlers`] table. A panicking
//! handler is contained: its session gets an error frame and a choke, and
//! the worker carries on.

pub mod config;
pub mod error;
mod guard;
pub mod handlers;
pub mod request;
pub mod response;
pub mod token;
pub mod worker;

pub use config::{ConfigError, Timeouts, WorkerArgs, WorkerConfig};
pub use error::{RequestError, ResponseError, WorkerError};
pub use handlers::{default_fallback, EventHandlers, FallbackHandler, Handler};
pub use request::Request;
pub use response::Response;
pub use token::{
    NullTokenManager, StaticTokenManager, Token, TokenError, TokenManager, TokenManagerRegistry,
};
pub use worker::{Shutdown, StopHandle, Worker, WorkerSettings};

pub use hearth_proto::{Dialect, Headers, TraceInfo};
pub use tokio_util::sync::CancellationToken;
