//! Connection plumbing shared by hearth workers and clients.
//!
//! - **Queue**: the unbounded FIFO every buffer in the stack is built on
//! - **Socket**: framed duplex connection with background read/write pumps
//! - **Sessions**: session id to stream mapping with an id generator
//! - **Transport**: Unix socket and TCP endpoints
//! - **Resolver** and **Service**: calling other services by name

pub mod queue;
pub mod resolver;
pub mod service;
pub mod sessions;
pub mod socket;
pub mod transport;

pub use queue::{QueueControl, QueueError, QueueReceiver, QueueSender};
pub use resolver::{ResolveError, Resolver, StaticResolver};
pub use service::{Channel, Service, ServiceError, ServiceResponse};
pub use sessions::SessionTable;
pub use socket::{AsyncSender, AsyncSocket, MessageSender};
pub use transport::{connect_any, Connection, Endpoint, Listener, TransportError};
