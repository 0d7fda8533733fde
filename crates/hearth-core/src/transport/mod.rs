//! Byte-stream transports.
//!
//! Workers reach their supervisor over a Unix socket; outbound service
//! calls go over TCP. Both produce a boxed [`Connection`] that the
//! [`AsyncSocket`](crate::AsyncSocket) can wrap.

mod tcp;
mod unix;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

pub use tcp::TcpListener;
pub use unix::UnixListener;

/// Errors that can occur during transport operations.
#[derive(Error, Debug)]
pub enum TransportError {
    /// I/O error from the underlying transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The endpoint string could not be parsed.
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Connection was refused by the remote endpoint.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The socket path does not exist.
    #[error("socket not found: {0}")]
    SocketNotFound(String),

    /// The connection attempt did not finish in time.
    #[error("timed out connecting to {0}")]
    Timeout(String),

    /// Every candidate endpoint failed.
    #[error("no endpoint reachable, last error: {0}")]
    AllEndpointsFailed(Box<TransportError>),

    /// An empty endpoint list was given.
    #[error("no endpoints to connect to")]
    NoEndpoints,
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Address of a peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Endpoint {
    /// Unix domain socket.
    Unix {
        /// Path to the socket file.
        path: PathBuf,
    },
    /// TCP socket.
    Tcp {
        /// Socket address (IP and port).
        addr: SocketAddr,
    },
}

impl Endpoint {
    /// Creates a Unix socket endpoint.
    pub fn unix(path: impl Into<PathBuf>) -> Self {
        Self::Unix { path: path.into() }
    }

    /// Creates a TCP endpoint.
    #[must_use]
    pub const fn tcp(addr: SocketAddr) -> Self {
        Self::Tcp { addr }
    }

    /// Parses `host:port` as TCP, `unix://path` or anything containing a
    /// slash as a Unix socket path.
    pub fn parse(s: &str) -> Result<Self> {
        if let Some(path) = s.strip_prefix("unix://") {
            return Ok(Self::unix(path));
        }
        let s = s.strip_prefix("tcp://").unwrap_or(s);
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Self::tcp(addr));
        }
        if s.contains('/') {
            return Ok(Self::unix(s));
        }
        Err(TransportError::InvalidEndpoint(s.to_owned()))
    }

    /// Binds a listener on this endpoint.
    ///
    /// For Unix sockets, this creates the socket file.
    pub async fn bind(&self) -> Result<Box<dyn Listener>> {
        match self {
            Self::Unix { path } => {
                let listener = UnixListener::bind(path)?;
                Ok(Box::new(listener))
            }
            Self::Tcp { addr } => {
                let listener = TcpListener::bind(*addr).await?;
                Ok(Box::new(listener))
            }
        }
    }

    /// Connects to this endpoint.
    pub async fn connect(&self) -> Result<Box<dyn Connection>> {
        match self {
            Self::Unix { path } => Ok(Box::new(unix::connect(path).await?)),
            Self::Tcp { addr } => Ok(Box::new(tcp::connect(*addr).await?)),
        }
    }

    /// Connects, giving up after `timeout`.
    pub async fn connect_timeout(&self, timeout: Duration) -> Result<Box<dyn Connection>> {
        tokio::time::timeout(timeout, self.connect())
            .await
            .map_err(|_| TransportError::Timeout(self.to_string()))?
    }

    /// Returns a human-readable description of the endpoint.
    #[must_use]
    pub fn display_address(&self) -> String {
        match self {
            Self::Unix { path } => format!("unix://{}", path.display()),
            Self::Tcp { addr } => format!("tcp://{addr}"),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_address())
    }
}

/// Tries each endpoint in order and returns the first connection made.
pub async fn connect_any(
    endpoints: &[Endpoint],
    timeout: Duration,
) -> Result<(Endpoint, Box<dyn Connection>)> {
    let mut last_error = None;
    for endpoint in endpoints {
        match endpoint.connect_timeout(timeout).await {
            Ok(conn) => return Ok((endpoint.clone(), conn)),
            Err(e) => {
                debug!(endpoint = %endpoint, error = %e, "endpoint unreachable");
                last_error = Some(e);
            }
        }
    }
    match last_error {
        Some(e) => Err(TransportError::AllEndpointsFailed(Box::new(e))),
        None => Err(TransportError::NoEndpoints),
    }
}

/// A listener that accepts incoming connections.
#[async_trait]
pub trait Listener: Send + Sync {
    /// Accepts a new incoming connection.
    async fn accept(&self) -> Result<Box<dyn Connection>>;

    /// Returns the endpoint this listener is bound to.
    fn local_endpoint(&self) -> Result<Endpoint>;
}

/// A bidirectional byte stream.
pub trait Connection: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Send + Sync + Unpin {}
