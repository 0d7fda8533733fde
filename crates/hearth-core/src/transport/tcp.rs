//! TCP transport.

use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::net::{TcpListener as TokioTcpListener, TcpStream};

use super::{Connection, Endpoint, Listener, Result, TransportError};

/// TCP listener that accepts incoming connections.
#[derive(Debug)]
pub struct TcpListener {
    inner: TokioTcpListener,
}

impl TcpListener {
    /// Binds to the given address. Port 0 picks a free port.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let inner = TokioTcpListener::bind(addr).await?;
        Ok(Self { inner })
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (stream, _addr) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn local_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::tcp(self.inner.local_addr()?))
    }
}

/// Opens a stream to `addr` with Nagle's algorithm disabled.
pub(super) async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let stream = TcpStream::connect(addr).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::ConnectionRefused {
            TransportError::ConnectionRefused(addr.to_string())
        } else {
            TransportError::Io(e)
        }
    })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}
