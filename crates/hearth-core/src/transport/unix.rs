//! Unix socket transport.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::net::{UnixListener as TokioUnixListener, UnixStream};
use tracing::debug;

use super::{Connection, Endpoint, Listener, Result, TransportError};

/// Listener on a Unix socket path. The socket file is removed on drop.
#[derive(Debug)]
pub struct UnixListener {
    inner: TokioUnixListener,
    path: PathBuf,
}

impl UnixListener {
    /// Binds to `path`, replacing a stale socket file and creating missing
    /// parent directories.
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let inner = TokioUnixListener::bind(path)?;
        debug!(path = %path.display(), "listening on unix socket");
        Ok(Self {
            inner,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for UnixListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[async_trait]
impl Listener for UnixListener {
    async fn accept(&self) -> Result<Box<dyn Connection>> {
        let (stream, _addr) = self.inner.accept().await?;
        Ok(Box::new(stream))
    }

    fn local_endpoint(&self) -> Result<Endpoint> {
        Ok(Endpoint::unix(&self.path))
    }
}

/// Opens a stream to the socket at `path`.
pub(super) async fn connect(path: &Path) -> Result<UnixStream> {
    if !path.exists() {
        return Err(TransportError::SocketNotFound(path.display().to_string()));
    }
    UnixStream::connect(path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::ConnectionRefused {
            TransportError::ConnectionRefused(path.display().to_string())
        } else {
            TransportError::Io(e)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_round_the_socket() {
        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::unix(dir.path().join("nested/worker.sock"));

        let listener = endpoint.bind().await.unwrap();
        assert_eq!(listener.local_endpoint().unwrap(), endpoint);

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut client = endpoint.connect().await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.await.unwrap();
    }

    #[tokio::test]
    async fn socket_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleanup.sock");

        {
            let _listener = UnixListener::bind(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_socket_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = connect(&dir.path().join("absent.sock")).await.unwrap_err();
        assert!(matches!(err, TransportError::SocketNotFound(_)));
    }
}
