//! Message-level duplex socket over any async byte stream.
//!
//! Two background pumps move frames between the stream and a pair of
//! [`queue`](crate::queue) instances. Either pump hitting an I/O error, a
//! decode error or end of stream closes the whole connection; reconnecting
//! is left to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hearth_proto::{Message, MessageCodec};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, trace, warn};

use crate::queue::{self, QueueControl, QueueReceiver, QueueSender};

/// Anything that can put a message on the wire without blocking.
///
/// Handlers write through this so they never touch the socket itself.
pub trait AsyncSender: Send + Sync {
    /// Queues a message. Returns `false` if it was dropped because the
    /// connection is closed.
    fn send(&self, message: Message) -> bool;
}

/// Idempotent connection teardown shared by the pumps and the owner.
#[derive(Debug, Clone)]
struct Closer {
    token: CancellationToken,
    announced: Arc<AtomicBool>,
    inbound: QueueControl,
    outbound: QueueControl,
}

impl Closer {
    /// Broadcasts closure and discards outbound frames not yet written.
    fn close(&self, reason: &str) {
        if self.announced.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(reason, "connection closed");
        self.token.cancel();
        let _ = self.outbound.stop();
    }

    /// Closes and also discards inbound frames not yet read.
    fn close_now(&self, reason: &str) {
        self.close(reason);
        let _ = self.inbound.stop();
    }
}

/// Cloneable handle for writing to a socket.
///
/// Writes after the connection closed are dropped silently rather than
/// blocking the caller.
#[derive(Debug, Clone)]
pub struct MessageSender {
    queue: QueueSender<Message>,
    closed: CancellationToken,
}

impl MessageSender {
    /// Queues a message for the write pump.
    pub fn send(&self, message: Message) -> bool {
        if self.closed.is_cancelled() {
            trace!(session = message.session(), "dropping message for closed connection");
            return false;
        }
        self.queue.push(message).is_ok()
    }

    /// Checks whether the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

impl AsyncSender for MessageSender {
    fn send(&self, message: Message) -> bool {
        Self::send(self, message)
    }
}

/// A framed connection with background read and write pumps.
#[derive(Debug)]
pub struct AsyncSocket {
    sender: MessageSender,
    inbound: QueueReceiver<Message>,
    closer: Closer,
}

impl AsyncSocket {
    /// Wraps a stream, spawning its pumps on the current runtime.
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        Self::with_codec(stream, MessageCodec::new())
    }

    /// Wraps a stream using a specific codec configuration.
    pub fn with_codec<S>(stream: S, codec: MessageCodec) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        let (inbound_tx, inbound_rx, inbound_control) = queue::unbounded();
        let (outbound_tx, outbound_rx, outbound_control) = queue::unbounded();

        let closer = Closer {
            token: CancellationToken::new(),
            announced: Arc::new(AtomicBool::new(false)),
            inbound: inbound_control,
            outbound: outbound_control,
        };

        tokio::spawn(read_pump(
            FramedRead::new(reader, codec.clone()),
            inbound_tx,
            closer.clone(),
        ));
        tokio::spawn(write_pump(
            FramedWrite::new(writer, codec),
            outbound_rx,
            closer.clone(),
        ));

        Self {
            sender: MessageSender {
                queue: outbound_tx,
                closed: closer.token.clone(),
            },
            inbound: inbound_rx,
            closer,
        }
    }

    /// Returns a handle for writing from other tasks.
    #[must_use]
    pub fn sender(&self) -> MessageSender {
        self.sender.clone()
    }

    /// Queues a message for writing.
    pub fn send(&self, message: Message) -> bool {
        self.sender.send(message)
    }

    /// Waits for the next inbound message.
    ///
    /// Frames decoded before the peer went away are still delivered; `None`
    /// follows once they are consumed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbound.recv().await
    }

    /// Checks whether the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closer.token.is_cancelled()
    }

    /// Resolves once the connection has closed, however that happened.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closer.token.cancelled()
    }

    /// Token that is cancelled when the connection closes.
    #[must_use]
    pub fn closed_token(&self) -> CancellationToken {
        self.closer.token.clone()
    }

    /// Closes the connection and discards anything still queued.
    pub fn close(&self) {
        self.closer.close_now("closed locally");
    }

    /// Stops accepting writes, waits up to `timeout` for queued frames to
    /// reach the stream, then closes.
    pub async fn close_gracefully(&self, timeout: Duration) {
        if self.closer.outbound.drain(timeout).is_ok() {
            let _ = tokio::time::timeout(timeout, self.closer.token.cancelled()).await;
        }
        self.close();
    }
}

impl Drop for AsyncSocket {
    fn drop(&mut self) {
        self.closer.close_now("socket dropped");
    }
}

async fn read_pump<R>(
    mut frames: FramedRead<R, MessageCodec>,
    inbound: QueueSender<Message>,
    closer: Closer,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        let frame = tokio::select! {
            () = closer.token.cancelled() => break "closed locally",
            frame = frames.next() => frame,
        };

        match frame {
            Some(Ok(message)) => {
                trace!(session = message.session(), ty = message.ty(), "received message");
                if inbound.push(message).is_err() {
                    break "inbound queue stopped";
                }
            }
            Some(Err(e)) => {
                warn!(error = %e, "failed to decode frame");
                break "decode error";
            }
            None => break "end of stream",
        }
    };

    closer.close(reason);
    // Dropping the producer lets the consumer read what was already queued
    // before it sees end of stream.
    drop(inbound);
}

async fn write_pump<W>(
    mut frames: FramedWrite<W, MessageCodec>,
    mut outbound: QueueReceiver<Message>,
    closer: Closer,
) where
    W: AsyncWrite + Unpin,
{
    let reason = loop {
        let message = tokio::select! {
            () = closer.token.cancelled() => break "closed locally",
            message = outbound.recv() => message,
        };
        let Some(message) = message else {
            break "outbound queue stopped";
        };

        let session = message.session();
        let result = tokio::select! {
            () = closer.token.cancelled() => break "closed locally",
            result = frames.send(message) => result,
        };
        if let Err(e) = result {
            warn!(session, error = %e, "failed to write frame");
            break "write error";
        }
    };

    closer.close(reason);
    let _ = frames.get_mut().shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use hearth_proto::Dialect;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn messages_cross_in_both_directions() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = AsyncSocket::new(a);
        let mut right = AsyncSocket::new(b);

        left.send(Dialect::V1.heartbeat());
        right.send(Dialect::V1.invoke(2, "ping"));

        assert_eq!(right.recv().await, Some(Dialect::V1.heartbeat()));
        assert_eq!(left.recv().await, Some(Dialect::V1.invoke(2, "ping")));
    }

    #[tokio::test]
    async fn concurrent_senders_are_all_delivered() {
        let (a, b) = tokio::io::duplex(256);
        let left = AsyncSocket::new(a);
        let mut right = AsyncSocket::new(b);

        let mut tasks = Vec::new();
        for session in 2..12u64 {
            let sender = left.sender();
            tasks.push(tokio::spawn(async move {
                for i in 0..20u8 {
                    assert!(sender.send(Dialect::V1.chunk(session, &[i])));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let mut per_session = std::collections::HashMap::<u64, Vec<u8>>::new();
        for _ in 0..200 {
            let message = right.recv().await.unwrap();
            let data = message.payload().first_bytes().unwrap();
            per_session.entry(message.session()).or_default().push(data[0]);
        }
        for data in per_session.values() {
            assert_eq!(data, &(0..20).collect::<Vec<u8>>());
        }
    }

    #[tokio::test]
    async fn peer_eof_closes_and_flushes_inbound() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut socket = AsyncSocket::new(a);

        let bytes = MessageCodec::encode_to_vec(&Dialect::V1.heartbeat()).unwrap();
        tokio::io::AsyncWriteExt::write_all(&mut b, &bytes).await.unwrap();
        drop(b);

        assert_eq!(socket.recv().await, Some(Dialect::V1.heartbeat()));
        assert_eq!(socket.recv().await, None);
        socket.closed().await;
        assert!(socket.is_closed());
    }

    #[tokio::test]
    async fn decode_error_closes_connection() {
        let (a, mut b) = tokio::io::duplex(1024);
        let mut socket = AsyncSocket::new(a);

        tokio::io::AsyncWriteExt::write_all(&mut b, &[0xc1]).await.unwrap();

        assert_eq!(socket.recv().await, None);
        assert!(socket.is_closed());
    }

    #[tokio::test]
    async fn send_after_close_is_dropped() {
        let (a, mut b) = tokio::io::duplex(1024);
        let socket = AsyncSocket::new(a);
        let sender = socket.sender();

        socket.close();
        socket.closed().await;
        assert!(!sender.send(Dialect::V1.heartbeat()));

        // The peer sees the stream end without any frame.
        let mut buf = Vec::new();
        b.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn graceful_close_flushes_queued_frames() {
        let (a, b) = tokio::io::duplex(64);
        let socket = AsyncSocket::new(a);
        let mut peer = AsyncSocket::new(b);

        for session in 2..10 {
            socket.send(Dialect::V1.choke(session));
        }
        socket.close_gracefully(Duration::from_secs(5)).await;
        assert!(!socket.send(Dialect::V1.heartbeat()));

        for session in 2..10 {
            assert_eq!(peer.recv().await, Some(Dialect::V1.choke(session)));
        }
        assert_eq!(peer.recv().await, None);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (a, _b) = tokio::io::duplex(1024);
        let socket = AsyncSocket::new(a);
        socket.close();
        socket.close();
        assert!(socket.is_closed());
    }
}
