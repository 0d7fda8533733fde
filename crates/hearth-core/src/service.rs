//! Client for calling other services over the same wire model.
//!
//! A [`Service`] owns one connection. Every [`call`](Service::call) opens a
//! session with a fresh id and returns a [`Channel`] whose replies are
//! buffered in a [`queue`](crate::queue) until read. When the connection
//! drops, each live channel gets one [`ServiceError::Disconnected`] and is
//! detached.

use std::sync::Arc;
use std::time::Duration;

use hearth_proto::{ErrorCode, Headers, Message, Payload};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::queue::{self, QueueReceiver, QueueSender};
use crate::resolver::{ResolveError, Resolver};
use crate::sessions::SessionTable;
use crate::socket::{AsyncSocket, MessageSender};
use crate::transport::{self, Endpoint, TransportError};

/// Errors surfaced by the service client.
#[derive(Error, Debug)]
pub enum ServiceError {
    /// The service name could not be resolved.
    #[error(transparent)]
    Resolve(#[from] ResolveError),

    /// No endpoint of the service accepted a connection.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The connection to the service was lost.
    #[error("disconnected")]
    Disconnected,

    /// The channel has no more replies.
    #[error("channel closed")]
    ChannelClosed,

    /// The caller gave up waiting.
    #[error("cancelled")]
    Cancelled,

    /// A reply payload did not match the requested type.
    #[error("invalid reply: {0}")]
    InvalidReply(#[from] hearth_proto::ProtocolError),
}

impl ServiceError {
    /// Wire error code for errors that have one.
    #[must_use]
    pub const fn code(&self) -> Option<i64> {
        match self {
            Self::Disconnected => Some(ErrorCode::Disconnected.code()),
            _ => None,
        }
    }
}

type Reply = Result<ServiceResponse, ServiceError>;
type Sessions = SessionTable<QueueSender<Reply>>;

/// One reply frame from a service.
#[derive(Debug, Clone)]
pub struct ServiceResponse {
    ty: u64,
    payload: Payload,
    headers: Option<Headers>,
}

impl ServiceResponse {
    /// Method-specific type code of the reply.
    #[must_use]
    pub const fn ty(&self) -> u64 {
        self.ty
    }

    /// Raw reply arguments.
    #[must_use]
    pub const fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Headers attached to the reply, if any.
    #[must_use]
    pub const fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    /// Deserialises the reply arguments.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        Ok(self.payload.decode()?)
    }
}

impl From<Message> for ServiceResponse {
    fn from(message: Message) -> Self {
        Self {
            ty: message.ty(),
            headers: message.headers().cloned(),
            payload: message.payload().clone(),
        }
    }
}

/// Connection to a named service.
#[derive(Debug)]
pub struct Service {
    name: String,
    endpoint: Option<Endpoint>,
    sender: MessageSender,
    sessions: Arc<Sessions>,
    // Holding this while attaching and sending keeps session ids on the
    // wire in increasing order.
    open_lock: Mutex<()>,
    shutdown: CancellationToken,
}

impl Service {
    /// Resolves `name` and connects to the first reachable endpoint.
    pub async fn connect(
        name: &str,
        resolver: &dyn Resolver,
        timeout: Duration,
    ) -> Result<Self, ServiceError> {
        let endpoints = resolver.resolve(name).await?;
        let (endpoint, conn) = transport::connect_any(&endpoints, timeout).await?;
        info!(service = %name, endpoint = %endpoint, "connected to service");

        let mut service = Self::from_stream(name, conn);
        service.endpoint = Some(endpoint);
        Ok(service)
    }

    /// Runs the client over an already open stream.
    pub fn from_stream<S>(name: &str, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let socket = AsyncSocket::new(stream);
        let sender = socket.sender();
        let sessions = Arc::new(Sessions::new());
        let shutdown = CancellationToken::new();

        tokio::spawn(dispatch(
            name.to_owned(),
            socket,
            Arc::clone(&sessions),
            shutdown.clone(),
        ));

        Self {
            name: name.to_owned(),
            endpoint: None,
            sender,
            sessions,
            open_lock: Mutex::new(()),
            shutdown,
        }
    }

    /// Name the service was created for.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoint the connection was made to, when resolved by name.
    #[must_use]
    pub const fn endpoint(&self) -> Option<&Endpoint> {
        self.endpoint.as_ref()
    }

    /// Checks whether the connection has been lost or closed.
    #[must_use]
    pub fn is_disconnected(&self) -> bool {
        self.sender.is_closed()
    }

    /// Number of channels still waiting for replies.
    #[must_use]
    pub fn live_channels(&self) -> usize {
        self.sessions.len()
    }

    /// Calls `method` with `args`, opening a new session.
    pub fn call(&self, method: u64, args: Payload) -> Result<Channel, ServiceError> {
        self.open(method, args, None)
    }

    /// Like [`call`](Self::call), attaching headers such as trace ids.
    pub fn call_with_headers(
        &self,
        method: u64,
        args: Payload,
        headers: Headers,
    ) -> Result<Channel, ServiceError> {
        self.open(method, args, Some(headers))
    }

    fn open(
        &self,
        method: u64,
        args: Payload,
        headers: Option<Headers>,
    ) -> Result<Channel, ServiceError> {
        if self.is_disconnected() {
            return Err(ServiceError::Disconnected);
        }

        let (tx, rx, _control) = queue::unbounded();
        let _guard = self.open_lock.lock();
        let session = self.sessions.attach(tx);

        let mut message = Message::new(session, method, args);
        if let Some(headers) = headers {
            message = message.with_headers(headers);
        }
        debug!(service = %self.name, session, method, "calling service");

        if !self.sender.send(message) {
            self.sessions.detach(session);
            return Err(ServiceError::Disconnected);
        }

        Ok(Channel {
            session,
            replies: rx,
            sender: self.sender.clone(),
            sessions: Arc::clone(&self.sessions),
        })
    }

    /// Closes the connection. Live channels receive a disconnect error.
    pub fn close(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// One open session on a [`Service`].
///
/// Dropping the channel detaches the session; replies that arrive later
/// are discarded.
#[derive(Debug)]
pub struct Channel {
    session: u64,
    replies: QueueReceiver<Reply>,
    sender: MessageSender,
    sessions: Arc<Sessions>,
}

impl Channel {
    /// Session id of this channel.
    #[must_use]
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// Waits for the next reply.
    ///
    /// Cancelling leaves the channel untouched; a later call still sees the
    /// next reply.
    pub async fn get(&mut self, cancel: &CancellationToken) -> Result<ServiceResponse, ServiceError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ServiceError::Cancelled),
            reply = self.replies.recv() => reply.unwrap_or(Err(ServiceError::ChannelClosed)),
        }
    }

    /// Writes another frame on this session.
    pub fn send(&self, ty: u64, args: Payload) -> Result<(), ServiceError> {
        if self.sender.send(Message::new(self.session, ty, args)) {
            Ok(())
        } else {
            Err(ServiceError::Disconnected)
        }
    }

    /// Stops listening for replies on this session.
    pub fn close(self) {}
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.sessions.detach(self.session);
    }
}

async fn dispatch(
    name: String,
    mut socket: AsyncSocket,
    sessions: Arc<Sessions>,
    shutdown: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            () = shutdown.cancelled() => {
                socket.close();
                break;
            }
            message = socket.recv() => message,
        };
        let Some(message) = message else {
            break;
        };

        let session = message.session();
        let delivered = sessions.with(session, |replies| {
            replies.push(Ok(ServiceResponse::from(message))).is_ok()
        });
        if delivered.is_none() {
            trace!(service = %name, session, "reply for detached session");
        }
    }

    let live = sessions.drain();
    info!(service = %name, live = live.len(), "service disconnected");
    for (_, replies) in live {
        let _ = replies.push(Err(ServiceError::Disconnected));
    }
}
