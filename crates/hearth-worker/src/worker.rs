//! The worker event loop.
//!
//! One task owns the connection to the supervisor, the heartbeat and
//! disown timers and the table of live sessions. Handlers run on their own
//! tasks and only ever touch their [`Request`] and [`Response`], so a slow
//! handler never delays heartbeats.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use hearth_core::{AsyncSender, AsyncSocket, Endpoint, SessionTable};
use hearth_proto::{Dialect, Inbound, Message, ProtocolState};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::{self, WorkerConfig};
use crate::error::WorkerError;
use crate::guard;
use crate::handlers::EventHandlers;
use crate::request::{Request, RequestSink};
use crate::response::Response;
use crate::token::{NullTokenManager, Token, TokenManager, TokenManagerRegistry};

type TerminationHandler = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, ()> + Send>;

/// How a worker finished without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shutdown {
    /// [`StopHandle::stop`] was called.
    Stopped,
    /// The supervisor sent a terminate frame, which was acknowledged.
    Terminated,
}

/// Runtime settings of a worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Identifier sent in the handshake.
    pub uuid: String,
    /// Wire dialect of the supervisor connection.
    pub dialect: Dialect,
    /// Include stack traces in panic reports.
    pub debug: bool,
    /// Log live sessions and events on SIGUSR1.
    pub stack_signal: bool,
    /// Interval between heartbeats.
    pub heartbeat_timeout: Duration,
    /// How long to wait for a heartbeat reply.
    pub disown_timeout: Duration,
    /// Grace period for the termination hook.
    pub termination_timeout: Duration,
}

impl WorkerSettings {
    /// Default timers and the V1 dialect.
    pub fn new(uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            dialect: Dialect::default(),
            debug: false,
            stack_signal: false,
            heartbeat_timeout: config::default_heartbeat(),
            disown_timeout: config::default_disown(),
            termination_timeout: config::default_termination(),
        }
    }

    /// Sets the dialect.
    #[must_use]
    pub const fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }
}

/// Cloneable handle that ends [`Worker::run`] cleanly.
#[derive(Debug, Clone)]
pub struct StopHandle {
    token: CancellationToken,
}

impl StopHandle {
    /// Asks the worker to stop. Safe to call more than once.
    pub fn stop(&self) {
        self.token.cancel();
    }

    /// Checks whether a stop was requested.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A worker connected to its supervisor.
pub struct Worker {
    socket: AsyncSocket,
    protocol: ProtocolState,
    sessions: SessionTable<RequestSink>,
    settings: WorkerSettings,
    tokens: Box<dyn TokenManager>,
    termination: Option<TerminationHandler>,
    stop: CancellationToken,
    released: bool,
}

impl Worker {
    /// Connects to the endpoint in `config` and sends the handshake.
    pub async fn connect(
        config: &WorkerConfig,
        tokens: &TokenManagerRegistry,
    ) -> Result<Self, WorkerError> {
        config.validate()?;
        let settings = config.settings()?;
        let manager = tokens.create(&config.app, config.token.clone())?;

        let endpoint = Endpoint::parse(&config.endpoint)?;
        let conn = match endpoint.connect_timeout(config.timeouts.connect).await {
            Ok(conn) => conn,
            Err(e) => {
                manager.stop();
                return Err(e.into());
            }
        };
        info!(endpoint = %endpoint, app = %config.app, dialect = %settings.dialect, "connected to supervisor");

        Ok(Self::new(conn, settings).with_token_manager(manager))
    }

    /// Wraps an open stream to the supervisor and sends the handshake.
    pub fn new<S>(stream: S, settings: WorkerSettings) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let socket = AsyncSocket::new(stream);
        socket.send(settings.dialect.handshake(&settings.uuid));
        debug!(uuid = %settings.uuid, "handshake sent");

        Self {
            socket,
            protocol: ProtocolState::new(settings.dialect),
            sessions: SessionTable::new(),
            settings,
            tokens: Box::new(NullTokenManager),
            termination: None,
            stop: CancellationToken::new(),
            released: false,
        }
    }

    /// Replaces the token manager.
    #[must_use]
    pub fn with_token_manager(mut self, tokens: Box<dyn TokenManager>) -> Self {
        self.tokens = tokens;
        self
    }

    /// Registers a hook run when the supervisor asks the worker to
    /// terminate. Its token fires when the grace period runs out.
    pub fn set_termination_handler<F, Fut>(&mut self, handler: F)
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.termination = Some(Box::new(move |token| handler(token).boxed()));
    }

    /// Enables stack traces in panic reports.
    pub fn set_debug(&mut self, debug: bool) {
        self.settings.debug = debug;
    }

    /// Enables the SIGUSR1 diagnostic dump. Takes effect on the next `run`.
    pub fn enable_stack_signal(&mut self, enable: bool) {
        self.settings.stack_signal = enable;
    }

    /// Most recent token from the token manager.
    #[must_use]
    pub fn token(&self) -> Token {
        self.tokens.token()
    }

    /// Handle for stopping the worker from another task.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            token: self.stop.clone(),
        }
    }

    /// Serves invocations until the worker stops.
    ///
    /// Returns `Ok` for a requested stop or an acknowledged terminate,
    /// [`WorkerError::Disowned`] if heartbeats go unanswered and
    /// [`WorkerError::ConnectionLost`] if the supervisor goes away.
    pub async fn run(mut self, handlers: EventHandlers) -> Result<Shutdown, WorkerError> {
        let handlers = Arc::new(handlers);
        if self.settings.debug {
            guard::capture_backtraces();
        }
        let mut dump = self.dump_signal();

        info!(events = ?handlers.events(), dialect = %self.settings.dialect, "worker running");

        let heartbeat = tokio::time::sleep(Duration::ZERO);
        tokio::pin!(heartbeat);
        let mut disown_at = None;

        let outcome = loop {
            tokio::select! {
                message = self.socket.recv() => match message {
                    Some(message) => {
                        if let Some(outcome) = self.on_message(message, &handlers, &mut disown_at).await {
                            break outcome;
                        }
                    }
                    None if self.stop.is_cancelled() => break Ok(Shutdown::Stopped),
                    None => break Err(WorkerError::ConnectionLost),
                },
                () = &mut heartbeat => {
                    self.socket.send(self.settings.dialect.heartbeat());
                    heartbeat.as_mut().reset(Instant::now() + self.settings.heartbeat_timeout);
                    disown_at = Some(Instant::now() + self.settings.disown_timeout);
                }
                () = expire(disown_at), if disown_at.is_some() => {
                    warn!(timeout = ?self.settings.disown_timeout, "no heartbeat reply, disowned");
                    break Err(WorkerError::Disowned);
                }
                () = self.stop.cancelled() => break Ok(Shutdown::Stopped),
                () = next_signal(&mut dump) => self.dump_state(&handlers),
            }
        };

        match &outcome {
            Ok(shutdown) => info!(?shutdown, "worker stopped"),
            Err(e) => warn!(error = %e, "worker stopped"),
        }
        self.release().await;
        outcome
    }

    async fn on_message(
        &mut self,
        message: Message,
        handlers: &Arc<EventHandlers>,
        disown_at: &mut Option<Instant>,
    ) -> Option<Result<Shutdown, WorkerError>> {
        let inbound = match self.protocol.classify(&message) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!(session = message.session(), ty = message.ty(), error = %e, "dropping message");
                return None;
            }
        };

        let session = message.session();
        match inbound {
            Inbound::Heartbeat => {
                debug!("heartbeat reply");
                *disown_at = None;
            }
            Inbound::Terminate => {
                self.on_terminate(message).await;
                return Some(Ok(Shutdown::Terminated));
            }
            Inbound::Invoke(event) => self.on_invoke(&message, event, handlers),
            Inbound::Chunk => {
                if self.sessions.with(session, |sink| sink.push_chunk(message)).is_none() {
                    debug!(session, "chunk for unknown session");
                }
            }
            Inbound::Error => {
                if self.sessions.with(session, |sink| sink.push_error(message)).is_none() {
                    debug!(session, "error for unknown session");
                }
            }
            Inbound::Choke => {
                // Dropping the sink ends the handler's input.
                if self.sessions.detach(session).is_none() {
                    debug!(session, "choke for unknown session");
                }
            }
        }
        None
    }

    fn on_invoke(&self, message: &Message, event: String, handlers: &Arc<EventHandlers>) {
        let session = message.session();
        let dialect = self.settings.dialect;
        let (request, sink) = Request::open(event.clone(), dialect, message.headers().cloned());
        if self.sessions.insert(session, sink).is_err() {
            warn!(session, event = %event, "invoke for a session that is already live");
            return;
        }

        let sender: Arc<dyn AsyncSender> = Arc::new(self.socket.sender());
        let response = Response::new(session, dialect, sender);

        let trace = request.trace_info().unwrap_or_default();
        let span = info_span!(
            "handler",
            event = %event,
            session,
            trace_id = trace.trace,
            span_id = trace.span,
            parent_id = trace.parent,
        );
        debug!(session, event = %event, "invoke");

        tokio::spawn(
            guard::run_handler(
                Arc::clone(handlers),
                event,
                request,
                response,
                self.settings.debug,
            )
            .instrument(span),
        );
    }

    async fn on_terminate(&mut self, message: Message) {
        info!("terminate requested by supervisor");
        if let Some(hook) = self.termination.take() {
            let token = CancellationToken::new();
            let mut task = tokio::spawn(hook(token.clone()));
            if tokio::time::timeout(self.settings.termination_timeout, &mut task)
                .await
                .is_err()
            {
                token.cancel();
                warn!(timeout = ?self.settings.termination_timeout, "termination handler timed out");
            }
        }
        // The acknowledgement is the terminate frame itself.
        self.socket.send(message);
    }

    fn dump_signal(&self) -> Option<Signal> {
        if !self.settings.stack_signal {
            return None;
        }
        match signal(SignalKind::user_defined1()) {
            Ok(signal) => Some(signal),
            Err(e) => {
                warn!(error = %e, "failed to install SIGUSR1 handler");
                None
            }
        }
    }

    fn dump_state(&self, handlers: &EventHandlers) {
        info!(
            sessions = ?self.sessions.keys(),
            events = ?handlers.events(),
            max_session = self.protocol.max_session(),
            "worker state"
        );
    }

    /// Shuts down exactly once: stops the token manager, ends every live
    /// request and flushes the connection.
    async fn release(&mut self) {
        if std::mem::replace(&mut self.released, true) {
            return;
        }
        self.tokens.stop();
        self.stop.cancel();
        let live = self.sessions.drain();
        if !live.is_empty() {
            debug!(live = live.len(), "dropping live sessions");
        }
        self.socket.close_gracefully(self.settings.disown_timeout).await;
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.tokens.stop();
            self.stop.cancel();
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("settings", &self.settings)
            .field("sessions", &self.sessions.keys())
            .field("closed", &self.socket.is_closed())
            .finish_non_exhaustive()
    }
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_signal(signal: &mut Option<Signal>) {
    match signal {
        Some(signal) => {
            if signal.recv().await.is_none() {
                std::future::pending::<()>().await;
            }
        }
        None => std::future::pending().await,
    }
}
