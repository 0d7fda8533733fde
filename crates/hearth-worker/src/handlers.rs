//! Event name to handler mapping.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use hearth_proto::ErrorCode;
use tracing::debug;

use crate::request::Request;
use crate::response::Response;

/// Code run for each invocation of an event.
///
/// Implemented for any `Fn(Request, Response) -> impl Future` closure, so
/// `async fn` items and closures returning async blocks both work.
pub trait Handler: Send + Sync + 'static {
    /// Starts handling one invocation.
    fn call(&self, request: Request, response: Response) -> BoxFuture<'static, ()>;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, request: Request, response: Response) -> BoxFuture<'static, ()> {
        self(request, response).boxed()
    }
}

/// Handler for events nobody registered. Receives the event name.
pub trait FallbackHandler: Send + Sync + 'static {
    /// Starts handling one invocation of an unknown event.
    fn call(&self, event: String, request: Request, response: Response) -> BoxFuture<'static, ()>;
}

impl<F, Fut> FallbackHandler for F
where
    F: Fn(String, Request, Response) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    fn call(&self, event: String, request: Request, response: Response) -> BoxFuture<'static, ()> {
        self(event, request, response).boxed()
    }
}

/// Replies to an unknown event with error 200.
pub async fn default_fallback(event: String, _request: Request, response: Response) {
    let message = format!("There is no handler for an event {event}");
    let _ = response.error_code(ErrorCode::NoEventHandler, &message);
}

/// Registry of handlers keyed by event name.
pub struct EventHandlers {
    handlers: HashMap<String, Arc<dyn Handler>>,
    fallback: Arc<dyn FallbackHandler>,
}

impl EventHandlers {
    /// Creates an empty registry with the default fallback.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(default_fallback),
        }
    }

    /// Registers `handler` for `event`, replacing any earlier one.
    #[must_use]
    pub fn on(mut self, event: impl Into<String>, handler: impl Handler) -> Self {
        let event = event.into();
        debug!(event = %event, "handler registered");
        self.handlers.insert(event, Arc::new(handler));
        self
    }

    /// Replaces the handler used for unregistered events.
    #[must_use]
    pub fn set_fallback(mut self, handler: impl FallbackHandler) -> Self {
        self.fallback = Arc::new(handler);
        self
    }

    /// Registered event names, sorted.
    #[must_use]
    pub fn events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.handlers.keys().cloned().collect();
        events.sort_unstable();
        events
    }

    /// Checks whether a handler is registered for `event`.
    #[must_use]
    pub fn contains(&self, event: &str) -> bool {
        self.handlers.contains_key(event)
    }

    /// Routes one invocation to its handler, or to the fallback.
    pub fn call(&self, event: &str, request: Request, response: Response) -> BoxFuture<'static, ()> {
        match self.handlers.get(event) {
            Some(handler) => handler.call(request, response),
            None => self.fallback.call(event.to_owned(), request, response),
        }
    }
}

impl Default for EventHandlers {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHandlers")
            .field("events", &self.events())
            .finish_non_exhaustive()
    }
}
