//! Inbound half of a session.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use hearth_core::queue::{self, QueueReceiver, QueueSender};
use hearth_proto::{Dialect, Headers, Message, ProtocolError, TraceInfo};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::error::RequestError;

/// A frame waiting to be read by the handler.
#[derive(Debug)]
enum Item {
    Chunk(Message),
    Error(Message),
}

/// Producer side of a [`Request`], owned by the event loop.
///
/// Dropping it ends the request: the handler reads what is buffered and
/// then sees end of stream.
#[derive(Debug)]
pub(crate) struct RequestSink {
    items: QueueSender<Item>,
}

impl RequestSink {
    /// Buffers a chunk frame.
    pub(crate) fn push_chunk(&self, message: Message) {
        let _ = self.items.push(Item::Chunk(message));
    }

    /// Buffers an error frame.
    pub(crate) fn push_error(&self, message: Message) {
        let _ = self.items.push(Item::Error(message));
    }
}

/// Data sent by the caller of one invocation.
///
/// Chunks are buffered as they arrive and read one at a time. A request has
/// a single reader.
#[derive(Debug)]
pub struct Request {
    event: String,
    dialect: Dialect,
    items: QueueReceiver<Item>,
    headers: Option<Headers>,
    trace: Option<TraceInfo>,
}

impl Request {
    /// Creates a request and the sink that feeds it.
    pub(crate) fn open(
        event: impl Into<String>,
        dialect: Dialect,
        headers: Option<Headers>,
    ) -> (Self, RequestSink) {
        let (tx, rx, _control) = queue::unbounded();
        let trace = headers.as_ref().and_then(Headers::trace_info);
        let request = Self {
            event: event.into(),
            dialect,
            items: rx,
            headers,
            trace,
        };
        (request, RequestSink { items: tx })
    }

    /// Name of the invoked event.
    #[must_use]
    pub fn event(&self) -> &str {
        &self.event
    }

    /// Headers of the invoke frame, replaced by those of each frame read.
    #[must_use]
    pub const fn headers(&self) -> Option<&Headers> {
        self.headers.as_ref()
    }

    /// Trace ids the invocation arrived with.
    #[must_use]
    pub const fn trace_info(&self) -> Option<TraceInfo> {
        self.trace
    }

    /// Reads the next chunk.
    ///
    /// Returns `Ok(None)` once the caller closed its side and every chunk
    /// has been read. An error frame from the caller surfaces as
    /// [`RequestError::Remote`]. If `cancel` fires first nothing is
    /// consumed and a later read sees the same data.
    pub async fn read(&mut self, cancel: &CancellationToken) -> Result<Option<Bytes>, RequestError> {
        let item = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(RequestError::Cancelled),
            item = self.items.recv() => item,
        };
        self.unpack(item)
    }

    /// Reads the next chunk, giving up after `timeout`.
    ///
    /// A timeout leaves the request untouched, like a cancelled [`read`](Self::read).
    pub async fn read_timeout(&mut self, timeout: Duration) -> Result<Option<Bytes>, RequestError> {
        let item = tokio::time::timeout(timeout, self.items.recv())
            .await
            .map_err(|_| RequestError::Timeout)?;
        self.unpack(item)
    }

    /// Reads every remaining chunk and concatenates them.
    pub async fn read_to_end(&mut self, cancel: &CancellationToken) -> Result<Bytes, RequestError> {
        let mut body = BytesMut::new();
        while let Some(chunk) = self.read(cancel).await? {
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }

    /// Reads the next chunk and deserialises it from MessagePack.
    pub async fn read_as<T: DeserializeOwned>(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<T>, RequestError> {
        let Some(chunk) = self.read(cancel).await? else {
            return Ok(None);
        };
        rmp_serde::from_slice(&chunk)
            .map(Some)
            .map_err(|e| ProtocolError::Deserialisation(e.to_string()).into())
    }

    fn unpack(&mut self, item: Option<Item>) -> Result<Option<Bytes>, RequestError> {
        match item {
            None => Ok(None),
            Some(Item::Chunk(message)) => {
                self.headers = message.headers().cloned();
                Ok(Some(message.payload().first_bytes()?))
            }
            Some(Item::Error(message)) => {
                self.headers = message.headers().cloned();
                let frame = self.dialect.parse_error(message.payload())?;
                Err(RequestError::Remote {
                    category: frame.category,
                    code: frame.code,
                    message: frame.message,
                })
            }
        }
    }
}
