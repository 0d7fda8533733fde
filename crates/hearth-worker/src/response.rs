//! Outbound half of a session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hearth_core::AsyncSender;
use hearth_proto::{Dialect, ErrorCode, Message};
use serde::Serialize;
use tracing::trace;

use crate::error::ResponseError;

/// Reply stream for one invocation.
///
/// Every frame carries the session the response was created for. The
/// stream ends exactly once with a choke, sent by [`close`](Self::close)
/// or right after the error frame of [`error_msg`](Self::error_msg).
/// Anything after that is rejected with [`ResponseError::Closed`].
pub struct Response {
    session: u64,
    dialect: Dialect,
    sender: Arc<dyn AsyncSender>,
    closed: Arc<AtomicBool>,
}

impl Response {
    pub(crate) fn new(session: u64, dialect: Dialect, sender: Arc<dyn AsyncSender>) -> Self {
        Self {
            session,
            dialect,
            sender,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A second handle on the same stream, kept by the handler guard so it
    /// can close the response once the handler returns.
    pub(crate) fn handle(&self) -> Self {
        Self {
            session: self.session,
            dialect: self.dialect,
            sender: Arc::clone(&self.sender),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Session id this response writes to.
    #[must_use]
    pub const fn session(&self) -> u64 {
        self.session
    }

    /// Checks whether the stream has been ended.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Sends one chunk of data.
    pub fn write(&self, data: impl AsRef<[u8]>) -> Result<(), ResponseError> {
        if self.is_closed() {
            return Err(ResponseError::Closed);
        }
        self.send(self.dialect.chunk(self.session, data.as_ref()))
    }

    /// Serialises `value` as MessagePack and sends it as one chunk.
    pub fn write_value<T: Serialize + ?Sized>(&self, value: &T) -> Result<(), ResponseError> {
        let data =
            rmp_serde::to_vec(value).map_err(|e| ResponseError::Serialisation(e.to_string()))?;
        self.write(data)
    }

    /// Sends an application error, then a choke.
    pub fn error_msg(&self, code: i64, message: &str) -> Result<(), ResponseError> {
        self.error_with_category(ErrorCode::APPLICATION_CATEGORY, code, message)
    }

    /// Sends a framework error, then a choke.
    pub(crate) fn error_code(&self, code: ErrorCode, message: &str) -> Result<(), ResponseError> {
        self.error_with_category(code.category(), code.code(), message)
    }

    fn error_with_category(
        &self,
        category: i64,
        code: i64,
        message: &str,
    ) -> Result<(), ResponseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ResponseError::Closed);
        }
        self.send(self.dialect.error(self.session, category, code, message))?;
        self.send(self.dialect.choke(self.session))
    }

    /// Ends the stream with a choke.
    ///
    /// Closing twice, or after `error_msg`, sends nothing and returns
    /// [`ResponseError::Closed`].
    pub fn close(&self) -> Result<(), ResponseError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(ResponseError::Closed);
        }
        self.send(self.dialect.choke(self.session))
    }

    fn send(&self, message: Message) -> Result<(), ResponseError> {
        if self.sender.send(message) {
            Ok(())
        } else {
            trace!(session = self.session, "response frame dropped, connection closed");
            Err(ResponseError::Disconnected)
        }
    }
}

impl std::fmt::Debug for Response {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Response")
            .field("session", &self.session)
            .field("dialect", &self.dialect)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use parking_lot::Mutex;

    /// Records every frame instead of writing it anywhere.
    #[derive(Default)]
    pub(crate) struct Recorder {
        pub(crate) frames: Mutex<Vec<Message>>,
        pub(crate) disconnected: AtomicBool,
    }

    impl AsyncSender for Recorder {
        fn send(&self, message: Message) -> bool {
            if self.disconnected.load(Ordering::Acquire) {
                return false;
            }
            self.frames.lock().push(message);
            true
        }
    }

    fn response(dialect: Dialect) -> (Response, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let sender: Arc<dyn AsyncSender> = recorder.clone();
        (Response::new(9, dialect, sender), recorder)
    }

    #[test]
    fn write_then_close() {
        let (response, recorder) = response(Dialect::V1);
        response.write(b"hello").unwrap();
        response.close().unwrap();

        let frames = recorder.frames.lock();
        assert_eq!(
            *frames,
            vec![Dialect::V1.chunk(9, b"hello"), Dialect::V1.choke(9)]
        );
    }

    #[test]
    fn close_then_error_sends_one_terminal_frame() {
        let (response, recorder) = response(Dialect::V1);
        response.close().unwrap();
        assert_eq!(response.error_msg(1, "late"), Err(ResponseError::Closed));
        assert_eq!(response.close(), Err(ResponseError::Closed));
        assert_eq!(*recorder.frames.lock(), vec![Dialect::V1.choke(9)]);
    }

    #[test]
    fn error_is_followed_by_exactly_one_choke() {
        for dialect in [Dialect::V0, Dialect::V1] {
            let (response, recorder) = response(dialect);
            response.error_msg(42, "bad").unwrap();
            assert_eq!(response.close(), Err(ResponseError::Closed));
            assert_eq!(response.error_msg(43, "again"), Err(ResponseError::Closed));
            assert_eq!(response.write(b"x"), Err(ResponseError::Closed));

            let frames = recorder.frames.lock();
            assert_eq!(
                *frames,
                vec![
                    dialect.error(9, ErrorCode::APPLICATION_CATEGORY, 42, "bad"),
                    dialect.choke(9),
                ]
            );
        }
    }

    #[test]
    fn handle_shares_closed_state() {
        let (response, recorder) = response(Dialect::V0);
        let handle = response.handle();
        response.close().unwrap();
        assert!(handle.is_closed());
        assert_eq!(handle.close(), Err(ResponseError::Closed));
        assert_eq!(recorder.frames.lock().len(), 1);
    }

    #[test]
    fn framework_errors_use_their_category() {
        let (response, recorder) = response(Dialect::V1);
        response
            .error_code(ErrorCode::NoEventHandler, "no handler")
            .unwrap();
        let frames = recorder.frames.lock();
        let parsed = Dialect::V1.parse_error(frames[0].payload()).unwrap();
        assert_eq!(parsed.category, ErrorCode::FRAMEWORK_CATEGORY);
        assert_eq!(parsed.code, 200);
    }

    #[test]
    fn write_value_encodes_messagepack() {
        let (response, recorder) = response(Dialect::V1);
        response.write_value(&("pong", 1u8)).unwrap();
        let frames = recorder.frames.lock();
        let data = frames[0].payload().first_bytes().unwrap();
        let decoded: (String, u8) = rmp_serde::from_slice(&data).unwrap();
        assert_eq!(decoded, ("pong".to_owned(), 1));
    }

    struct Unencodable;

    impl Serialize for Unencodable {
        fn serialize<S: serde::Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("no msgpack form"))
        }
    }

    #[test]
    fn write_value_keeps_the_encoder_message() {
        let (response, recorder) = response(Dialect::V1);
        let Err(ResponseError::Serialisation(message)) = response.write_value(&Unencodable) else {
            panic!("expected a serialisation error");
        };
        assert!(message.contains("no msgpack form"), "{message}");
        assert!(recorder.frames.lock().is_empty());
        assert!(!response.is_closed());
    }

    #[test]
    fn disconnected_writes_report_an_error() {
        let (response, recorder) = response(Dialect::V1);
        recorder.disconnected.store(true, Ordering::Release);
        assert_eq!(response.write(b"x"), Err(ResponseError::Disconnected));
        assert!(!response.is_closed());
    }
}
