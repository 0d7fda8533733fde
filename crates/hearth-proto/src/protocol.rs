//! Per-connection classification of inbound frames.

use crate::dialect::{v0, v1, Dialect};
use crate::error::{ProtocolError, Result};
use crate::message::Message;

/// What an inbound frame means to the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Heartbeat echo on the utility session.
    Heartbeat,
    /// Supervisor asks the worker to shut down.
    Terminate,
    /// A new session opening for the named event.
    Invoke(String),
    /// Data for a live session.
    Chunk,
    /// Error for a live session.
    Error,
    /// End of a live session's input.
    Choke,
}

/// Classifier state for one connection.
///
/// V1 marks the start of a session only by its id being larger than any id
/// seen before, so the classifier has to remember the highest id. V0 names
/// invokes explicitly but ids are still never reused, so a V0 invoke at or
/// below the highest id is refused.
#[derive(Debug, Clone)]
pub struct ProtocolState {
    dialect: Dialect,
    max_session: u64,
}

impl ProtocolState {
    /// Creates classifier state for a fresh connection.
    #[must_use]
    pub const fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            max_session: dialect.utility_session(),
        }
    }

    /// The dialect this connection speaks.
    #[must_use]
    pub const fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Highest session id that has opened so far.
    #[must_use]
    pub const fn max_session(&self) -> u64 {
        self.max_session
    }

    /// Classifies one inbound message.
    ///
    /// Errors are protocol errors: the caller drops the message and keeps
    /// the connection.
    pub fn classify(&mut self, message: &Message) -> Result<Inbound> {
        match self.dialect {
            Dialect::V0 => self.classify_v0(message),
            Dialect::V1 => self.classify_v1(message),
        }
    }

    fn classify_v0(&mut self, message: &Message) -> Result<Inbound> {
        let session = message.session();
        match message.ty() {
            v0::CHUNK => Ok(Inbound::Chunk),
            v0::CHOKE => Ok(Inbound::Choke),
            v0::ERROR => Ok(Inbound::Error),
            v0::INVOKE if session <= self.max_session => Err(ProtocolError::OutOfSequence {
                session,
                ty: v0::INVOKE,
            }),
            v0::INVOKE => {
                self.max_session = session;
                message.payload().event_name().map(Inbound::Invoke)
            }
            v0::HEARTBEAT => Ok(Inbound::Heartbeat),
            v0::TERMINATE => Ok(Inbound::Terminate),
            ty => Err(ProtocolError::UnknownMessageType { session, ty }),
        }
    }

    fn classify_v1(&mut self, message: &Message) -> Result<Inbound> {
        let session = message.session();
        let ty = message.ty();

        if session == v1::UTILITY_SESSION {
            return match ty {
                v1::HEARTBEAT => Ok(Inbound::Heartbeat),
                v1::TERMINATE => Ok(Inbound::Terminate),
                _ => Err(ProtocolError::UnknownMessageType { session, ty }),
            };
        }

        if session > self.max_session {
            if ty != v1::INVOKE {
                return Err(ProtocolError::OutOfSequence { session, ty });
            }
            // The id is consumed even when the event name turns out to be
            // unusable, so a retry on the same id reads as a chunk.
            self.max_session = session;
            return message.payload().event_name().map(Inbound::Invoke);
        }

        match ty {
            v1::WRITE => Ok(Inbound::Chunk),
            v1::ERROR => Ok(Inbound::Error),
            v1::CLOSE => Ok(Inbound::Choke),
            _ => Err(ProtocolError::UnknownMessageType { session, ty }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Payload;

    #[test]
    fn v1_implicit_invoke_then_chunk() {
        let mut state = ProtocolState::new(Dialect::V1);

        let invoke = Message::new(5, 0, Payload::builder().str("echo").build());
        assert_eq!(state.classify(&invoke).unwrap(), Inbound::Invoke("echo".into()));
        assert_eq!(state.max_session(), 5);

        let chunk = Message::new(5, 0, Payload::builder().str("data").build());
        assert_eq!(state.classify(&chunk).unwrap(), Inbound::Chunk);
    }

    #[test]
    fn v1_new_session_must_start_with_invoke() {
        let mut state = ProtocolState::new(Dialect::V1);
        let close = Message::new(3, v1::CLOSE, Payload::empty());
        assert!(matches!(
            state.classify(&close),
            Err(ProtocolError::OutOfSequence { session: 3, ty: 2 })
        ));
        assert_eq!(state.max_session(), 1);
    }

    #[test]
    fn v1_utility_session() {
        let mut state = ProtocolState::new(Dialect::V1);
        assert_eq!(state.classify(&Dialect::V1.heartbeat()).unwrap(), Inbound::Heartbeat);
        assert_eq!(
            state.classify(&Dialect::V1.terminate(1, "bye")).unwrap(),
            Inbound::Terminate
        );
        let junk = Message::new(1, 9, Payload::empty());
        assert!(state.classify(&junk).is_err());
    }

    #[test]
    fn v1_old_session_ids_are_not_invokes() {
        let mut state = ProtocolState::new(Dialect::V1);
        state.classify(&Dialect::V1.invoke(10, "a")).unwrap();
        // Lower id than the maximum: never a new session.
        let late = Message::new(4, 0, Payload::builder().str("x").build());
        assert_eq!(state.classify(&late).unwrap(), Inbound::Chunk);
        assert_eq!(
            state.classify(&Dialect::V1.error(4, 0, 1, "e")).unwrap(),
            Inbound::Error
        );
        assert_eq!(state.classify(&Dialect::V1.choke(4)).unwrap(), Inbound::Choke);
    }

    #[test]
    fn v1_bad_event_name_still_consumes_id() {
        let mut state = ProtocolState::new(Dialect::V1);
        let broken = Message::new(6, 0, Payload::empty());
        assert!(matches!(
            state.classify(&broken),
            Err(ProtocolError::MissingEventName)
        ));
        assert_eq!(state.max_session(), 6);
    }

    #[test]
    fn v0_dispatches_on_type_only() {
        let mut state = ProtocolState::new(Dialect::V0);
        let d = Dialect::V0;
        assert_eq!(state.classify(&d.invoke(2, "ping")).unwrap(), Inbound::Invoke("ping".into()));
        assert_eq!(state.classify(&d.chunk(2, b"x")).unwrap(), Inbound::Chunk);
        assert_eq!(state.classify(&d.error(2, 0, 1, "e")).unwrap(), Inbound::Error);
        assert_eq!(state.classify(&d.choke(2)).unwrap(), Inbound::Choke);
        assert_eq!(state.classify(&d.heartbeat()).unwrap(), Inbound::Heartbeat);
        assert_eq!(state.classify(&d.terminate(0, "")).unwrap(), Inbound::Terminate);
        assert!(state.classify(&d.handshake("me")).is_err());
    }

    #[test]
    fn v0_invoke_ids_are_never_reused() {
        let mut state = ProtocolState::new(Dialect::V0);
        let d = Dialect::V0;
        assert_eq!(state.max_session(), 0);
        assert_eq!(state.classify(&d.invoke(4, "a")).unwrap(), Inbound::Invoke("a".into()));
        assert_eq!(state.max_session(), 4);

        for reused in [4, 2] {
            assert!(matches!(
                state.classify(&d.invoke(reused, "a")),
                Err(ProtocolError::OutOfSequence { ty: 3, .. })
            ));
        }
        assert_eq!(state.max_session(), 4);

        // Traffic for a lower, already opened id is still routed.
        assert_eq!(state.classify(&d.chunk(2, b"x")).unwrap(), Inbound::Chunk);
        assert_eq!(state.classify(&d.invoke(5, "b")).unwrap(), Inbound::Invoke("b".into()));
    }
}
