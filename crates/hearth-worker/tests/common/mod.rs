//! Fake supervisor for driving a worker over an in-memory stream.

#![allow(dead_code)]

use std::time::Duration;

use futures::{SinkExt, StreamExt};
use hearth_proto::{Dialect, ErrorFrame, Message, MessageCodec};
use hearth_worker::{EventHandlers, Shutdown, StopHandle, Worker, WorkerError, WorkerSettings};
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;

pub const UUID: &str = "0b7a2c1e-worker";

/// Supervisor side of a worker connection.
pub struct Supervisor {
    pub dialect: Dialect,
    frames: Framed<DuplexStream, MessageCodec>,
}

impl Supervisor {
    pub async fn send(&mut self, message: Message) {
        self.frames.send(message).await.unwrap();
    }

    /// Next frame as written by the worker, heartbeats included.
    pub async fn recv_raw(&mut self) -> Option<Message> {
        self.frames.next().await.map(Result::unwrap)
    }

    /// Next non-heartbeat frame. Heartbeats are answered on the way.
    pub async fn recv(&mut self) -> Message {
        loop {
            let message = tokio::time::timeout(Duration::from_secs(5), self.recv_raw())
                .await
                .expect("timed out waiting for the worker")
                .expect("worker closed the connection");
            if message == self.dialect.heartbeat() {
                self.send(message).await;
                continue;
            }
            return message;
        }
    }

    /// Reads frames until `session` is choked, returning all of them in
    /// order, the choke included.
    pub async fn collect(&mut self, session: u64) -> Vec<Message> {
        let choke = self.dialect.choke(session);
        let mut frames = Vec::new();
        loop {
            let message = self.recv().await;
            assert_eq!(message.session(), session, "unexpected frame {message:?}");
            let done = message == choke;
            frames.push(message);
            if done {
                return frames;
            }
        }
    }

    pub fn chunk_body(message: &Message) -> Vec<u8> {
        message.payload().first_bytes().unwrap().to_vec()
    }

    pub fn error_body(&self, message: &Message) -> ErrorFrame {
        self.dialect.parse_error(message.payload()).unwrap()
    }
}

/// Builds a worker on one end of a duplex stream and a supervisor on the
/// other. The handshake is still waiting on the supervisor side.
pub fn pair(settings: WorkerSettings) -> (Supervisor, Worker) {
    let (ours, theirs) = tokio::io::duplex(64 * 1024);
    let dialect = settings.dialect;
    let worker = Worker::new(theirs, settings);
    let supervisor = Supervisor {
        dialect,
        frames: Framed::new(ours, MessageCodec::new()),
    };
    (supervisor, worker)
}

/// Starts a worker serving `handlers` and consumes its handshake.
pub async fn start(
    dialect: Dialect,
    handlers: EventHandlers,
) -> (Supervisor, StopHandle, JoinHandle<Result<Shutdown, WorkerError>>) {
    let (mut supervisor, worker) = pair(WorkerSettings::new(UUID).with_dialect(dialect));
    let stop = worker.stop_handle();
    let run = tokio::spawn(worker.run(handlers));

    let handshake = supervisor.recv_raw().await.unwrap();
    assert_eq!(handshake, dialect.handshake(UUID));
    (supervisor, stop, run)
}
