//! Unbounded FIFO that decouples a producer from a slow consumer.
//!
//! Every buffer in the crate is an instance of this queue: the socket's
//! inbound and outbound paths, per-request input streams and the result
//! streams of outbound calls. A single task owns the pending items and
//! services three events: a new item arriving, the consumer taking the
//! head, and a stop or drain command.

use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const RUNNING: u8 = 0;
const DRAINING: u8 = 1;
const STOPPED: u8 = 2;
const FINISHED: u8 = 3;

/// Errors returned by queue control operations.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is already draining; it can be drained at most once.
    #[error("queue is draining")]
    Draining,

    /// The queue was stopped or has finished.
    #[error("queue is stopped")]
    Stopped,
}

#[derive(Debug)]
enum Command {
    Stop,
    Drain(Duration),
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    finished: CancellationToken,
}

/// Creates a queue and spawns its coordinating task.
///
/// Must be called from within a tokio runtime.
#[must_use]
pub fn unbounded<T: Send + 'static>() -> (QueueSender<T>, QueueReceiver<T>, QueueControl) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    // One slot: the consumer only ever sees the current head.
    let (output_tx, output_rx) = mpsc::channel(1);
    let (command_tx, command_rx) = mpsc::unbounded_channel();

    let shared = Arc::new(Shared {
        state: AtomicU8::new(RUNNING),
        finished: CancellationToken::new(),
    });

    tokio::spawn(run(input_rx, output_tx, command_rx, Arc::clone(&shared)));

    (
        QueueSender { inner: input_tx },
        QueueReceiver { inner: output_rx },
        QueueControl {
            commands: command_tx,
            shared,
        },
    )
}

async fn run<T>(
    mut input: mpsc::UnboundedReceiver<T>,
    output: mpsc::Sender<T>,
    mut commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
) {
    let mut pending = VecDeque::new();
    let mut input_open = true;
    let mut commands_open = true;
    let mut deadline: Option<Instant> = None;

    loop {
        if !input_open && pending.is_empty() {
            break;
        }

        tokio::select! {
            item = input.recv(), if input_open => match item {
                Some(item) => pending.push_back(item),
                None => input_open = false,
            },
            permit = output.reserve(), if !pending.is_empty() => match permit {
                Ok(permit) => {
                    if let Some(item) = pending.pop_front() {
                        permit.send(item);
                    }
                }
                Err(_) => break,
            },
            () = output.closed(), if pending.is_empty() => break,
            command = commands.recv(), if commands_open => match command {
                Some(Command::Stop) => break,
                Some(Command::Drain(timeout)) => {
                    // No new items; flush what is already queued.
                    input.close();
                    deadline = Some(Instant::now() + timeout);
                    commands_open = false;
                }
                None => commands_open = false,
            },
            () = expire(deadline), if deadline.is_some() => break,
        }
    }

    if !pending.is_empty() {
        trace!(discarded = pending.len(), "queue stopped with pending items");
    }
    shared.state.store(FINISHED, Ordering::Release);
    shared.finished.cancel();
}

async fn expire(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

/// Producer side. Cloning gives another producer for the same queue.
#[derive(Debug)]
pub struct QueueSender<T> {
    inner: mpsc::UnboundedSender<T>,
}

impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> QueueSender<T> {
    /// Enqueues an item without blocking.
    ///
    /// Returns the item back if the queue no longer accepts input.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.inner.send(item).map_err(|e| e.0)
    }

    /// Checks whether the queue stopped accepting input.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// Consumer side.
///
/// `recv` yields items in the order they were pushed and returns `None`
/// once every producer is gone and the buffer is empty, or after a stop.
#[derive(Debug)]
pub struct QueueReceiver<T> {
    inner: mpsc::Receiver<T>,
}

impl<T> QueueReceiver<T> {
    /// Waits for the next item.
    ///
    /// Cancel safe: dropping the future never loses an item.
    pub async fn recv(&mut self) -> Option<T> {
        self.inner.recv().await
    }

    /// Takes the head if one is ready.
    pub fn try_recv(&mut self) -> Option<T> {
        self.inner.try_recv().ok()
    }
}

impl<T> futures::Stream for QueueReceiver<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.poll_recv(cx)
    }
}

/// Stop and drain handle.
#[derive(Debug, Clone)]
pub struct QueueControl {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl QueueControl {
    /// Stops the queue at once, discarding items not yet handed out.
    ///
    /// Stopping twice is a no-op. Stopping a draining queue is rejected so
    /// the drain can finish.
    pub fn stop(&self) -> Result<(), QueueError> {
        match self
            .shared
            .state
            .compare_exchange(RUNNING, STOPPED, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let _ = self.commands.send(Command::Stop);
                Ok(())
            }
            Err(DRAINING) => Err(QueueError::Draining),
            Err(_) => Ok(()),
        }
    }

    /// Stops accepting input and lets queued items flush for up to
    /// `timeout`, then stops.
    pub fn drain(&self, timeout: Duration) -> Result<(), QueueError> {
        match self
            .shared
            .state
            .compare_exchange(RUNNING, DRAINING, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                let _ = self.commands.send(Command::Drain(timeout));
                Ok(())
            }
            Err(DRAINING) => Err(QueueError::Draining),
            Err(_) => Err(QueueError::Stopped),
        }
    }

    /// Checks whether the coordinating task has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.shared.finished.is_cancelled()
    }

    /// Waits until the coordinating task has exited.
    pub async fn finished(&self) {
        self.shared.finished.cancelled().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivers_in_order() {
        let (tx, mut rx, _control) = unbounded();
        for i in 0..100 {
            tx.push(i).unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(i) = rx.recv().await {
            seen.push(i);
        }
        assert_eq!(seen, (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn producers_never_block_on_slow_consumer() {
        let (tx, mut rx, _control) = unbounded();
        // Nobody reads while 10k items go in.
        for i in 0..10_000 {
            tx.push(i).unwrap();
        }
        assert_eq!(rx.recv().await, Some(0));
    }

    #[tokio::test]
    async fn drain_flushes_then_closes() {
        let (tx, mut rx, control) = unbounded();
        for i in 0..3 {
            tx.push(i).unwrap();
        }
        control.drain(Duration::from_secs(5)).unwrap();

        assert_eq!(rx.recv().await, Some(0));
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
        assert_eq!(rx.recv().await, None);
        control.finished().await;

        // Input is closed after a drain.
        assert_eq!(tx.push(9), Err(9));
    }

    #[tokio::test]
    async fn stop_after_drain_is_rejected() {
        let (tx, _rx, control) = unbounded::<u32>();
        // Two items with nobody reading keep the drain in progress.
        tx.push(1).unwrap();
        tx.push(2).unwrap();
        control.drain(Duration::from_secs(5)).unwrap();
        assert_eq!(control.stop(), Err(QueueError::Draining));
        assert_eq!(control.drain(Duration::from_secs(1)), Err(QueueError::Draining));
    }

    #[tokio::test(start_paused = true)]
    async fn drain_gives_up_after_timeout() {
        let (tx, mut rx, control) = unbounded();
        for i in 0..3 {
            tx.push(i).unwrap();
        }
        control.drain(Duration::from_millis(100)).unwrap();
        // Nobody consumes until the deadline passes.
        control.finished().await;

        // At most the single in-flight head survives.
        let mut rest = Vec::new();
        while let Some(i) = rx.recv().await {
            rest.push(i);
        }
        assert!(rest.len() <= 1);
    }

    #[tokio::test]
    async fn stop_discards_pending() {
        let (tx, mut rx, control) = unbounded();
        for i in 0..1000 {
            tx.push(i).unwrap();
        }
        control.stop().unwrap();
        control.finished().await;

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert!(count < 1000);
        assert!(tx.is_closed());
        // Stopping again is harmless.
        control.stop().unwrap();
        assert_eq!(control.drain(Duration::from_secs(1)), Err(QueueError::Stopped));
    }

    #[tokio::test]
    async fn dropped_consumer_ends_the_task() {
        let (tx, rx, control) = unbounded::<u32>();
        drop(rx);
        control.finished().await;
        assert!(control.is_finished());
        // The push may or may not race the shutdown, but must not block.
        let _ = tx.push(1);
    }
}
