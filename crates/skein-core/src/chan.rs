//! Bounded queues with close-with-error.
//!
//! A queue is a tokio mpsc channel plus a shared close state. Either end
//! may close it, optionally with a [`StreamError`]:
//! - a producer closing with an error lets the consumer drain what was
//!   already queued, then see the end of the stream and the reason;
//! - a consumer closing with an error makes the next send fail with
//!   that error, which producers treat as end of stream.
//!
//! Dropping every [`Sender`] is a normal close.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::error::StreamError;

struct Shared {
    closed: AtomicBool,
    reason: Mutex<Option<StreamError>>,
    notify: Notify,
}

impl Shared {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Latches the close state. Only the first close records its reason.
    fn close(&self, reason: Option<StreamError>) -> bool {
        let mut slot = self.reason.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        *slot = reason;
        self.closed.store(true, Ordering::Release);
        drop(slot);
        self.notify.notify_waiters();
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn reason(&self) -> Option<StreamError> {
        self.reason.lock().clone()
    }

    fn send_error(&self) -> StreamError {
        self.reason().unwrap_or_else(StreamError::closed)
    }

    async fn wait_closed(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// Creates a queue buffering up to `nbuf` messages (at least one).
pub fn channel<T>(nbuf: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::channel(nbuf.max(1));
    let shared = Arc::new(Shared::new());
    (
        Sender {
            tx,
            shared: shared.clone(),
        },
        Receiver { rx, shared },
    )
}

/// Returns an already closed queue holding `items`.
pub fn preloaded<T>(items: impl IntoIterator<Item = T>) -> Receiver<T> {
    let items: VecDeque<T> = items.into_iter().collect();
    let (tx, rx) = channel(items.len());
    for item in items {
        // Capacity equals the item count, so this cannot fail.
        let _ = tx.tx.try_send(item);
    }
    tx.close();
    rx
}

/// Producing end of a queue.
pub struct Sender<T> {
    tx: mpsc::Sender<T>,
    shared: Arc<Shared>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            shared: self.shared.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sender")
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl<T> Sender<T> {
    /// Sends a message, waiting for room.
    ///
    /// Fails with the close reason once either end closed the queue.
    pub async fn send(&self, msg: T) -> Result<(), StreamError> {
        if self.shared.is_closed() {
            return Err(self.shared.send_error());
        }
        tokio::select! {
            biased;
            _ = self.shared.wait_closed() => Err(self.shared.send_error()),
            r = self.tx.send(msg) => r.map_err(|_| self.shared.send_error()),
        }
    }

    /// Closes the queue normally.
    pub fn close(&self) {
        self.shared.close(None);
    }

    /// Closes the queue with an error. `None` is a normal close.
    pub fn close_with(&self, err: Option<StreamError>) {
        self.shared.close(err);
    }

    /// Returns true once either end closed the queue.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed() || self.tx.is_closed()
    }

    /// Waits until the consumer goes away or the queue is closed.
    pub async fn closed(&self) {
        tokio::select! {
            _ = self.shared.wait_closed() => {}
            _ = self.tx.closed() => {}
        }
    }

    /// Returns the close reason, if any.
    pub fn error(&self) -> Option<StreamError> {
        self.shared.reason()
    }

    /// Returns a handle that can close the queue without keeping it open.
    pub fn closer(&self) -> Closer {
        Closer {
            shared: self.shared.clone(),
        }
    }
}

/// Consuming end of a queue.
pub struct Receiver<T> {
    rx: mpsc::Receiver<T>,
    shared: Arc<Shared>,
}

impl<T> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

impl<T> Receiver<T> {
    /// Receives the next message.
    ///
    /// Returns `None` at the end of the stream; [`Receiver::error`] then
    /// tells a normal end from an error.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            let closed = self.shared.is_closed();
            match self.rx.try_recv() {
                Ok(msg) => return Some(msg),
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) if closed => return None,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }
            tokio::select! {
                biased;
                msg = self.rx.recv() => return msg,
                _ = self.shared.wait_closed() => continue,
            }
        }
    }

    /// Closes the queue from the consuming side.
    ///
    /// Producers see `err` (or a plain "closed") on their next send.
    pub fn close_with(&mut self, err: Option<StreamError>) {
        self.shared.close(err);
        self.rx.close();
    }

    /// Returns the close reason, if any.
    pub fn error(&self) -> Option<StreamError> {
        self.shared.reason()
    }

    /// Returns true once the queue was explicitly closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Returns a handle that can close the queue.
    pub fn closer(&self) -> Closer {
        Closer {
            shared: self.shared.clone(),
        }
    }

    /// Receives everything left and the close reason.
    pub async fn drain(mut self) -> (Vec<T>, Option<StreamError>) {
        let mut out = Vec::new();
        while let Some(msg) = self.recv().await {
            out.push(msg);
        }
        let err = self.error();
        (out, err)
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.shared.close(None);
    }
}

/// Close handle detached from both queue ends.
#[derive(Clone)]
pub struct Closer {
    shared: Arc<Shared>,
}

impl Closer {
    /// Closes the queue with an optional error.
    pub fn close_with(&self, err: Option<StreamError>) -> bool {
        self.shared.close(err)
    }

    /// Returns true once the queue is closed.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Returns the close reason, if any.
    pub fn error(&self) -> Option<StreamError> {
        self.shared.reason()
    }
}

impl std::fmt::Debug for Closer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Closer")
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}
