use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::error::QueueError;

/// Producer side of a session's bounded outbound queue.
///
/// Clones share one sender, so [`OutboundQueue::close`] ends the stream for
/// every producer at once. The write pump sees the end only after it has
/// drained what was already queued.
#[derive(Debug, Clone)]
pub struct OutboundQueue {
    sender: Arc<Mutex<Option<mpsc::Sender<Vec<u8>>>>>,
    capacity: usize,
}

impl OutboundQueue {
    /// Creates a queue holding at most `capacity` pending payloads.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            sender: Arc::new(Mutex::new(Some(tx))),
            capacity,
        };
        (queue, rx)
    }

    fn lock(&self) -> MutexGuard<'_, Option<mpsc::Sender<Vec<u8>>>> {
        self.sender.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sender(&self) -> Result<mpsc::Sender<Vec<u8>>, QueueError> {
        self.lock().clone().ok_or(QueueError::Closed)
    }

    /// Enqueues without waiting. A full queue rejects the payload.
    pub fn try_send(&self, payload: impl Into<Vec<u8>>) -> Result<(), QueueError> {
        let guard = self.lock();
        let sender = guard.as_ref().ok_or(QueueError::Closed)?;
        sender.try_send(payload.into()).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }

    /// Enqueues, waiting for room if the queue is full.
    pub async fn send(&self, payload: impl Into<Vec<u8>>) -> Result<(), QueueError> {
        let sender = self.sender()?;
        sender
            .send(payload.into())
            .await
            .map_err(|_| QueueError::Closed)
    }

    /// Signals that nothing more will be produced. Returns false if the queue
    /// was already closed.
    pub fn close(&self) -> bool {
        self.lock().take().is_some()
    }

    /// True once the queue was closed or its session has ended.
    pub fn is_closed(&self) -> bool {
        match self.lock().as_ref() {
            Some(sender) => sender.is_closed(),
            None => true,
        }
    }

    /// Number of payloads waiting for the write pump.
    pub fn pending(&self) -> usize {
        match self.lock().as_ref() {
            Some(sender) => sender.max_capacity() - sender.capacity(),
            None => 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
