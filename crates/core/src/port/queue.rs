// Queue Port (Interface)

use crate::application::worker::ShutdownToken;
use crate::domain::{QueueId, QueueInfo};
use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// FIFO holding area consumed by workers
///
/// Everything except `dequeue` is non-blocking.
#[async_trait]
pub trait Queue<T: Send + 'static>: Send + Sync {
    /// Append an item; `QueueError::Closed` once the queue's lifetime has ended
    fn enqueue(&self, item: T) -> Result<(), QueueError>;

    /// Wait for the next item
    ///
    /// Pending items are still handed out after cancellation. `QueueError::Closed`
    /// is returned only when the queue is both cancelled and empty.
    async fn dequeue(&self) -> Result<T, QueueError>;

    /// Number of pending items
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time of the last successful enqueue, `None` if nothing was ever enqueued
    fn last_enqueue_time(&self) -> Option<DateTime<Utc>>;

    fn id(&self) -> QueueId;

    /// The queue's lifetime signal
    fn context(&self) -> ShutdownToken;

    fn info(&self) -> QueueInfo {
        QueueInfo {
            id: self.id(),
            len: self.len(),
            last_enqueue: self.last_enqueue_time(),
            closed: self.context().is_shutdown(),
        }
    }
}
