// In-process Queue implementation
//
// Items live in a VecDeque behind a std mutex that is never held across an
// await. Consumers park on a Notify: enqueue wakes one, stop wakes all.

use crate::application::worker::{shutdown_channel, ShutdownSender, ShutdownToken};
use crate::domain::QueueId;
use crate::error::QueueError;
use crate::port::time_provider::millis_to_datetime;
use crate::port::{Queue, SystemTimeProvider, TimeProvider};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tracing::debug;

const NEVER: i64 = i64::MIN;

/// Unbounded FIFO queue with drain-before-close cancellation
pub struct MemoryQueue<T> {
    id: QueueId,
    items: Mutex<VecDeque<T>>,
    len: AtomicUsize,
    last_enqueue_ms: AtomicI64,
    available: Notify,
    lifetime: ShutdownSender,
    clock: Arc<dyn TimeProvider>,
}

impl<T: Send + 'static> MemoryQueue<T> {
    pub fn new(id: QueueId) -> Self {
        Self::with_clock(id, Arc::new(SystemTimeProvider))
    }

    pub fn with_clock(id: QueueId, clock: Arc<dyn TimeProvider>) -> Self {
        let (lifetime, _) = shutdown_channel();
        Self {
            id,
            items: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
            last_enqueue_ms: AtomicI64::new(NEVER),
            available: Notify::new(),
            lifetime,
            clock,
        }
    }

    /// Cancel the queue's lifetime and wake every parked consumer
    ///
    /// Pending items stay available to `dequeue` until drained.
    pub fn stop(&self) {
        {
            // Flip under the item lock so no enqueue slips in after the check
            let _items = self.lock_items();
            self.lifetime.shutdown();
        }
        self.available.notify_waiters();
        debug!(queue_id = self.id, pending = self.len(), "Queue stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.lifetime.is_shutdown()
    }

    fn lock_items(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn pop_front(&self) -> Option<T> {
        let mut items = self.lock_items();
        let item = items.pop_front();
        if item.is_some() {
            self.len.store(items.len(), Ordering::Release);
        }
        item
    }
}

#[async_trait]
impl<T: Send + 'static> Queue<T> for MemoryQueue<T> {
    fn enqueue(&self, item: T) -> Result<(), QueueError> {
        {
            let mut items = self.lock_items();
            if self.lifetime.is_shutdown() {
                return Err(QueueError::Closed);
            }
            items.push_back(item);
            self.len.store(items.len(), Ordering::Release);
            self.last_enqueue_ms
                .store(self.clock.now_millis(), Ordering::Release);
        }
        self.available.notify_one();
        Ok(())
    }

    async fn dequeue(&self) -> Result<T, QueueError> {
        loop {
            // Register interest before looking, so a wake between the check
            // and the await is not lost
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.pop_front() {
                return Ok(item);
            }
            if self.lifetime.is_shutdown() {
                return Err(QueueError::Closed);
            }

            notified.await;
        }
    }

    fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    fn last_enqueue_time(&self) -> Option<DateTime<Utc>> {
        match self.last_enqueue_ms.load(Ordering::Acquire) {
            NEVER => None,
            millis => Some(millis_to_datetime(millis)),
        }
    }

    fn id(&self) -> QueueId {
        self.id
    }

    fn context(&self) -> ShutdownToken {
        self.lifetime.token()
    }
}
