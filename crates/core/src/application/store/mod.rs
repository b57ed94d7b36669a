// Store - registry of queues, each with an elastic worker pool

mod scaling;
mod supervisor;

pub use scaling::{BacklogScaler, ScaleContext, ScaleDirective};

use crate::application::memory_queue::MemoryQueue;
use crate::application::worker::constants::{DEFAULT_WORKERS, MIN_WORKERS};
use crate::application::worker::{shutdown_channel, ShutdownSender, Worker, WorkerHandle};
use crate::domain::{QueueId, ScalingInfo};
use crate::error::{AppError, Result};
use crate::port::{Queue, SystemTimeProvider, TimeProvider};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Supplies a fresh Worker whenever the Store needs one
pub type WorkerFactory<T> = Arc<dyn Fn() -> Worker<T> + Send + Sync>;

/// Queue cancellation handle plus the handles of its active workers
struct StopEntry<T> {
    queue: Arc<MemoryQueue<T>>,
    workers: Vec<WorkerHandle>,
}

pub(crate) struct StoreInner<T> {
    // Read-mostly: written only when a queue is created or removed
    queues: RwLock<HashMap<QueueId, Arc<MemoryQueue<T>>>>,
    // Add/stop/scaling_info observe and mutate the worker list as one step
    stops: Mutex<HashMap<QueueId, StopEntry<T>>>,
    factory: WorkerFactory<T>,
    initial_workers: usize,
    max_workers: usize,
    clock: Arc<dyn TimeProvider>,
    autoscale_restarts: AtomicU64,
    shutdown: ShutdownSender,
}

impl<T: Clone + Send + Sync + 'static> StoreInner<T> {
    fn read_queues(&self) -> RwLockReadGuard<'_, HashMap<QueueId, Arc<MemoryQueue<T>>>> {
        self.queues.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_queues(&self) -> RwLockWriteGuard<'_, HashMap<QueueId, Arc<MemoryQueue<T>>>> {
        self.queues.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_stops(&self) -> MutexGuard<'_, HashMap<QueueId, StopEntry<T>>> {
        self.stops.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fixed(&self) -> bool {
        self.initial_workers == self.max_workers
    }

    fn get(&self, id: QueueId) -> Arc<MemoryQueue<T>> {
        if let Some(queue) = self.read_queues().get(&id) {
            return Arc::clone(queue);
        }

        // Check-and-create under the write lock: one queue and one pool per id
        let mut queues = self.write_queues();
        if let Some(queue) = queues.get(&id) {
            return Arc::clone(queue);
        }

        let queue = Arc::new(MemoryQueue::with_clock(id, Arc::clone(&self.clock)));
        if self.shutdown.is_shutdown() {
            warn!(queue_id = id, "Store is shut down, handing out a closed queue");
            queue.stop();
            return queue;
        }

        let workers = (0..self.initial_workers)
            .map(|_| (self.factory)().spawn(Arc::clone(&queue) as Arc<dyn Queue<T>>))
            .collect();
        self.lock_stops().insert(
            id,
            StopEntry {
                queue: Arc::clone(&queue),
                workers,
            },
        );
        queues.insert(id, Arc::clone(&queue));

        info!(queue_id = id, workers = self.initial_workers, "Queue created");
        queue
    }

    fn remove(&self, id: QueueId) -> bool {
        let entry = {
            let mut queues = self.write_queues();
            queues.remove(&id);
            self.lock_stops().remove(&id)
        };

        let Some(entry) = entry else {
            return false;
        };
        entry.queue.stop();
        for worker in &entry.workers {
            worker.stop();
        }
        info!(queue_id = id, workers = entry.workers.len(), "Queue removed");
        true
    }

    fn add_worker(&self, id: QueueId) -> bool {
        if self.is_fixed() {
            return false;
        }

        let mut stops = self.lock_stops();
        let Some(entry) = stops.get_mut(&id) else {
            return false;
        };
        if entry.workers.len() >= self.max_workers {
            return false;
        }

        let worker = (self.factory)().spawn(Arc::clone(&entry.queue) as Arc<dyn Queue<T>>);
        entry.workers.push(worker);
        debug!(queue_id = id, active = entry.workers.len(), "Worker added");
        true
    }

    fn stop_worker(&self, id: QueueId) -> bool {
        if self.is_fixed() {
            return false;
        }

        let mut stops = self.lock_stops();
        let Some(entry) = stops.get_mut(&id) else {
            return false;
        };
        if entry.workers.len() <= MIN_WORKERS {
            return false;
        }

        if let Some(worker) = entry.workers.pop() {
            worker.stop();
        }
        debug!(queue_id = id, active = entry.workers.len(), "Worker stopped");
        true
    }

    fn scaling_info(&self, id: QueueId) -> Option<ScalingInfo> {
        let stops = self.lock_stops();
        stops.get(&id).map(|entry| ScalingInfo {
            available: self.max_workers.saturating_sub(entry.workers.len()),
            active: entry.workers.len(),
        })
    }

    fn snapshot(&self) -> Vec<Arc<MemoryQueue<T>>> {
        self.read_queues().values().cloned().collect()
    }

    /// Detach every queue and cancel its lifetime; workers drain and exit
    fn close_all(&self) -> Vec<StopEntry<T>> {
        self.shutdown.shutdown();

        let entries: Vec<StopEntry<T>> = {
            let mut queues = self.write_queues();
            queues.clear();
            self.lock_stops().drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.queue.stop();
        }
        entries
    }
}

/// Builder for [`Store`]
pub struct StoreBuilder<T> {
    factory: WorkerFactory<T>,
    workers: usize,
    max_workers: Option<usize>,
    autoscale: Option<(Arc<dyn ScaleDirective<T>>, Duration)>,
    clock: Arc<dyn TimeProvider>,
}

impl<T: Clone + Send + Sync + 'static> StoreBuilder<T> {
    /// Initial worker count for every new queue
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Scale-up ceiling; equal to `workers` means a fixed pool
    pub fn max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    /// Run `directive` against every queue each `interval`
    pub fn autoscale(mut self, directive: impl ScaleDirective<T> + 'static, interval: Duration) -> Self {
        self.autoscale = Some((Arc::new(directive), interval));
        self
    }

    pub fn time_provider(mut self, clock: Arc<dyn TimeProvider>) -> Self {
        self.clock = clock;
        self
    }

    /// Validate the configuration and start the autoscaler if one was set
    ///
    /// Must be called from within a tokio runtime when autoscaling is enabled.
    pub fn build(self) -> Result<Store<T>> {
        if self.workers < MIN_WORKERS {
            return Err(AppError::Config(
                "workers must be greater than 0".to_string(),
            ));
        }
        let max_workers = self.max_workers.unwrap_or(self.workers);
        if max_workers < self.workers {
            return Err(AppError::Config(format!(
                "max_workers ({}) must not be below workers ({})",
                max_workers, self.workers
            )));
        }
        if let Some((_, interval)) = &self.autoscale {
            if interval.is_zero() {
                return Err(AppError::Config(
                    "scale interval must be greater than 0".to_string(),
                ));
            }
        }

        let (shutdown, _) = shutdown_channel();
        let inner = Arc::new(StoreInner {
            queues: RwLock::new(HashMap::new()),
            stops: Mutex::new(HashMap::new()),
            factory: self.factory,
            initial_workers: self.workers,
            max_workers,
            clock: self.clock,
            autoscale_restarts: AtomicU64::new(0),
            shutdown,
        });

        let supervisor = self.autoscale.map(|(directive, interval)| {
            if self.workers == max_workers {
                warn!("Autoscale configured on a fixed pool; directives cannot resize it");
            }
            info!(interval_ms = interval.as_millis() as u64, "Autoscaler started");
            supervisor::spawn(&inner, directive, interval)
        });

        Ok(Store {
            inner,
            supervisor: Mutex::new(supervisor),
        })
    }
}

/// Registry of queues keyed by id, each paired with a pool of workers
///
/// Queues are created lazily by [`Store::get`]. The pool of a new queue starts at
/// the configured worker count and can grow up to `max_workers` through
/// [`Store::add_worker`] or an autoscale directive.
pub struct Store<T: Clone + Send + Sync + 'static> {
    inner: Arc<StoreInner<T>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Clone + Send + Sync + 'static> Store<T> {
    pub fn builder(factory: impl Fn() -> Worker<T> + Send + Sync + 'static) -> StoreBuilder<T> {
        StoreBuilder {
            factory: Arc::new(factory),
            workers: DEFAULT_WORKERS,
            max_workers: None,
            autoscale: None,
            clock: Arc::new(SystemTimeProvider),
        }
    }

    /// Queue for `id`, created together with its initial pool on first access
    pub fn get(&self, id: QueueId) -> Arc<dyn Queue<T>> {
        self.inner.get(id)
    }

    /// Cancel the queue and all of its workers, then forget the id
    pub fn remove(&self, id: QueueId) -> bool {
        self.inner.remove(id)
    }

    /// Spawn one more worker for `id`; false on a fixed pool, at the ceiling, or for an unknown id
    pub fn add_worker(&self, id: QueueId) -> bool {
        self.inner.add_worker(id)
    }

    /// Cancel the most recent worker for `id`; never goes below one
    pub fn stop_worker(&self, id: QueueId) -> bool {
        self.inner.stop_worker(id)
    }

    pub fn scaling_info(&self, id: QueueId) -> Option<ScalingInfo> {
        self.inner.scaling_info(id)
    }

    pub fn queue_ids(&self) -> Vec<QueueId> {
        let mut ids: Vec<QueueId> = self.inner.read_queues().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.inner.read_queues().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Times the autoscale loop was restarted after a directive panicked
    pub fn autoscale_restarts(&self) -> u64 {
        self.inner.autoscale_restarts.load(Ordering::SeqCst)
    }

    /// Run `directive` once against every registered queue
    pub fn scale_once(&self, directive: &dyn ScaleDirective<T>) {
        scaling::run_directive(&self.inner, directive);
    }

    /// Stop autoscaling, close every queue and wait for the workers to drain
    pub async fn shutdown(&self) {
        let entries = self.inner.close_all();

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!(error = ?e, "Autoscale supervisor task failed");
            }
        }

        let queues = entries.len();
        for entry in entries {
            for worker in entry.workers {
                worker.join().await;
            }
        }
        info!(queues, "Store shut down");
    }
}

impl<T: Clone + Send + Sync + 'static> Drop for Store<T> {
    fn drop(&mut self) {
        if !self.inner.shutdown.is_shutdown() {
            self.inner.close_all();
        }
    }
}
