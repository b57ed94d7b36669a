// Worker - per-queue item processing loop

pub mod constants;
mod panic_guard;
mod shutdown;

pub use panic_guard::{execute_guarded, execute_guarded_async, panic_message, PanicGuardResult};
pub use shutdown::{shutdown_channel, ShutdownSender, ShutdownToken};

use crate::error::Result;
use crate::port::Queue;
use async_trait::async_trait;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Does the actual work for one item
#[async_trait]
pub trait Processor<T: Send + 'static>: Send + Sync {
    async fn process(&self, item: T, queue: Arc<dyn Queue<T>>) -> Result<()>;
}

/// Receives the queue context, the offending item and the panic message
pub type RecoverFunc<T> = Arc<dyn Fn(ShutdownToken, T, String) + Send + Sync>;

/// Runs once when a worker exits
pub type ShutdownCallback = Arc<dyn Fn() + Send + Sync>;

/// Adapter turning an async closure into a Processor
pub struct FnProcessor<F>(F);

#[async_trait]
impl<T, F, Fut> Processor<T> for FnProcessor<F>
where
    T: Send + 'static,
    F: Fn(T, Arc<dyn Queue<T>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn process(&self, item: T, queue: Arc<dyn Queue<T>>) -> Result<()> {
        (self.0)(item, queue).await
    }
}

/// Wrap an async closure as a shareable Processor
pub fn processor_fn<T, F, Fut>(f: F) -> Arc<dyn Processor<T>>
where
    T: Send + 'static,
    F: Fn(T, Arc<dyn Queue<T>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnProcessor(f))
}

/// Worker pulls items from one queue and runs the Processor on each
///
/// A panic inside the Processor is caught and handed to the RecoverFunc; the
/// loop then moves on to the next item. The worker exits when its queue is
/// closed and drained, or when its own stop handle fires.
pub struct Worker<T> {
    processor: Arc<dyn Processor<T>>,
    recover: RecoverFunc<T>,
    on_shutdown: Vec<ShutdownCallback>,
}

impl<T> Clone for Worker<T> {
    fn clone(&self) -> Self {
        Self {
            processor: Arc::clone(&self.processor),
            recover: Arc::clone(&self.recover),
            on_shutdown: self.on_shutdown.clone(),
        }
    }
}

impl<T: Clone + Send + Sync + 'static> Worker<T> {
    pub fn new(processor: Arc<dyn Processor<T>>, recover: RecoverFunc<T>) -> Self {
        Self {
            processor,
            recover,
            on_shutdown: Vec::new(),
        }
    }

    /// Register a callback run when the loop terminates
    pub fn on_shutdown(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_shutdown.push(Arc::new(callback));
        self
    }

    /// Start the loop on the tokio runtime
    pub fn spawn(self, queue: Arc<dyn Queue<T>>) -> WorkerHandle {
        let (stop, token) = shutdown_channel();
        let join = tokio::spawn(async move { self.run(queue, token).await });
        WorkerHandle { stop, join }
    }

    /// Run worker loop until the queue closes or `stop` fires
    pub async fn run(&self, queue: Arc<dyn Queue<T>>, mut stop: ShutdownToken) {
        let queue_id = queue.id();
        debug!(queue_id, "Worker started");

        loop {
            let item = tokio::select! {
                biased;
                _ = stop.wait() => {
                    debug!(queue_id, "Worker cancelled");
                    break;
                }
                next = queue.dequeue() => match next {
                    Ok(item) => item,
                    Err(e) => {
                        debug!(queue_id, reason = %e, "Queue drained, worker exiting");
                        break;
                    }
                },
            };

            self.process_item(&queue, item).await;
        }

        for callback in &self.on_shutdown {
            callback();
        }
        debug!(queue_id, "Worker stopped");
    }

    async fn process_item(&self, queue: &Arc<dyn Queue<T>>, item: T) {
        let outcome =
            execute_guarded_async(self.processor.process(item.clone(), Arc::clone(queue))).await;

        match outcome {
            PanicGuardResult::Success(Ok(())) => {}
            PanicGuardResult::Success(Err(e)) => {
                warn!(queue_id = queue.id(), error = %e, "Processor returned an error");
            }
            PanicGuardResult::Panicked(panic_msg) => {
                let ctx = queue.context();
                let recover = Arc::clone(&self.recover);
                // A panicking recover handler must not take the loop down either
                let guarded = execute_guarded(AssertUnwindSafe(move || {
                    recover(ctx, item, panic_msg);
                }));
                if guarded.is_panicked() {
                    error!(queue_id = queue.id(), "Recover handler panicked");
                }
            }
        }
    }
}

/// Cancellation and join handle of a spawned worker
#[derive(Debug)]
pub struct WorkerHandle {
    stop: ShutdownSender,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Ask the worker to exit after its current item
    pub fn stop(&self) {
        self.stop.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to end
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(error = ?e, "Worker task failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::MemoryQueue;
    use crate::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn recorder() -> (RecoverFunc<u32>, Arc<Mutex<Vec<(u32, String)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let recover: RecoverFunc<u32> = Arc::new(move |_ctx, item, msg| {
            sink.lock().unwrap().push((item, msg));
        });
        (recover, seen)
    }

    #[tokio::test]
    async fn test_worker_survives_panicking_item() {
        let processed = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&processed);
        let processor = processor_fn(move |item: u32, _queue| {
            let log = Arc::clone(&log);
            async move {
                if item == 3 {
                    panic!("item 3 is corrupt");
                }
                log.lock().unwrap().push(item);
                Ok(())
            }
        });
        let (recover, recovered) = recorder();

        let queue = Arc::new(MemoryQueue::new(1));
        for i in 1..=5 {
            queue.enqueue(i).unwrap();
        }
        queue.stop();

        let handle = Worker::new(processor, recover).spawn(queue.clone());
        tokio::time::timeout(Duration::from_secs(2), handle.join())
            .await
            .expect("worker should exit once the queue is drained");

        assert_eq!(*processed.lock().unwrap(), vec![1, 2, 4, 5]);
        let recovered = recovered.lock().unwrap();
        assert_eq!(recovered.len(), 1);
        assert_eq!(recovered[0].0, 3);
        assert!(recovered[0].1.contains("corrupt"));
    }

    #[tokio::test]
    async fn test_processor_error_does_not_stop_loop() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let processor = processor_fn(move |item: u32, _queue| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if item % 2 == 0 {
                    return Err(AppError::Processing(format!("even item {item}")));
                }
                Ok(())
            }
        });
        let (recover, recovered) = recorder();

        let queue = Arc::new(MemoryQueue::new(1));
        for i in 0..6 {
            queue.enqueue(i).unwrap();
        }
        queue.stop();

        Worker::new(processor, recover).spawn(queue).join().await;

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(recovered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_callbacks_run_on_close() {
        let fired = Arc::new(AtomicUsize::new(0));
        let a = Arc::clone(&fired);
        let b = Arc::clone(&fired);
        let (recover, _) = recorder();

        let worker = Worker::new(processor_fn(|_item: u32, _queue| async { Ok(()) }), recover)
            .on_shutdown(move || {
                a.fetch_add(1, Ordering::SeqCst);
            })
            .on_shutdown(move || {
                b.fetch_add(10, Ordering::SeqCst);
            });

        let queue: Arc<MemoryQueue<u32>> = Arc::new(MemoryQueue::new(1));
        let handle = worker.spawn(queue.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        queue.stop();
        handle.join().await;
        assert_eq!(fired.load(Ordering::SeqCst), 11);
    }

    #[tokio::test]
    async fn test_stop_handle_ends_parked_worker() {
        let (recover, _) = recorder();
        let worker = Worker::new(processor_fn(|_item: u32, _queue| async { Ok(()) }), recover);

        let queue: Arc<MemoryQueue<u32>> = Arc::new(MemoryQueue::new(1));
        let handle = worker.spawn(queue.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!handle.is_finished());

        handle.stop();
        tokio::time::timeout(Duration::from_secs(1), handle.join())
            .await
            .expect("stopped worker should exit while parked");

        // The queue itself is still open
        assert!(queue.enqueue(1).is_ok());
    }

    #[tokio::test]
    async fn test_processor_can_requeue_through_handle() {
        let (recover, _) = recorder();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        let processor = processor_fn(move |item: u32, queue: Arc<dyn Queue<u32>>| {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(item);
                if item < 3 {
                    queue.enqueue(item + 1)?;
                }
                Ok::<(), AppError>(())
            }
        });

        let queue = Arc::new(MemoryQueue::new(1));
        queue.enqueue(0).unwrap();
        let handle = Worker::new(processor, recover).spawn(queue.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.stop();
        handle.join().await;

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
