// Durable Queue - broker-backed queue with reconnect and explicit acknowledgement

mod retry;

pub use retry::{ReconnectPolicy, RetryDecision};

use crate::application::worker::constants::DEFAULT_POLL_TIMEOUT;
use crate::application::worker::{shutdown_channel, ShutdownSender};
use crate::domain::{Job, JobId, PutOptions};
use crate::error::QueueError;
use crate::port::{Manager, ManagerError};
use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Durable queue configuration
#[derive(Debug, Clone)]
pub struct DurableQueueConfig {
    /// Channel (tube) name on the broker
    pub name: String,
    /// How long one `get_job` poll waits
    pub poll_timeout: Duration,
    pub reconnect: ReconnectPolicy,
    /// Used by `put`
    pub put_options: PutOptions,
}

impl DurableQueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
            put_options: PutOptions::default(),
        }
    }
}

/// Consumes jobs delivered by [`DurableQueue::process`]
///
/// The job stays reserved on the broker until `ack.finish()` succeeds.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: Job, ack: Acknowledger);
}

/// Adapter turning an async closure into a JobHandler
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job, Acknowledger) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send,
{
    async fn handle(&self, job: Job, ack: Acknowledger) {
        (self.0)(job, ack).await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn JobHandler>
where
    F: Fn(Job, Acknowledger) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Explicit acknowledgement for one reserved job
pub struct Acknowledger {
    queue: Arc<DurableInner>,
    id: JobId,
}

impl Acknowledger {
    pub fn job_id(&self) -> JobId {
        self.id
    }

    /// Delete the job on the broker, reconnecting the consume side if needed
    pub async fn finish(self) -> Result<(), QueueError> {
        self.queue.finish_job(self.id).await
    }
}

struct DurableInner {
    manager: Arc<dyn Manager>,
    config: DurableQueueConfig,
    stopped: AtomicBool,
    shutdown: ShutdownSender,
    // Serializes publish-side reconnects
    publish_lock: Mutex<()>,
    publish_generation: AtomicU64,
    // Readers: polls and acks. Writer: consume-side reconnect
    consume_lock: RwLock<()>,
    consume_generation: AtomicU64,
}

impl DurableInner {
    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Sleep for `delay` unless shutdown comes first
    async fn pause(&self, delay: Duration) -> Result<(), QueueError> {
        let mut stop = self.shutdown.token();
        tokio::select! {
            biased;
            _ = stop.wait() => Err(QueueError::Stopped),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    async fn put_body(&self, body: &[u8], opts: PutOptions) -> Result<JobId, QueueError> {
        let mut failures = 0u32;
        loop {
            let generation = self.publish_generation.load(Ordering::SeqCst);
            let err = match self
                .manager
                .put_job(body, opts.priority, opts.delay, opts.ttr)
                .await
            {
                Ok(id) => return Ok(id),
                Err(e) => e,
            };

            if !err.is_network() {
                return Err(err.into());
            }
            if self.is_stopped() {
                return Err(QueueError::Stopped);
            }

            failures += 1;
            let delay = match self.config.reconnect.should_retry(failures) {
                RetryDecision::Retry(delay) => delay,
                RetryDecision::Failed => {
                    error!(
                        channel = %self.config.name,
                        attempts = failures,
                        error = %err,
                        "Giving up on put"
                    );
                    return Err(QueueError::RetriesExhausted {
                        attempts: failures,
                        source: err,
                    });
                }
            };
            warn!(
                channel = %self.config.name,
                attempt = failures,
                error = %err,
                "Put hit a network error, reconnecting publish channel"
            );

            self.pause(delay).await?;
            self.reconnect_publish(generation).await?;
        }
    }

    async fn reconnect_publish(&self, seen_generation: u64) -> Result<(), QueueError> {
        let _guard = self.publish_lock.lock().await;
        if self.is_stopped() {
            return Err(QueueError::Stopped);
        }
        // Someone else already reconnected while we waited for the lock
        if self.publish_generation.load(Ordering::SeqCst) != seen_generation {
            return Ok(());
        }

        match self.manager.reconnect_publish_channel().await {
            Ok(()) => info!(channel = %self.config.name, "Publish channel reconnected"),
            Err(e) => warn!(channel = %self.config.name, error = %e, "Publish reconnect failed"),
        }
        self.publish_generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn reconnect_consume(&self, seen_generation: u64) -> Result<(), QueueError> {
        let _guard = self.consume_lock.write().await;
        if self.is_stopped() {
            return Err(QueueError::Stopped);
        }
        if self.consume_generation.load(Ordering::SeqCst) != seen_generation {
            return Ok(());
        }

        match self.manager.reconnect_consume_channel().await {
            Ok(()) => info!(channel = %self.config.name, "Consume channel reconnected"),
            Err(e) => warn!(channel = %self.config.name, error = %e, "Consume reconnect failed"),
        }
        self.consume_generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_job(&self) -> Result<Job, ManagerError> {
        let _guard = self.consume_lock.read().await;
        self.manager.get_job(self.config.poll_timeout).await
    }

    async fn finish_job(&self, id: JobId) -> Result<(), QueueError> {
        let mut failures = 0u32;
        loop {
            let generation = self.consume_generation.load(Ordering::SeqCst);
            let result = {
                let _guard = self.consume_lock.read().await;
                self.manager.delete_job(id).await
            };
            let err = match result {
                Ok(()) => {
                    debug!(job_id = id, "Job acknowledged");
                    return Ok(());
                }
                Err(e) => e,
            };

            if !err.is_network() {
                return Err(err.into());
            }
            if self.is_stopped() {
                return Err(QueueError::Stopped);
            }

            failures += 1;
            let delay = match self.config.reconnect.should_retry(failures) {
                RetryDecision::Retry(delay) => delay,
                RetryDecision::Failed => {
                    return Err(QueueError::RetriesExhausted {
                        attempts: failures,
                        source: err,
                    })
                }
            };
            warn!(job_id = id, error = %err, "Ack hit a network error, reconnecting consume channel");

            self.pause(delay).await?;
            self.reconnect_consume(generation).await?;
        }
    }
}

/// Broker-backed queue that survives disconnects
///
/// Producers call [`put`](Self::put); one consumer loop runs
/// [`process`](Self::process). Network failures are retried with reconnects
/// until [`shutdown`](Self::shutdown), after which they surface as
/// `QueueError::Stopped`.
#[derive(Clone)]
pub struct DurableQueue {
    inner: Arc<DurableInner>,
}

impl DurableQueue {
    /// Wrap a manager whose channels are already open
    pub fn new(manager: Arc<dyn Manager>, config: DurableQueueConfig) -> Self {
        let (shutdown, _) = shutdown_channel();
        Self {
            inner: Arc::new(DurableInner {
                manager,
                config,
                stopped: AtomicBool::new(false),
                shutdown,
                publish_lock: Mutex::new(()),
                publish_generation: AtomicU64::new(0),
                consume_lock: RwLock::new(()),
                consume_generation: AtomicU64::new(0),
            }),
        }
    }

    /// Open the manager's channels for `config.name`, then wrap it
    pub async fn connect(
        manager: Arc<dyn Manager>,
        config: DurableQueueConfig,
    ) -> Result<Self, QueueError> {
        manager.create_channels(&config.name).await?;
        info!(channel = %config.name, "Durable queue connected");
        Ok(Self::new(manager, config))
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Serialize `value` as JSON and submit it with the configured options
    pub async fn put<V: Serialize + ?Sized>(&self, value: &V) -> Result<JobId, QueueError> {
        self.put_with(value, self.inner.config.put_options).await
    }

    pub async fn put_with<V: Serialize + ?Sized>(
        &self,
        value: &V,
        opts: PutOptions,
    ) -> Result<JobId, QueueError> {
        let body = serde_json::to_vec(value)?;
        let id = self.inner.put_body(&body, opts).await?;
        debug!(channel = %self.inner.config.name, job_id = id, "Job submitted");
        Ok(id)
    }

    /// Poll the broker and hand every job to `handler` on its own task
    ///
    /// Returns after shutdown, once in-flight handlers have finished.
    pub async fn process(&self, handler: Arc<dyn JobHandler>) {
        let inner = &self.inner;
        let mut stop = inner.shutdown.token();
        let mut in_flight = JoinSet::new();
        let mut failures = 0u32;

        info!(channel = %inner.config.name, "Consumer loop started");

        loop {
            while let Some(done) = in_flight.try_join_next() {
                log_handler_exit(done);
            }
            if inner.is_stopped() {
                break;
            }

            let generation = inner.consume_generation.load(Ordering::SeqCst);
            let polled = tokio::select! {
                biased;
                _ = stop.wait() => break,
                polled = inner.get_job() => polled,
            };

            match polled {
                Ok(job) => {
                    failures = 0;
                    debug!(job_id = job.id, bytes = job.body.len(), "Job reserved");
                    let ack = Acknowledger {
                        queue: Arc::clone(inner),
                        id: job.id,
                    };
                    let handler = Arc::clone(&handler);
                    in_flight.spawn(async move { handler.handle(job, ack).await });
                }
                Err(e) if e.is_timeout() => {
                    // An empty poll proves the channel healthy
                    failures = 0;
                }
                Err(e) => {
                    if inner.is_stopped() {
                        break;
                    }
                    failures = failures.saturating_add(1);
                    warn!(
                        channel = %inner.config.name,
                        failures,
                        error = %e,
                        "Poll failed, reconnecting consume channel"
                    );
                    let delay = inner.config.reconnect.delay_for(failures - 1);
                    if inner.pause(delay).await.is_err() {
                        break;
                    }
                    if inner.reconnect_consume(generation).await.is_err() {
                        break;
                    }
                }
            }
        }

        while let Some(done) = in_flight.join_next().await {
            log_handler_exit(done);
        }
        info!(channel = %inner.config.name, "Consumer loop stopped");
    }

    /// Stop retrying, wake the consumer loop and close both channels
    pub async fn shutdown(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.shutdown();

        if let Err(e) = self.inner.manager.close_publish_channel().await {
            warn!(error = %e, "Closing publish channel failed");
        }
        if let Err(e) = self.inner.manager.close_consume_channel().await {
            warn!(error = %e, "Closing consume channel failed");
        }
        info!(channel = %self.inner.config.name, "Durable queue shut down");
    }
}

fn log_handler_exit(done: Result<(), tokio::task::JoinError>) {
    if let Err(e) = done {
        if e.is_panic() {
            error!(error = ?e, "Job handler panicked; job left for redelivery");
        }
    }
}
