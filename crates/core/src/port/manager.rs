// Broker Manager Port (Interface)
//
// A durable, network-attached FIFO broker with one publish channel and one
// consume channel. Each channel can be reconnected independently.

use crate::domain::{Job, JobId};
use async_trait::async_trait;
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManagerError {
    /// Poll found no job within the timeout
    #[error("timed out waiting for a job")]
    Timeout,

    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("channel is not connected")]
    NotConnected,

    /// Application-level refusal by the broker
    #[error("rejected by broker: {0}")]
    Rejected(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Other(Box<dyn StdError + Send + Sync>),
}

impl ManagerError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ManagerError::Timeout)
    }

    /// True when the failure comes from the network layer rather than the broker
    ///
    /// Wrapped errors are unwrapped through their `source()` chain looking for an
    /// `std::io::Error`.
    pub fn is_network(&self) -> bool {
        match self {
            ManagerError::Network(_) | ManagerError::NotConnected => true,
            ManagerError::Other(inner) => {
                let mut current: Option<&(dyn StdError + 'static)> = Some(&**inner);
                while let Some(err) = current {
                    if err.is::<std::io::Error>() {
                        return true;
                    }
                    current = err.source();
                }
                false
            }
            _ => false,
        }
    }
}

/// Broker manager port
#[async_trait]
pub trait Manager: Send + Sync {
    /// Open the publish and consume channels bound to `name`
    async fn create_channels(&self, name: &str) -> Result<(), ManagerError>;

    /// Submit a job on the publish channel, returning the broker's id for it
    async fn put_job(
        &self,
        body: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId, ManagerError>;

    /// Reserve the next job on the consume channel
    ///
    /// Returns `ManagerError::Timeout` when nothing arrived within `timeout`.
    async fn get_job(&self, timeout: Duration) -> Result<Job, ManagerError>;

    /// Acknowledge a reserved job
    async fn delete_job(&self, id: JobId) -> Result<(), ManagerError>;

    async fn close_publish_channel(&self) -> Result<(), ManagerError>;

    async fn close_consume_channel(&self) -> Result<(), ManagerError>;

    async fn reconnect_publish_channel(&self) -> Result<(), ManagerError>;

    async fn reconnect_consume_channel(&self) -> Result<(), ManagerError>;
}

// ============================================================================
// Mock Implementations for Testing
// ============================================================================

pub mod mocks {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Failure a scripted call should produce
    #[derive(Debug, Clone)]
    pub enum MockFailure {
        Network,
        Timeout,
        Rejected(String),
    }

    impl MockFailure {
        pub fn to_error(&self) -> ManagerError {
            match self {
                MockFailure::Network => ManagerError::Network(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    "mock connection reset",
                )),
                MockFailure::Timeout => ManagerError::Timeout,
                MockFailure::Rejected(msg) => ManagerError::Rejected(msg.clone()),
            }
        }
    }

    /// Scripted in-memory broker
    ///
    /// Scripted failures are consumed one per call; once a script is empty calls
    /// succeed. A "forever" failure overrides the script until cleared.
    #[derive(Default)]
    pub struct MockManager {
        put_failures: Mutex<VecDeque<MockFailure>>,
        put_forever: Mutex<Option<MockFailure>>,
        get_script: Mutex<VecDeque<Result<Job, MockFailure>>>,
        delete_failures: Mutex<VecDeque<MockFailure>>,
        published: Mutex<Vec<Vec<u8>>>,
        deleted: Mutex<Vec<JobId>>,
        channel: Mutex<Option<String>>,
        next_id: AtomicUsize,
        put_calls: AtomicUsize,
        get_calls: AtomicUsize,
        delete_calls: AtomicUsize,
        publish_reconnects: AtomicUsize,
        consume_reconnects: AtomicUsize,
        publish_closes: AtomicUsize,
        consume_closes: AtomicUsize,
    }

    impl MockManager {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn fail_puts(&self, failures: impl IntoIterator<Item = MockFailure>) {
            self.put_failures.lock().unwrap().extend(failures);
        }

        pub fn fail_puts_forever(&self, failure: Option<MockFailure>) {
            *self.put_forever.lock().unwrap() = failure;
        }

        pub fn push_job(&self, id: JobId, body: impl Into<Vec<u8>>) {
            self.get_script
                .lock()
                .unwrap()
                .push_back(Ok(Job::new(id, body.into())));
        }

        pub fn fail_gets(&self, failures: impl IntoIterator<Item = MockFailure>) {
            self.get_script
                .lock()
                .unwrap()
                .extend(failures.into_iter().map(Err));
        }

        pub fn fail_deletes(&self, failures: impl IntoIterator<Item = MockFailure>) {
            self.delete_failures.lock().unwrap().extend(failures);
        }

        pub fn published(&self) -> Vec<Vec<u8>> {
            self.published.lock().unwrap().clone()
        }

        pub fn deleted(&self) -> Vec<JobId> {
            self.deleted.lock().unwrap().clone()
        }

        pub fn channel(&self) -> Option<String> {
            self.channel.lock().unwrap().clone()
        }

        pub fn put_calls(&self) -> usize {
            self.put_calls.load(Ordering::SeqCst)
        }

        pub fn get_calls(&self) -> usize {
            self.get_calls.load(Ordering::SeqCst)
        }

        pub fn delete_calls(&self) -> usize {
            self.delete_calls.load(Ordering::SeqCst)
        }

        pub fn publish_reconnects(&self) -> usize {
            self.publish_reconnects.load(Ordering::SeqCst)
        }

        pub fn consume_reconnects(&self) -> usize {
            self.consume_reconnects.load(Ordering::SeqCst)
        }

        pub fn publish_closes(&self) -> usize {
            self.publish_closes.load(Ordering::SeqCst)
        }

        pub fn consume_closes(&self) -> usize {
            self.consume_closes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Manager for MockManager {
        async fn create_channels(&self, name: &str) -> Result<(), ManagerError> {
            *self.channel.lock().unwrap() = Some(name.to_string());
            Ok(())
        }

        async fn put_job(
            &self,
            body: &[u8],
            _priority: u32,
            _delay: Duration,
            _ttr: Duration,
        ) -> Result<JobId, ManagerError> {
            self.put_calls.fetch_add(1, Ordering::SeqCst);

            if let Some(failure) = self.put_forever.lock().unwrap().as_ref() {
                return Err(failure.to_error());
            }
            if let Some(failure) = self.put_failures.lock().unwrap().pop_front() {
                return Err(failure.to_error());
            }

            self.published.lock().unwrap().push(body.to_vec());
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) as JobId + 1)
        }

        async fn get_job(&self, timeout: Duration) -> Result<Job, ManagerError> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);

            let next = self.get_script.lock().unwrap().pop_front();
            match next {
                Some(Ok(job)) => Ok(job),
                Some(Err(failure)) => Err(failure.to_error()),
                None => {
                    // Emulate a broker poll that found nothing
                    tokio::time::sleep(timeout.min(Duration::from_millis(10))).await;
                    Err(ManagerError::Timeout)
                }
            }
        }

        async fn delete_job(&self, id: JobId) -> Result<(), ManagerError> {
            self.delete_calls.fetch_add(1, Ordering::SeqCst);

            if let Some(failure) = self.delete_failures.lock().unwrap().pop_front() {
                return Err(failure.to_error());
            }
            self.deleted.lock().unwrap().push(id);
            Ok(())
        }

        async fn close_publish_channel(&self) -> Result<(), ManagerError> {
            self.publish_closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close_consume_channel(&self) -> Result<(), ManagerError> {
            self.consume_closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reconnect_publish_channel(&self) -> Result<(), ManagerError> {
            self.publish_reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn reconnect_consume_channel(&self) -> Result<(), ManagerError> {
            self.consume_reconnects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }
}
