// BeanstalkManager - Manager port over two beanstalkd connections
//
// The publish connection `use`s the tube; the consume connection `watch`es it.
// A job must be deleted on the connection that reserved it, so acks share the
// consume socket with polls.

use crate::connection::{validate_tube, Connection, DEFAULT_MAX_JOB_SIZE};
use async_trait::async_trait;
use conveyor_core::domain::{Job, JobId};
use conveyor_core::port::{Manager, ManagerError};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const DEFAULT_TUBE: &str = "default";

pub struct BeanstalkManager {
    addr: String,
    max_job_size: usize,
    tube: RwLock<Option<String>>,
    publish: Mutex<Option<Connection>>,
    consume: Mutex<Option<Connection>>,
}

impl BeanstalkManager {
    /// Nothing is dialed until `create_channels`
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            max_job_size: DEFAULT_MAX_JOB_SIZE,
            tube: RwLock::new(None),
            publish: Mutex::new(None),
            consume: Mutex::new(None),
        }
    }

    /// Reject reserved jobs whose body is larger than `bytes`
    ///
    /// Match the server's `-z` setting when it differs from the default.
    pub fn with_max_job_size(mut self, bytes: usize) -> Self {
        self.max_job_size = bytes;
        self
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn tube(&self) -> Option<String> {
        self.tube
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn bound_tube(&self) -> Result<String, ManagerError> {
        self.tube().ok_or(ManagerError::NotConnected)
    }

    async fn dial_publish(&self, tube: &str) -> Result<Connection, ManagerError> {
        let mut conn = Connection::dial(&self.addr).await?;
        conn.use_tube(tube).await?;
        Ok(conn)
    }

    async fn dial_consume(&self, tube: &str) -> Result<Connection, ManagerError> {
        let mut conn = Connection::dial(&self.addr)
            .await?
            .with_max_body(self.max_job_size);
        conn.watch(tube).await?;
        if tube != DEFAULT_TUBE {
            conn.ignore(DEFAULT_TUBE).await?;
        }
        Ok(conn)
    }
}

/// Forget a connection once it has failed at the socket level or lost framing
fn drop_if_broken<T>(slot: &mut Option<Connection>, result: &Result<T, ManagerError>) {
    if let Err(e) = result {
        if e.is_network() || matches!(e, ManagerError::Protocol(_)) {
            *slot = None;
        }
    }
}

#[async_trait]
impl Manager for BeanstalkManager {
    async fn create_channels(&self, name: &str) -> Result<(), ManagerError> {
        validate_tube(name)?;

        let publish = self.dial_publish(name).await?;
        let consume = self.dial_consume(name).await?;

        *self.publish.lock().await = Some(publish);
        *self.consume.lock().await = Some(consume);
        *self.tube.write().unwrap_or_else(PoisonError::into_inner) = Some(name.to_string());

        info!(addr = %self.addr, tube = %name, "Connected to beanstalkd");
        Ok(())
    }

    async fn put_job(
        &self,
        body: &[u8],
        priority: u32,
        delay: Duration,
        ttr: Duration,
    ) -> Result<JobId, ManagerError> {
        let mut slot = self.publish.lock().await;
        let conn = slot.as_mut().ok_or(ManagerError::NotConnected)?;

        let result = conn.put(body, priority, delay, ttr).await;
        drop_if_broken(&mut slot, &result);
        result
    }

    async fn get_job(&self, timeout: Duration) -> Result<Job, ManagerError> {
        let mut slot = self.consume.lock().await;
        let conn = slot.as_mut().ok_or(ManagerError::NotConnected)?;

        let result = conn.reserve(timeout).await;
        drop_if_broken(&mut slot, &result);
        result
    }

    async fn delete_job(&self, id: JobId) -> Result<(), ManagerError> {
        let mut slot = self.consume.lock().await;
        let conn = slot.as_mut().ok_or(ManagerError::NotConnected)?;

        let result = conn.delete(id).await;
        drop_if_broken(&mut slot, &result);
        result
    }

    async fn close_publish_channel(&self) -> Result<(), ManagerError> {
        match self.publish.lock().await.take() {
            Some(conn) => conn.quit().await,
            None => Ok(()),
        }
    }

    async fn close_consume_channel(&self) -> Result<(), ManagerError> {
        match self.consume.lock().await.take() {
            Some(conn) => conn.quit().await,
            None => Ok(()),
        }
    }

    async fn reconnect_publish_channel(&self) -> Result<(), ManagerError> {
        let tube = self.bound_tube()?;
        let mut slot = self.publish.lock().await;
        if let Some(old) = slot.take() {
            if let Err(e) = old.quit().await {
                debug!(error = %e, "Old publish connection already gone");
            }
        }

        match self.dial_publish(&tube).await {
            Ok(conn) => {
                *slot = Some(conn);
                debug!(tube = %tube, "Publish connection re-established");
                Ok(())
            }
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "Publish redial failed");
                Err(e)
            }
        }
    }

    async fn reconnect_consume_channel(&self) -> Result<(), ManagerError> {
        let tube = self.bound_tube()?;
        let mut slot = self.consume.lock().await;
        if let Some(old) = slot.take() {
            if let Err(e) = old.quit().await {
                debug!(error = %e, "Old consume connection already gone");
            }
        }

        match self.dial_consume(&tube).await {
            Ok(conn) => {
                *slot = Some(conn);
                debug!(tube = %tube, "Consume connection re-established");
                Ok(())
            }
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "Consume redial failed");
                Err(e)
            }
        }
    }
}
