// Job router - moves broker jobs into in-process Store queues

use async_trait::async_trait;
use conveyor_core::application::{Acknowledger, JobHandler, Store};
use conveyor_core::domain::{Job, QueueId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// Wire shape of every job on the tube
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub queue: QueueId,
    pub payload: serde_json::Value,
}

/// Enqueues each job's payload on the Store queue named by its envelope
///
/// A job is acknowledged once its payload is in memory. Jobs whose body is not
/// an envelope are acknowledged and dropped, since redelivery cannot fix them.
pub struct JobRouter {
    store: Arc<Store<serde_json::Value>>,
}

impl JobRouter {
    pub fn new(store: Arc<Store<serde_json::Value>>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl JobHandler for JobRouter {
    async fn handle(&self, job: Job, ack: Acknowledger) {
        let envelope: Envelope = match job.decode() {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(job_id = job.id, error = %e, "Dropping job with malformed envelope");
                if let Err(e) = ack.finish().await {
                    warn!(job_id = job.id, error = %e, "Failed to acknowledge malformed job");
                }
                return;
            }
        };

        let queue = self.store.get(envelope.queue);
        if let Err(e) = queue.enqueue(envelope.payload) {
            // Left reserved: the broker hands it out again after its TTR
            warn!(job_id = job.id, queue_id = envelope.queue, error = %e, "Queue refused job");
            return;
        }

        match ack.finish().await {
            Ok(()) => debug!(job_id = job.id, queue_id = envelope.queue, "Job routed"),
            Err(e) => warn!(job_id = job.id, error = %e, "Failed to acknowledge routed job"),
        }
    }
}
