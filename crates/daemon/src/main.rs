//! Conveyor - Main Entry Point
//! Feeds jobs from a beanstalkd tube into elastic in-process worker pools

mod config;
mod router;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::{DaemonConfig, LogFormat};
use conveyor_core::application::worker::RecoverFunc;
use conveyor_core::application::{
    processor_fn, BacklogScaler, DurableQueue, DurableQueueConfig, Store, Worker,
};
use conveyor_core::port::{Manager, Queue};
use conveyor_infra_beanstalk::BeanstalkManager;
use router::JobRouter;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const CONSUMER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logging(format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("conveyor=info"))
        .context("Failed to create env filter")?;

    match format {
        LogFormat::Json => {
            // Production: JSON structured logging
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Pretty => {
            // Development: Pretty formatting with colors
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt::layer().pretty())
                .init();
        }
    }
    Ok(())
}

/// Pool member for every Store queue: logs the payload it was handed
fn payload_worker() -> Worker<serde_json::Value> {
    let processor = processor_fn(|payload: serde_json::Value, queue: Arc<dyn Queue<_>>| async move {
        info!(queue_id = queue.id(), payload = %payload, "Processed payload");
        Ok(())
    });
    let recover: RecoverFunc<serde_json::Value> = Arc::new(|_ctx, payload, panic_msg| {
        error!(payload = %payload, panic_msg = %panic_msg, "Processor panicked, payload dropped");
    });
    Worker::new(processor, recover)
}

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load configuration
    let config = DaemonConfig::from_env()?;

    // 2. Initialize logging
    init_logging(config.log_format)?;
    info!("Conveyor v{} starting...", VERSION);

    // 3. Connect to the broker
    info!(addr = %config.beanstalk_addr, tube = %config.tube, "Connecting to beanstalkd...");
    let manager: Arc<dyn Manager> = Arc::new(BeanstalkManager::new(config.beanstalk_addr.clone()));
    let durable = DurableQueue::connect(
        manager,
        DurableQueueConfig {
            poll_timeout: config.poll_timeout,
            ..DurableQueueConfig::new(config.tube.clone())
        },
    )
    .await
    .context("Broker connection failed")?;

    // 4. Build the Store with backlog-driven autoscaling
    let store = Arc::new(
        Store::builder(payload_worker)
            .workers(config.workers)
            .max_workers(config.max_workers)
            .autoscale(BacklogScaler::default(), config.scale_interval)
            .build()
            .context("Invalid Store configuration")?,
    );

    // 5. Start the consumer loop
    info!("Starting consumer...");
    let consumer = {
        let durable = durable.clone();
        let router = Arc::new(JobRouter::new(Arc::clone(&store)));
        tokio::spawn(async move { durable.process(router).await })
    };

    info!("✅ System ready. Waiting for jobs...");
    info!("Press Ctrl+C to shutdown");

    // 6. Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully...");

    // 7. Graceful shutdown: stop pulling, then drain what is already in memory
    durable.shutdown().await;
    if tokio::time::timeout(CONSUMER_DRAIN_TIMEOUT, consumer).await.is_err() {
        warn!("Consumer did not stop in time");
    }
    store.shutdown().await;

    info!("Shutdown complete.");
    Ok(())
}
