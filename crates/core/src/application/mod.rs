// Application Layer - Queues, Workers and the Store registry

pub mod durable;
pub mod memory_queue;
pub mod store;
pub mod worker;

// Re-exports
pub use durable::{
    handler_fn, Acknowledger, DurableQueue, DurableQueueConfig, JobHandler, ReconnectPolicy,
};
pub use memory_queue::MemoryQueue;
pub use store::{BacklogScaler, ScaleContext, ScaleDirective, Store, StoreBuilder};
pub use worker::{
    processor_fn, shutdown_channel, Processor, ShutdownSender, ShutdownToken, Worker, WorkerHandle,
};
