// Domain Layer - Plain data shared by queues, stores and brokers

pub mod job;
pub mod queue;

// Re-exports
pub use job::{Job, JobId, PutOptions};
pub use queue::{QueueId, QueueInfo, ScalingInfo};
