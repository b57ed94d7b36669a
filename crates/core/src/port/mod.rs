// Port Layer - Interfaces for queues and external brokers

pub mod manager;
pub mod queue;
pub mod time_provider; // For deterministic testing

// Re-exports
pub use manager::{Manager, ManagerError};
pub use queue::Queue;
pub use time_provider::{SystemTimeProvider, TimeProvider};
