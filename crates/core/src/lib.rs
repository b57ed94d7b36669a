// Conveyor Core - Queues, Workers & Ports
// NO infrastructure dependencies: broker adapters implement port::Manager elsewhere

pub mod application;
pub mod domain;
pub mod error;
pub mod port;

pub use error::{AppError, QueueError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
