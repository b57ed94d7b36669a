// Conveyor Infrastructure - beanstalkd Adapter
// Implements: Manager (publish channel = `use`, consume channel = `watch`)

mod connection;
mod manager;
pub mod mocks;

pub use connection::DEFAULT_MAX_JOB_SIZE;
pub use manager::BeanstalkManager;
