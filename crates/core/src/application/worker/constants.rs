// Queue subsystem constants (no magic values)
use std::time::Duration;

/// A pool never shrinks below one worker
pub const MIN_WORKERS: usize = 1;

/// Default initial worker count per queue
pub const DEFAULT_WORKERS: usize = 1;

/// Default autoscale tick (1s)
pub const DEFAULT_SCALE_INTERVAL: Duration = Duration::from_secs(1);

/// How long one broker poll waits for a job (1s)
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// First reconnect backoff step (100ms)
pub const DEFAULT_RECONNECT_BASE_DELAY: Duration = Duration::from_millis(100);

/// Backoff ceiling between reconnect attempts (5s)
pub const DEFAULT_RECONNECT_MAX_DELAY: Duration = Duration::from_secs(5);

/// Attempts before a put or ack gives up on an unreachable broker
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 20;

/// Backlog per active worker above which BacklogScaler adds a worker
pub const DEFAULT_BACKLOG_PER_WORKER: usize = 10;

/// Quiet period after which BacklogScaler retires a worker (30s)
pub const DEFAULT_IDLE_WINDOW: Duration = Duration::from_secs(30);
