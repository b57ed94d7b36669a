// Scale directives - periodic pool sizing decisions

use super::StoreInner;
use crate::application::memory_queue::MemoryQueue;
use crate::application::worker::constants::{
    DEFAULT_BACKLOG_PER_WORKER, DEFAULT_IDLE_WINDOW, MIN_WORKERS,
};
use crate::domain::{QueueInfo, ScalingInfo};
use crate::port::{Queue, SystemTimeProvider, TimeProvider};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Decides, per queue and per tick, whether the pool should change size
pub trait ScaleDirective<T>: Send + Sync {
    fn scale(&self, ctx: &ScaleContext<T>);
}

impl<T, F> ScaleDirective<T> for F
where
    F: Fn(&ScaleContext<T>) + Send + Sync,
{
    fn scale(&self, ctx: &ScaleContext<T>) {
        self(ctx)
    }
}

/// One queue's view handed to a directive, with add/remove bound to that queue
pub struct ScaleContext<T> {
    store: Arc<StoreInner<T>>,
    queue: Arc<MemoryQueue<T>>,
}

impl<T: Clone + Send + Sync + 'static> ScaleContext<T> {
    pub fn info(&self) -> QueueInfo {
        self.queue.info()
    }

    pub fn add_worker(&self) -> bool {
        self.store.add_worker(self.queue.id())
    }

    pub fn remove_worker(&self) -> bool {
        self.store.stop_worker(self.queue.id())
    }

    pub fn scaling_info(&self) -> Option<ScalingInfo> {
        self.store.scaling_info(self.queue.id())
    }
}

/// Invoke `directive` once for every queue currently registered
pub(crate) fn run_directive<T: Clone + Send + Sync + 'static>(
    store: &Arc<StoreInner<T>>,
    directive: &dyn ScaleDirective<T>,
) {
    for queue in store.snapshot() {
        let ctx = ScaleContext {
            store: Arc::clone(store),
            queue,
        };
        directive.scale(&ctx);
    }
}

/// Grows the pool while the backlog per worker is high, shrinks it after a quiet spell
pub struct BacklogScaler {
    backlog_per_worker: usize,
    idle_window: Duration,
    clock: Arc<dyn TimeProvider>,
}

impl BacklogScaler {
    pub fn new(backlog_per_worker: usize, idle_window: Duration, clock: Arc<dyn TimeProvider>) -> Self {
        Self {
            backlog_per_worker: backlog_per_worker.max(1),
            idle_window,
            clock,
        }
    }

    fn is_idle(&self, info: &QueueInfo) -> bool {
        match info.last_enqueue {
            None => true,
            Some(last) => {
                let quiet_ms = self.clock.now_millis() - last.timestamp_millis();
                quiet_ms >= self.idle_window.as_millis() as i64
            }
        }
    }
}

impl Default for BacklogScaler {
    fn default() -> Self {
        Self::new(
            DEFAULT_BACKLOG_PER_WORKER,
            DEFAULT_IDLE_WINDOW,
            Arc::new(SystemTimeProvider),
        )
    }
}

impl<T: Clone + Send + Sync + 'static> ScaleDirective<T> for BacklogScaler {
    fn scale(&self, ctx: &ScaleContext<T>) {
        let info = ctx.info();
        let Some(slots) = ctx.scaling_info() else {
            return;
        };

        if info.len > slots.active * self.backlog_per_worker {
            if slots.available > 0 && ctx.add_worker() {
                debug!(queue_id = info.id, backlog = info.len, "Backlog high, scaled up");
            }
            return;
        }

        if info.is_empty() && slots.active > MIN_WORKERS && self.is_idle(&info) {
            if ctx.remove_worker() {
                debug!(queue_id = info.id, "Queue idle, scaled down");
            }
        }
    }
}
