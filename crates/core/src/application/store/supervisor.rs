// Autoscale supervisor
//
// The scale loop runs in its own task. When a directive panics the task dies,
// the supervisor records the restart and starts a fresh loop.

use super::scaling::{run_directive, ScaleDirective};
use super::StoreInner;
use crate::application::worker::{panic_message, ShutdownToken};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

pub(crate) fn spawn<T: Clone + Send + Sync + 'static>(
    store: &Arc<StoreInner<T>>,
    directive: Arc<dyn ScaleDirective<T>>,
    interval: Duration,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(store);
    let stop = store.shutdown.token();

    tokio::spawn(async move {
        loop {
            let run = tokio::spawn(scale_loop(
                weak.clone(),
                Arc::clone(&directive),
                interval,
                stop.clone(),
            ));

            match run.await {
                Ok(()) => break,
                Err(e) if e.is_panic() => {
                    let panic_msg = panic_message(&*e.into_panic());
                    let Some(store) = weak.upgrade() else {
                        break;
                    };
                    let restarts = store.autoscale_restarts.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(
                        restarts,
                        panic_msg = %panic_msg,
                        "Scale directive panicked, restarting autoscale loop"
                    );
                    if stop.is_shutdown() {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = ?e, "Autoscale loop cancelled");
                    break;
                }
            }
        }
        debug!("Autoscaler stopped");
    })
}

async fn scale_loop<T: Clone + Send + Sync + 'static>(
    store: Weak<StoreInner<T>>,
    directive: Arc<dyn ScaleDirective<T>>,
    interval: Duration,
    mut stop: ShutdownToken,
) {
    // First tick one interval out, so a restart never fires back to back
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = stop.wait() => return,
            _ = ticker.tick() => {}
        }

        let Some(store) = store.upgrade() else {
            return;
        };
        run_directive(&store, directive.as_ref());
    }
}
