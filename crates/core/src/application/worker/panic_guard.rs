// Panic isolation for worker safety
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::error;

/// Result of a panic-guarded execution
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Execution completed successfully
    Success(T),
    /// Execution panicked
    Panicked(String),
}

impl<T> PanicGuardResult<T> {
    pub fn is_panicked(&self) -> bool {
        matches!(self, PanicGuardResult::Panicked(_))
    }
}

/// Execute a closure with panic isolation
///
/// If the closure panics, the panic is caught and returned as PanicGuardResult::Panicked.
/// This keeps one bad item from killing the worker that runs it.
///
/// # Example
/// ```text
/// let result = execute_guarded(|| {
///     // This panic will be caught
///     panic!("test panic");
/// });
///
/// match result {
///     PanicGuardResult::Panicked(msg) => {
///         println!("Caught panic: {}", msg);
///     }
///     _ => {}
/// }
/// ```
pub fn execute_guarded<F, T>(f: F) -> PanicGuardResult<T>
where
    F: FnOnce() -> T + std::panic::UnwindSafe,
{
    match catch_unwind(f) {
        Ok(result) => PanicGuardResult::Success(result),
        Err(panic_info) => {
            let panic_msg = panic_message(&*panic_info);
            error!(panic_msg = %panic_msg, "Worker task panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
    }
}

/// Execute a future with panic isolation
///
/// The future is polled in place, so a panic at any await point is caught
/// without spawning a separate task.
pub async fn execute_guarded_async<F, T>(future: F) -> PanicGuardResult<T>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => PanicGuardResult::Success(result),
        Err(panic_info) => {
            let panic_msg = panic_message(&*panic_info);
            error!(panic_msg = %panic_msg, "Async worker task panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
    }
}

/// Best-effort text of a panic payload
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guarded_success() {
        match execute_guarded(|| 2 + 2) {
            PanicGuardResult::Success(v) => assert_eq!(v, 4),
            PanicGuardResult::Panicked(msg) => panic!("unexpected panic: {msg}"),
        }
    }

    #[test]
    fn test_guarded_catches_str_and_string_panics() {
        let result = execute_guarded(|| panic!("static message"));
        match result {
            PanicGuardResult::Panicked(msg) => assert_eq!(msg, "static message"),
            _ => panic!("expected panic"),
        }

        let id = 9;
        let result = execute_guarded(move || panic!("item {id} is corrupt"));
        match result {
            PanicGuardResult::Panicked(msg) => assert_eq!(msg, "item 9 is corrupt"),
            _ => panic!("expected panic"),
        }
    }

    #[tokio::test]
    async fn test_guarded_async_catches_panic_after_await() {
        let result = execute_guarded_async(async {
            tokio::task::yield_now().await;
            if true {
                panic!("boom after yield");
            }
            1
        })
        .await;

        assert!(result.is_panicked());
    }

    #[tokio::test]
    async fn test_guarded_async_success() {
        let result = execute_guarded_async(async { "done" }).await;
        assert!(matches!(result, PanicGuardResult::Success("done")));
    }
}
