// Panic isolation for worker safety
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::error;

/// Result of a panic-guarded execution
#[derive(Debug)]
pub enum PanicGuardResult<T> {
    /// Execution completed
    Success(T),
    /// Execution panicked
    Panicked(String),
}

/// Drive a future with panic isolation
///
/// A panic inside the future is caught and returned as
/// `PanicGuardResult::Panicked`, so one bad tick cannot kill its worker.
pub async fn execute_guarded_async<F, T>(future: F) -> PanicGuardResult<T>
where
    F: Future<Output = T>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(result) => PanicGuardResult::Success(result),
        Err(panic_info) => {
            let panic_msg = panic_message(panic_info.as_ref());
            error!(panic_msg = %panic_msg, "Worker task panicked");
            PanicGuardResult::Panicked(panic_msg)
        }
    }
}

fn panic_message(panic_info: &(dyn Any + Send)) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panic_is_caught() {
        let result = execute_guarded_async(async {
            tokio::task::yield_now().await;
            panic!("tick exploded");
        })
        .await;

        match result {
            PanicGuardResult::Panicked(msg) => assert_eq!(msg, "tick exploded"),
            PanicGuardResult::Success(()) => panic!("expected a caught panic"),
        }
    }

    #[tokio::test]
    async fn test_success_passes_through() {
        let result = execute_guarded_async(async { 42 }).await;
        assert!(matches!(result, PanicGuardResult::Success(42)));
    }
}
