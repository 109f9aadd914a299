use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures_util::FutureExt;

/// Runs a fire-and-forget task on the runtime with a failure trap at its
/// root: a panic inside the task is logged and swallowed instead of being
/// silently dropped with the join handle.
pub(crate) fn spawn_supervised<F>(label: &'static str, task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(task).catch_unwind().await {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            tracing::error!(task = label, "background task panicked: {message}");
        }
    });
}
