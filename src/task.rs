//! Detached fire-and-forget tasks
//!
//! Side effects like event publication and ingress notification must never
//! hold open or fail the client-facing response. They run as detached tasks:
//! spawned, not awaited, with failures captured by the logging sink.

use std::future::Future;
use tokio::task::JoinHandle;
use tracing::warn;

/// Spawn a best-effort side task. An `Err` outcome is logged at warn under
/// the given name and otherwise swallowed.
pub fn spawn_detached<F, E>(name: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = future.await {
            warn!(task = name, error = %e, "Detached task failed");
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failure_is_swallowed() {
        let handle = spawn_detached("failing-task", async {
            Err::<(), _>(anyhow::anyhow!("boom"))
        });
        // The join handle resolves Ok: the error never escapes the task
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_success_runs_to_completion() {
        let (tx, rx) = tokio::sync::oneshot::channel::<u32>();
        let handle = spawn_detached("ok-task", async move {
            tx.send(7).map_err(|_| anyhow::anyhow!("receiver dropped"))
        });
        handle.await.unwrap();
        assert_eq!(rx.await.unwrap(), 7);
    }
}
