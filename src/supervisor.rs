//! Supervised background tasks and their status registry.
//!
//! Each poll task runs under a supervisor that records its outcome. A task
//! that returns an error or panics terminates alone; its terminal status
//! stays queryable and the service keeps serving last-known-good cached
//! state. No task error ever reaches a synchronous API caller.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::AppError;

/// Per-task status strings, readable via the service status accessor and
/// the `/status` endpoint.
#[derive(Clone, Default)]
pub struct StatusRegistry {
    inner: Arc<RwLock<BTreeMap<String, String>>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, task: &str, status: impl Into<String>) {
        self.inner
            .write()
            .await
            .insert(task.to_string(), status.into());
    }

    pub async fn get(&self, task: &str) -> Option<String> {
        self.inner.read().await.get(task).cloned()
    }

    pub async fn snapshot(&self) -> BTreeMap<String, String> {
        self.inner.read().await.clone()
    }
}

/// Spawn `task` under supervision. The task's return value (or panic) is
/// recorded as its terminal status in the registry.
pub fn supervise<F>(registry: &StatusRegistry, name: &str, task: F)
where
    F: Future<Output = Result<(), AppError>> + Send + 'static,
{
    let registry = registry.clone();
    let name = name.to_string();
    let handle = tokio::spawn(task);

    tokio::spawn(async move {
        registry.set(&name, "running").await;
        match handle.await {
            Ok(Ok(())) => {
                tracing::info!(task = %name, "Task stopped");
                registry.set(&name, "stopped").await;
            }
            Ok(Err(e)) => {
                tracing::error!(task = %name, error = %e, "Task failed");
                registry.set(&name, format!("failed: {}", e)).await;
            }
            Err(join_err) if join_err.is_panic() => {
                tracing::error!(task = %name, "Task panicked");
                registry.set(&name, "panicked").await;
            }
            Err(_) => {
                registry.set(&name, "cancelled").await;
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn wait_for(registry: &StatusRegistry, task: &str, expected: &str) {
        for _ in 0..100 {
            if registry.get(task).await.as_deref() == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "task {} never reached status {:?}, last was {:?}",
            task,
            expected,
            registry.get(task).await
        );
    }

    #[tokio::test]
    async fn test_clean_exit_recorded_as_stopped() {
        let registry = StatusRegistry::new();
        supervise(&registry, "walker", async { Ok(()) });
        wait_for(&registry, "walker", "stopped").await;
    }

    #[tokio::test]
    async fn test_error_recorded_as_terminal_status() {
        let registry = StatusRegistry::new();
        supervise(&registry, "poller", async {
            Err(AppError::Internal("invariant violated".to_string()))
        });
        wait_for(&registry, "poller", "failed: internal error: invariant violated").await;
    }

    #[tokio::test]
    async fn test_panic_recorded_without_taking_down_process() {
        let registry = StatusRegistry::new();
        supervise(&registry, "reconciler", async { panic!("boom") });
        wait_for(&registry, "reconciler", "panicked").await;
    }
}
