//! Lifecycle of the daemon's background services.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{error, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Grace period a service gets to release its fans after cancellation.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Spawns named services and stops them together.
///
/// Every task receives a child of one global [`CancellationToken`]; shutdown
/// cancels it and waits for each task so the control loop can hand GPU fans
/// back to the driver before the process exits.
pub struct TaskManager {
    tasks: HashMap<String, JoinHandle<Result<()>>>,
    pub global_token: CancellationToken,
}

impl TaskManager {
    pub fn new() -> Self {
        Self {
            tasks: HashMap::new(),
            global_token: CancellationToken::new(),
        }
    }

    /// Spawns `task_fn` under `name`.
    ///
    /// A task with the same name is replaced; the old one keeps running until
    /// global shutdown.
    pub async fn spawn_task<F, Fut>(&mut self, name: String, task_fn: F) -> Result<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        let token = self.global_token.child_token();
        let task_name = name.clone();

        let handle = tokio::spawn(async move {
            info!("Starting task: {task_name}");
            let result = task_fn(token).await;
            match &result {
                Ok(()) => info!("Task '{task_name}' completed"),
                Err(e) => error!("Task '{task_name}' failed: {e:#}"),
            }
            result
        });

        if self.tasks.insert(name.clone(), handle).is_some() {
            warn!("Task '{name}' was already registered");
        }
        info!("Task '{name}' spawned");
        Ok(())
    }

    /// Cancels every task and waits for them.
    ///
    /// Returns the first failure, if any; all tasks are awaited regardless.
    pub async fn shutdown_all(&mut self) -> Result<()> {
        info!("Stopping all {} tasks", self.tasks.len());
        self.global_token.cancel();

        let mut first_error = None;
        for (name, handle) in self.tasks.drain() {
            let error = match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
                Ok(Ok(Ok(()))) => continue,
                Ok(Ok(Err(e))) => e.context(format!("Task '{name}' failed during shutdown")),
                Ok(Err(e)) => anyhow!("Task '{name}' panicked: {e}"),
                Err(_) => anyhow!("Task '{name}' did not stop within {SHUTDOWN_GRACE:?}"),
            };
            error!("{error:#}");
            first_error.get_or_insert(error);
        }

        match first_error {
            Some(error) => Err(error).context("One or more tasks failed during shutdown"),
            None => {
                info!("All tasks stopped");
                Ok(())
            }
        }
    }

    #[cfg(test)]
    pub fn active_count(&self) -> usize {
        self.tasks.len()
    }

    #[cfg(test)]
    pub fn is_running(&self, name: &str) -> bool {
        self.tasks.contains_key(name)
    }
}

impl Default for TaskManager {
    fn default() -> Self {
        Self::new()
    }
}
