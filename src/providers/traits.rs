use anyhow::Result;
use async_trait::async_trait;

use crate::task_manager::TaskManager;

/// Creates a component asynchronously.
///
/// # Example
///
/// ```no_run
/// use fanctld::providers::traits::AsyncProvider;
///
/// struct Greeting;
///
/// #[async_trait::async_trait]
/// impl AsyncProvider<String> for Greeting {
///     async fn provide(&self) -> anyhow::Result<String> {
///         Ok("ready".to_string())
///     }
/// }
/// ```
#[async_trait]
pub trait AsyncProvider<T> {
    async fn provide(&self) -> Result<T>;
}

/// A long-running service started through [`TaskManager`].
///
/// Critical services must start for the daemon to run; the others may fail
/// and are skipped with a warning.
///
/// # Example
///
/// ```no_run
/// use fanctld::providers::traits::ServiceProvider;
/// use fanctld::task_manager::TaskManager;
/// use anyhow::Result;
///
/// struct HeartbeatService;
///
/// #[async_trait::async_trait]
/// impl ServiceProvider for HeartbeatService {
///     async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
///         task_manager.spawn_task("heartbeat".to_string(), |token| async move {
///             token.cancelled().await;
///             Ok(())
///         }).await
///     }
///
///     fn name(&self) -> &'static str { "HeartbeatService" }
/// }
/// ```
#[async_trait]
pub trait ServiceProvider: Send + Sync {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()>;

    /// Name used for logging and task registration.
    fn name(&self) -> &'static str;

    /// Startup priority (higher numbers start first).
    fn priority(&self) -> i32 {
        0
    }

    fn is_critical(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    };
    use tokio::time::{Duration, sleep};
    use tokio_util::sync::CancellationToken;

    struct FlagService {
        name: &'static str,
        priority: i32,
        critical: bool,
        ran: Arc<AtomicBool>,
    }

    impl FlagService {
        fn new(name: &'static str, priority: i32, critical: bool) -> Self {
            Self {
                name,
                priority,
                critical,
                ran: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl ServiceProvider for FlagService {
        async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
            let ran = self.ran.clone();
            task_manager
                .spawn_task(self.name.to_string(), move |_token: CancellationToken| async move {
                    ran.store(true, Ordering::SeqCst);
                    Ok(())
                })
                .await
        }

        fn name(&self) -> &'static str {
            self.name
        }

        fn priority(&self) -> i32 {
            self.priority
        }

        fn is_critical(&self) -> bool {
            self.critical
        }
    }

    struct BrokenService;

    #[async_trait]
    impl ServiceProvider for BrokenService {
        async fn start(&self, _task_manager: &mut TaskManager) -> Result<()> {
            Err(anyhow!("BrokenService: device missing"))
        }

        fn name(&self) -> &'static str {
            "BrokenService"
        }
    }

    struct Fixed(u8);

    #[async_trait]
    impl AsyncProvider<u8> for Fixed {
        async fn provide(&self) -> Result<u8> {
            Ok(self.0)
        }
    }

    #[tokio::test]
    async fn async_provider_yields_value() {
        let providers: Vec<Box<dyn AsyncProvider<u8>>> = vec![Box::new(Fixed(1)), Box::new(Fixed(2))];

        let mut values = Vec::new();
        for provider in &providers {
            values.push(provider.provide().await.unwrap());
        }
        assert_eq!(values, vec![1, 2]);
    }

    #[tokio::test]
    async fn started_service_runs_its_task() {
        let mut task_manager = TaskManager::new();
        let service = FlagService::new("flag", 5, false);

        service.start(&mut task_manager).await.unwrap();
        sleep(Duration::from_millis(20)).await;
        assert!(service.ran.load(Ordering::SeqCst));
        assert!(task_manager.is_running("flag"));
    }

    #[tokio::test]
    async fn defaults_are_low_priority_and_optional() {
        assert_eq!(BrokenService.priority(), 0);
        assert!(!BrokenService.is_critical());
    }

    #[tokio::test]
    async fn start_failure_is_reported() {
        let mut task_manager = TaskManager::new();

        let error = BrokenService.start(&mut task_manager).await.unwrap_err();
        assert!(error.to_string().contains("device missing"));
        assert_eq!(task_manager.active_count(), 0);
    }

    #[test]
    fn priority_orders_startup() {
        let mut services = vec![
            FlagService::new("history", 4, false),
            FlagService::new("control", 10, true),
            FlagService::new("watcher", 6, false),
        ];
        services.sort_by_key(|s| std::cmp::Reverse(s.priority()));

        let names: Vec<_> = services.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["control", "watcher", "history"]);
    }
}
