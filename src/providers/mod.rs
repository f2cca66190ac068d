//! Dependency injection providers for service management.
//!
//! Each long-running part of the daemon is a [`ServiceProvider`] that the
//! coordinator starts in priority order.

pub mod app_state;
pub mod config_watcher;
pub mod control;
pub mod dbus;
pub mod history;
pub mod traits;

pub use app_state::AppStateProvider;
pub use config_watcher::ConfigWatcherServiceProvider;
pub use control::ControlServiceProvider;
pub use dbus::DBusServiceProvider;
pub use history::HistoryServiceProvider;
pub use traits::{AsyncProvider, ServiceProvider};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::{
        actuators::tests::TestBackend,
        app_context::AppState,
        config::{Config, ConfigManager},
        event::EventBus,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    async fn create_test_app_state() -> Arc<AppState> {
        let config_manager =
            ConfigManager::new(Config::default(), std::path::PathBuf::from("/tmp/fanctld.json"));
        AppStateProvider::new(config_manager).provide().await.unwrap()
    }

    #[tokio::test]
    async fn providers_sort_by_priority() {
        let state = create_test_app_state().await;
        let event_bus = EventBus::new();

        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![
            Box::new(HistoryServiceProvider::new(state.clone())),
            Box::new(ConfigWatcherServiceProvider::new(
                state.clone(),
                event_bus.clone(),
            )),
            Box::new(ControlServiceProvider::new(
                state.clone(),
                event_bus.clone(),
                Arc::new(TestBackend::new(1200)),
            )),
        ];
        providers.sort_by_key(|p| std::cmp::Reverse(p.priority()));

        let order: Vec<_> = providers.iter().map(|p| (p.name(), p.is_critical())).collect();
        assert_eq!(
            order,
            vec![
                ("ControlService", true),
                ("ConfigWatcherService", false),
                ("HistoryService", false),
            ]
        );
    }
}
