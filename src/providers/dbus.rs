//! D-Bus service provider for dependency injection.

use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use zbus::{Connection, object_server::SignalEmitter};

use crate::{
    app_context::AppState,
    event::{Event, EventBus},
    interface::{DBusInterface, OBJECT_PATH, SERVICE_NAME},
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// D-Bus service provider.
///
/// Exposes status, configuration, history and override control on the
/// session bus and forwards mode transitions as `ModeChanged` signals.
///
/// # Priority and Criticality
///
/// - **Priority**: 8 (high)
/// - **Critical**: Yes
///
/// # Interface
///
/// - **Service Name**: `io.github.fanctld`
/// - **Object Path**: `/io/github/fanctld`
///
/// Creation fails without a session bus; the coordinator then runs the
/// daemon without it.
pub struct DBusServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
    connection: Connection,
}

impl DBusServiceProvider {
    /// Connects to the session bus.
    pub async fn new(state: Arc<AppState>, event_bus: EventBus) -> Result<Self> {
        let connection = Connection::session()
            .await
            .context("Failed to connect to the D-Bus session bus")?;
        Ok(Self {
            state,
            event_bus,
            connection,
        })
    }
}

#[async_trait]
impl ServiceProvider for DBusServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = self.state.clone();
        let event_bus = self.event_bus.clone();
        let connection = self.connection.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_dbus_service(state, event_bus, connection, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "DBusService"
    }

    fn priority(&self) -> i32 {
        8
    }

    fn is_critical(&self) -> bool {
        true
    }
}

async fn run_dbus_service(
    state: Arc<AppState>,
    event_bus: EventBus,
    connection: Connection,
    cancel_token: CancellationToken,
) -> Result<()> {
    let stop = Arc::new(event_listener::Event::new());
    let interface = DBusInterface::new(
        state,
        event_bus.clone(),
        env!("CARGO_PKG_VERSION").to_string(),
        stop.clone(),
    );
    connection.object_server().at(OBJECT_PATH, interface).await?;
    connection.request_name(SERVICE_NAME).await?;
    info!("D-Bus interface registered as {SERVICE_NAME}");

    let emitter = SignalEmitter::new(&connection, OBJECT_PATH)?;
    let mut events = event_bus.subscribe();
    let mut stop_requested = stop.listen();

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("D-Bus service cancelled");
                break;
            }
            () = &mut stop_requested => {
                info!("Stop requested over D-Bus");
                if let Err(e) = event_bus.publish(Event::SystemShutdown) {
                    error!("Failed to request shutdown: {e}");
                }
                stop_requested = stop.listen();
            }
            event = events.recv() => {
                match event {
                    Ok(Event::ModeChanged { group, from, to }) => {
                        if let Err(e) =
                            DBusInterface::mode_changed(&emitter, &group, from as u32, to as u32).await
                        {
                            warn!("Failed to emit ModeChanged: {e}");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("D-Bus service missed {skipped} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, ConfigManager};

    async fn create_mock_app_state() -> Arc<AppState> {
        let config_manager =
            ConfigManager::new(Config::default(), std::path::PathBuf::from("/tmp/fanctld.json"));
        Arc::new(AppState::new(config_manager).await.unwrap())
    }

    #[tokio::test]
    async fn provider_metadata_when_bus_available() {
        let state = create_mock_app_state().await;

        // Test environments usually have no session bus.
        if let Ok(provider) = DBusServiceProvider::new(state, EventBus::new()).await {
            assert_eq!(provider.name(), "DBusService");
            assert_eq!(provider.priority(), 8);
            assert!(provider.is_critical());
        }
    }

    #[tokio::test]
    async fn service_stops_on_cancellation() {
        let state = create_mock_app_state().await;
        let mut task_manager = TaskManager::new();

        let Ok(provider) = DBusServiceProvider::new(state, EventBus::new()).await else {
            return;
        };
        if provider.start(&mut task_manager).await.is_ok() {
            assert!(task_manager.is_running("DBusService"));
            let _ = task_manager.shutdown_all().await;
            assert_eq!(task_manager.active_count(), 0);
        }
    }
}
