//! System coordinator for managing service lifecycle and dependency injection.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use log::{debug, info, warn};
use tokio::{
    signal::unix::{SignalKind, signal},
    sync::broadcast::error::RecvError,
};

use crate::{
    actuators::{HardwareBackend, SystemHardware},
    app_context::AppState,
    config::ConfigManager,
    event::{ConfigChangeType, Event, EventBus},
    providers::{
        AppStateProvider, AsyncProvider, ConfigWatcherServiceProvider, ControlServiceProvider,
        DBusServiceProvider, HistoryServiceProvider, ServiceProvider,
    },
    task_manager::TaskManager,
};

/// Owns the services of the daemon and drives their lifecycle.
///
/// Services are registered from providers, started in priority order
/// (critical ones must succeed) and stopped together on shutdown. The main
/// loop reacts to signals and to events other services publish.
pub struct SystemCoordinator {
    task_manager: TaskManager,
    event_bus: EventBus,
    shared_state: Option<Arc<AppState>>,
    service_providers: Vec<Box<dyn ServiceProvider>>,
    hardware: Option<Arc<dyn HardwareBackend>>,
    with_dbus: bool,
}

impl Default for SystemCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemCoordinator {
    pub fn new() -> Self {
        Self {
            task_manager: TaskManager::new(),
            event_bus: EventBus::new(),
            shared_state: None,
            service_providers: Vec::new(),
            hardware: None,
            with_dbus: true,
        }
    }

    /// Uses `hardware` instead of sysfs and the NVIDIA tools.
    pub fn with_hardware(mut self, hardware: Arc<dyn HardwareBackend>) -> Self {
        self.hardware = Some(hardware);
        self
    }

    /// Skips the D-Bus service.
    pub fn without_dbus(mut self) -> Self {
        self.with_dbus = false;
        self
    }

    /// Builds the shared state and registers every service provider.
    pub async fn initialize(&mut self, config_manager: ConfigManager) -> Result<()> {
        info!("Initializing SystemCoordinator...");

        let state = AppStateProvider::new(config_manager)
            .provide()
            .await
            .context("Failed to initialize application state")?;
        self.shared_state = Some(state.clone());

        self.register_service_providers(state)
            .await
            .context("Failed to register service providers")?;

        info!("SystemCoordinator initialization completed");
        Ok(())
    }

    async fn register_service_providers(&mut self, state: Arc<AppState>) -> Result<()> {
        let hardware = match &self.hardware {
            Some(hardware) => hardware.clone(),
            None => Arc::new(SystemHardware::new(state.config().await.command_timeout())),
        };

        let mut providers: Vec<Box<dyn ServiceProvider>> = vec![
            Box::new(ControlServiceProvider::new(
                state.clone(),
                self.event_bus.clone(),
                hardware,
            )),
            Box::new(ConfigWatcherServiceProvider::new(
                state.clone(),
                self.event_bus.clone(),
            )),
            Box::new(HistoryServiceProvider::new(state.clone())),
        ];

        if self.with_dbus {
            match DBusServiceProvider::new(state.clone(), self.event_bus.clone()).await {
                Ok(provider) => providers.push(Box::new(provider)),
                Err(e) => warn!("{e:#}, skipping D-Bus service"),
            }
        }

        providers.sort_by_key(|b| std::cmp::Reverse(b.priority()));
        self.service_providers = providers;

        info!(
            "Registered {} service providers in priority order",
            self.service_providers.len()
        );

        Ok(())
    }

    /// Starts all registered services in priority order.
    ///
    /// Critical services must start successfully, while non-critical services
    /// can fail without stopping the system.
    pub async fn start_all_services(&mut self) -> Result<()> {
        for provider in &self.service_providers {
            let is_critical = provider.is_critical();

            match provider.start(&mut self.task_manager).await {
                Ok(()) => {
                    info!(
                        "Service '{}' started (priority: {}, critical: {})",
                        provider.name(),
                        provider.priority(),
                        is_critical
                    );
                }
                Err(e) if is_critical => {
                    return Err(e).with_context(|| {
                        format!("Critical service '{}' failed to start", provider.name())
                    });
                }
                Err(e) => {
                    warn!(
                        "Non-critical service '{}' failed to start: {e:#}",
                        provider.name()
                    );
                }
            }
        }

        info!("All critical services started successfully");
        Ok(())
    }

    /// Runs until SIGINT, SIGTERM or a shutdown event, then stops every service.
    pub async fn run_main_loop(&mut self) -> Result<()> {
        let mut event_rx = self.event_bus.subscribe();
        let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
        info!("Starting main event loop");

        loop {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for shutdown signal")?;
                    info!("Received Ctrl+C, initiating graceful shutdown...");
                    break;
                }
                _ = terminate.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown...");
                    break;
                }
                event = event_rx.recv() => {
                    if self.handle_event(event).await? {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
        info!("Main event loop terminated");
        Ok(())
    }

    /// Handles one event; returns `true` when the daemon should stop.
    async fn handle_event(&mut self, event_result: Result<Event, RecvError>) -> Result<bool> {
        match event_result {
            Ok(Event::ConfigChangeDetected(change_type)) => {
                self.handle_config_change(change_type).await;
            }
            Ok(Event::SystemShutdown) => {
                info!("Shutdown requested");
                return Ok(true);
            }
            Ok(event) => {
                debug!("Received event: {event:?}");
            }
            Err(RecvError::Closed) => {
                return Err(anyhow!("Event bus channel closed unexpectedly"));
            }
            Err(RecvError::Lagged(n)) => {
                warn!("Event bus lagged by {n} messages");
            }
        }
        Ok(false)
    }

    async fn handle_config_change(&self, change_type: ConfigChangeType) {
        match change_type {
            ConfigChangeType::HotReload => {
                if let Err(e) = self.reload_configuration().await {
                    warn!("Configuration reload failed, keeping the running one: {e:#}");
                }
            }
            ConfigChangeType::ColdRestart { changed_sections } => {
                warn!("Changes in {changed_sections:?} take effect after a restart of fanctld");
            }
        }
    }

    /// Reloads the file and tells the control loop to reconfigure.
    async fn reload_configuration(&self) -> Result<()> {
        let state = self
            .shared_state
            .as_ref()
            .ok_or_else(|| anyhow!("System not properly initialized"))?;

        state
            .reload_config()
            .await
            .context("Failed to reload configuration")?;

        self.event_bus
            .publish(Event::ConfigReloaded)
            .context("Failed to announce configuration reload")?;
        info!("Hot configuration reload completed");
        Ok(())
    }

    async fn shutdown(&mut self) {
        info!("Initiating graceful shutdown...");

        if let Err(e) = self.task_manager.shutdown_all().await {
            log::error!("Error during task shutdown: {e:#}");
        }

        info!("Shutdown complete");
    }

    pub const fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn running_services(&self) -> Vec<&'static str> {
        self.service_providers.iter().map(|p| p.name()).collect()
    }
}
