//! Application entry point and builder pattern implementation.

use std::sync::Arc;

use crate::{actuators::HardwareBackend, config::ConfigManager, coordinator::SystemCoordinator};
use anyhow::{Result, anyhow};

/// The fanctld daemon: loads its services, runs them and stops them.
///
/// # Example
///
/// ```no_run
/// use fanctld::application::Application;
/// use fanctld::config;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = config::ConfigManager::load(None).await?;
/// let mut app = Application::builder()
///     .with_config_manager(config_manager)
///     .build()
///     .await?;
///
/// app.run().await?;
/// # Ok(())
/// # }
/// ```
pub struct Application {
    pub coordinator: SystemCoordinator,
    config_manager: ConfigManager,
}

impl Application {
    pub fn builder() -> ApplicationBuilder {
        ApplicationBuilder::new()
    }

    /// Initializes, starts all services and blocks until shutdown.
    pub async fn run(&mut self) -> Result<()> {
        self.coordinator
            .initialize(self.config_manager.clone())
            .await?;

        self.coordinator.start_all_services().await?;

        self.coordinator.run_main_loop().await
    }
}

pub struct ApplicationBuilder {
    config_manager: Option<ConfigManager>,
    hardware: Option<Arc<dyn HardwareBackend>>,
}

impl ApplicationBuilder {
    fn new() -> Self {
        Self {
            config_manager: None,
            hardware: None,
        }
    }

    pub fn with_config_manager(mut self, config_manager: ConfigManager) -> Self {
        self.config_manager = Some(config_manager);
        self
    }

    /// Replaces the sysfs and NVIDIA backends, e.g. for a dry run.
    pub fn with_hardware(mut self, hardware: Arc<dyn HardwareBackend>) -> Self {
        self.hardware = Some(hardware);
        self
    }

    pub async fn build(self) -> Result<Application> {
        let config_manager = self
            .config_manager
            .ok_or_else(|| anyhow!("Configuration manager is required"))?;

        let mut coordinator = SystemCoordinator::new();
        if let Some(hardware) = self.hardware {
            coordinator = coordinator.with_hardware(hardware);
        }

        Ok(Application {
            coordinator,
            config_manager,
        })
    }
}
