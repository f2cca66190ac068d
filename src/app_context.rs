//! Application state and global context management.

use std::{
    sync::{Arc, LazyLock},
    time::Duration,
};

use anyhow::{Result, bail};
use log::info;
use tokio::sync::RwLock;

use crate::{
    config::{Config, ConfigManager, Level, OverrideCfg, OverrideMap},
    history::HistoryLog,
    orchestrator::Snapshot,
    sensors::SensorAggregator,
};

/// Shared application state.
///
/// Everything the services and the D-Bus interface share lives here.
/// Overrides and snapshots are never mutated in place: writers build a new
/// value and swap it in, so readers always see a consistent whole.
pub struct AppState {
    /// Configuration manager for centralized config handling
    pub config_manager: Arc<ConfigManager>,
    /// Live override map, seeded from the configuration file
    pub overrides: Arc<RwLock<OverrideMap>>,
    /// Result of the last completed tick
    pub snapshot: Arc<RwLock<Option<Arc<Snapshot>>>>,
    /// Configured temperature sources
    pub sensors: Arc<RwLock<SensorAggregator>>,
    /// Snapshot history file
    pub history: Arc<HistoryLog>,
}

/// Wrapper for lm-sensors library instance.
///
/// This wrapper is needed to implement Send + Sync for the lm-sensors
/// library which doesn't implement these traits by default.
pub struct LMSensorsRef(pub lm_sensors::LMSensors);

// SAFETY: lm-sensors library (>= 3.6) uses internal global mutex for all operations.
// The library is thread-safe but doesn't implement Send/Sync markers.
unsafe impl Send for LMSensorsRef {}
unsafe impl Sync for LMSensorsRef {}

/// Global lm-sensors instance.
///
/// Initialized on first use and shared by every lm-sensors source.
/// `None` if lm-sensors is not available on the system.
pub static LMSENSORS: LazyLock<Option<LMSensorsRef>> =
    LazyLock::new(|| match lm_sensors::Initializer::default().initialize() {
        Ok(sensors) => {
            log::info!("lm-sensors initialized successfully");
            Some(LMSensorsRef(sensors))
        }
        Err(e) => {
            log::warn!("lm-sensors not available: {e}. lm-sensors inputs will be skipped.");
            None
        }
    });

fn build_sensors(config: &Config) -> SensorAggregator {
    let needs_lm = config
        .sensors
        .iter()
        .any(|s| matches!(s, crate::config::SensorCfg::LmSensors { .. }));
    let lmsensors = if needs_lm {
        LMSENSORS.as_ref().map(|lms| &lms.0)
    } else {
        None
    };

    SensorAggregator::from_config(&config.sensors, lmsensors, config.command_timeout())
}

impl AppState {
    /// Creates the shared state from a loaded configuration.
    pub async fn new(config_manager: ConfigManager) -> Result<Self> {
        let config = config_manager.clone_config().await;
        let sensors = build_sensors(&config);
        info!("{} temperature sensor(s) configured", sensors.len());

        Ok(Self {
            overrides: Arc::new(RwLock::new(config.overrides.clone())),
            snapshot: Arc::new(RwLock::new(None)),
            sensors: Arc::new(RwLock::new(sensors)),
            history: Arc::new(HistoryLog::from_config(&config.history)),
            config_manager: Arc::new(config_manager),
        })
    }

    /// Gets a read-only reference to the current configuration.
    pub async fn config(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config_manager.get().await
    }

    /// Gets the configuration manager.
    pub fn config_manager(&self) -> &Arc<ConfigManager> {
        &self.config_manager
    }

    /// Current configuration with the live override map in place.
    pub async fn effective_config(&self) -> Config {
        let mut config = self.config_manager.clone_config().await;
        config.overrides = self.overrides().await;
        config
    }

    pub async fn overrides(&self) -> OverrideMap {
        self.overrides.read().await.clone()
    }

    /// Sets or clears the override of one group and returns the new map.
    ///
    /// With `save` the map is also written to the configuration file.
    pub async fn set_override(
        &self,
        group: &str,
        enabled: bool,
        mode: Level,
        save: bool,
    ) -> Result<OverrideMap> {
        if self.config().await.find_group(group).is_none() {
            bail!("Unknown fan group '{group}'");
        }

        let updated = {
            let mut current = self.overrides.write().await;
            let mut next = current.clone();
            next.insert(group.to_string(), OverrideCfg { enabled, mode });
            *current = next.clone();
            next
        };

        info!(
            "Override for '{group}' {} (mode {mode})",
            if enabled { "enabled" } else { "disabled" }
        );

        if save {
            self.config_manager.persist_overrides(&updated).await?;
        }

        Ok(updated)
    }

    pub async fn latest_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.snapshot.read().await.clone()
    }

    pub async fn publish_snapshot(&self, snapshot: Snapshot) {
        *self.snapshot.write().await = Some(Arc::new(snapshot));
    }

    /// Reloads the configuration file and re-seeds overrides and sensors.
    pub async fn reload_config(&self) -> Result<()> {
        self.config_manager.reload().await?;
        let config = self.config_manager.clone_config().await;

        *self.overrides.write().await = config.overrides.clone();
        *self.sensors.write().await = build_sensors(&config);
        Ok(())
    }

    pub async fn history_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.config().await.history.interval_seconds.max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::SAMPLE_JSON;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    async fn state_from_sample() -> (NamedTempFile, AppState) {
        let mut file = Builder::new().suffix(".json").tempfile().unwrap();
        file.write_all(SAMPLE_JSON.as_bytes()).unwrap();
        file.flush().unwrap();

        let manager = ConfigManager::load(Some(file.path().to_path_buf()))
            .await
            .unwrap();
        let state = AppState::new(manager).await.unwrap();
        (file, state)
    }

    #[tokio::test]
    async fn overrides_are_seeded_from_config() {
        let (_file, state) = state_from_sample().await;

        let overrides = state.overrides().await;
        assert_eq!(
            overrides.get("gpu"),
            Some(&OverrideCfg {
                enabled: true,
                mode: 1
            })
        );
        assert_eq!(state.sensors.read().await.len(), 2);
    }

    #[tokio::test]
    async fn set_override_rejects_unknown_group() {
        let (_file, state) = state_from_sample().await;

        assert!(state.set_override("pump", true, 1, false).await.is_err());
        assert_eq!(state.overrides().await.len(), 1);
    }

    #[tokio::test]
    async fn set_override_with_save_persists() {
        let (file, state) = state_from_sample().await;

        let map = state.set_override("system", true, 2, true).await.unwrap();
        assert_eq!(map.len(), 2);

        let reloaded = ConfigManager::load(Some(file.path().to_path_buf()))
            .await
            .unwrap()
            .clone_config()
            .await;
        assert_eq!(
            reloaded.overrides.get("system"),
            Some(&OverrideCfg {
                enabled: true,
                mode: 2
            })
        );
    }

    #[tokio::test]
    async fn reload_replaces_in_memory_overrides() {
        let (_file, state) = state_from_sample().await;

        state.set_override("system", true, 2, false).await.unwrap();
        state.reload_config().await.unwrap();

        let overrides = state.overrides().await;
        assert!(!overrides.contains_key("system"));
        assert!(overrides.contains_key("gpu"));
    }

    #[tokio::test]
    async fn snapshot_is_replaced_whole() {
        let (_file, state) = state_from_sample().await;
        assert!(state.latest_snapshot().await.is_none());

        state
            .publish_snapshot(Snapshot {
                timestamp: 42,
                sensors: Default::default(),
                groups: Vec::new(),
            })
            .await;
        assert_eq!(state.latest_snapshot().await.unwrap().timestamp, 42);
    }
}
