use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use event_listener::Event;
use log::{error, info};
use zbus::{DBusError, interface, object_server::SignalEmitter};

use crate::{
    app_context::AppState,
    config::FanGroupDraft,
    event::{Event as AppEvent, EventBus},
    history::HistoryRange,
};

pub const SERVICE_NAME: &str = "io.github.fanctld";
pub const OBJECT_PATH: &str = "/io/github/fanctld";

#[derive(Debug, DBusError)]
#[zbus(prefix = "io.github.fanctld1.Error")]
pub enum ApiError {
    #[zbus(error)]
    ZBus(zbus::Error),
    /// No control tick has completed yet.
    NotReady(String),
    InvalidArgs(String),
    Failed(String),
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Failed(format!("{e:#}"))
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(e: serde_json::Error) -> Self {
        ApiError::Failed(e.to_string())
    }
}

pub struct DBusInterface {
    state: Arc<AppState>,
    event_bus: EventBus,
    version: String,

    // Events
    stop: Arc<Event>,
}

impl DBusInterface {
    pub fn new(state: Arc<AppState>, event_bus: EventBus, version: String, stop: Arc<Event>) -> Self {
        Self {
            state,
            event_bus,
            version,
            stop,
        }
    }

    /// Re-reads the file and lets the control loop pick up the result.
    async fn reload_and_announce(&self) -> Result<(), ApiError> {
        self.state.reload_config().await?;
        if let Err(e) = self.event_bus.publish(AppEvent::ConfigReloaded) {
            error!("Failed to announce reload: {e}");
        }
        Ok(())
    }
}

#[interface(name = "io.github.fanctld1")]
impl DBusInterface {
    #[zbus(signal)]
    async fn stopped(emitter: &SignalEmitter<'_>) -> zbus::Result<()>;

    #[zbus(signal)]
    pub async fn mode_changed(
        emitter: &SignalEmitter<'_>,
        group: &str,
        from: u32,
        to: u32,
    ) -> zbus::Result<()>;

    async fn stop(
        &self,
        #[zbus(signal_emitter)] emitter: SignalEmitter<'_>,
    ) -> Result<(), ApiError> {
        emitter.stopped().await.map_err(ApiError::ZBus)?;
        self.stop.notify(1);

        Ok(())
    }

    /// Latest snapshot as JSON.
    async fn status(&self) -> Result<String, ApiError> {
        let snapshot = self
            .state
            .latest_snapshot()
            .await
            .ok_or_else(|| ApiError::NotReady("no control tick has completed yet".to_string()))?;
        Ok(serde_json::to_string(snapshot.as_ref())?)
    }

    /// Configuration with the live override map.
    async fn config(&self) -> Result<String, ApiError> {
        Ok(serde_json::to_string(&self.state.effective_config().await)?)
    }

    async fn history(&self, range: &str) -> Result<String, ApiError> {
        let now_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let interval = self.state.history_interval().await;

        let entries = self
            .state
            .history
            .query(HistoryRange::from_key(range), interval, now_ms)
            .await?;
        Ok(serde_json::to_string(&entries)?)
    }

    async fn set_override(
        &self,
        group: &str,
        enabled: bool,
        mode: u32,
        save: bool,
    ) -> Result<String, ApiError> {
        let overrides = self
            .state
            .set_override(group, enabled, mode as usize, save)
            .await
            .map_err(|e| ApiError::InvalidArgs(format!("{e:#}")))?;
        Ok(serde_json::to_string(&overrides)?)
    }

    async fn reload(&self) -> Result<(), ApiError> {
        info!("Reload requested over D-Bus");
        self.reload_and_announce().await
    }

    /// Adds a fan group described by `json`, filling in defaults.
    async fn add_fan_group(&self, json: &str) -> Result<String, ApiError> {
        let draft: FanGroupDraft = serde_json::from_str(json)
            .map_err(|e| ApiError::InvalidArgs(format!("invalid fan group: {e}")))?;

        let group = self
            .state
            .config_manager()
            .add_fan_group(draft.into_group())
            .await
            .map_err(|e| ApiError::InvalidArgs(format!("{e:#}")))?;

        self.reload_and_announce().await?;
        Ok(serde_json::to_string(&group)?)
    }

    async fn remove_fan_group(&self, id: &str) -> Result<(), ApiError> {
        self.state
            .config_manager()
            .remove_fan_group(id)
            .await
            .map_err(|e| ApiError::InvalidArgs(format!("{e:#}")))?;

        self.reload_and_announce().await
    }

    #[zbus(property)]
    async fn version(&self) -> String {
        self.version.clone()
    }
}
