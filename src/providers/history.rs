use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use std::sync::Arc;
use tokio::time::{MissedTickBehavior, interval};
use tokio_stream::{StreamExt, wrappers::IntervalStream};
use tokio_util::sync::CancellationToken;

use crate::{
    app_context::AppState, providers::traits::ServiceProvider, task_manager::TaskManager,
};

/// Snapshot history recorder.
///
/// Appends the latest snapshot to the history file every
/// `history.interval_seconds`. Non-critical: the daemon keeps controlling
/// fans when the log directory is not writable.
pub struct HistoryServiceProvider {
    state: Arc<AppState>,
}

impl HistoryServiceProvider {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ServiceProvider for HistoryServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        if !self.state.config().await.history.enabled {
            info!("History recording disabled");
            return Ok(());
        }

        let state = self.state.clone();
        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_history_service(state, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "HistoryService"
    }

    fn priority(&self) -> i32 {
        4
    }
}

async fn run_history_service(state: Arc<AppState>, cancel_token: CancellationToken) -> Result<()> {
    let mut timer = interval(state.history_interval().await);
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut ticks = IntervalStream::new(timer);
    let mut last_written = None;

    info!("Recording history to {}", state.history.path().display());

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("History service cancelled");
                break;
            }
            Some(_) = ticks.next() => {
                let Some(snapshot) = state.latest_snapshot().await else {
                    continue;
                };
                if last_written == Some(snapshot.timestamp) {
                    continue;
                }
                match state.history.append(&snapshot).await {
                    Ok(()) => last_written = Some(snapshot.timestamp),
                    Err(e) => warn!("Failed to record history: {e:#}"),
                }
            }
        }
    }

    Ok(())
}
