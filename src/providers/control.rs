use anyhow::Result;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::{
    sync::broadcast::error::RecvError,
    time::{Interval, MissedTickBehavior, interval},
};
use tokio_util::sync::CancellationToken;

use crate::{
    actuators::HardwareBackend,
    app_context::AppState,
    event::{Event, EventBus},
    orchestrator::Orchestrator,
    providers::traits::ServiceProvider,
    task_manager::TaskManager,
};

/// Fan control loop service provider.
///
/// Owns the [`Orchestrator`] and runs one tick per `tick_seconds`: read
/// sensors, resolve modes, drive actuators, publish the snapshot. This is
/// the core service of the daemon.
///
/// # Priority and Criticality
///
/// - **Priority**: 10 (highest)
/// - **Critical**: Yes (system cannot function without it)
///
/// # Example
///
/// ```no_run
/// use std::{sync::Arc, time::Duration};
/// use fanctld::actuators::SystemHardware;
/// use fanctld::providers::ControlServiceProvider;
/// use fanctld::event::EventBus;
/// use fanctld::app_context::AppState;
///
/// # async fn example(state: Arc<AppState>) -> anyhow::Result<()> {
/// let event_bus = EventBus::new();
/// let hardware = Arc::new(SystemHardware::new(Duration::from_secs(3)));
/// let provider = ControlServiceProvider::new(state, event_bus, hardware);
/// // Use with TaskManager to start the service
/// # Ok(())
/// # }
/// ```
pub struct ControlServiceProvider {
    state: Arc<AppState>,
    event_bus: EventBus,
    backend: Arc<dyn HardwareBackend>,
}

impl ControlServiceProvider {
    pub fn new(state: Arc<AppState>, event_bus: EventBus, backend: Arc<dyn HardwareBackend>) -> Self {
        Self {
            state,
            event_bus,
            backend,
        }
    }
}

#[async_trait]
impl ServiceProvider for ControlServiceProvider {
    async fn start(&self, task_manager: &mut TaskManager) -> Result<()> {
        let state = self.state.clone();
        let event_bus = self.event_bus.clone();
        let backend = self.backend.clone();

        task_manager
            .spawn_task(self.name().to_string(), |cancel_token| async move {
                run_control_service(state, event_bus, backend, cancel_token).await
            })
            .await
    }

    fn name(&self) -> &'static str {
        "ControlService"
    }

    fn priority(&self) -> i32 {
        10
    }

    fn is_critical(&self) -> bool {
        true
    }
}

async fn tick_timer(state: &AppState) -> Interval {
    let mut timer = interval(state.config().await.tick_interval());
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

async fn run_control_service(
    state: Arc<AppState>,
    event_bus: EventBus,
    backend: Arc<dyn HardwareBackend>,
    cancel_token: CancellationToken,
) -> Result<()> {
    let mut events = event_bus.subscribe();
    let mut orchestrator = {
        let config = state.config().await;
        Orchestrator::build(&config, backend).await
    };
    let mut timer = tick_timer(&state).await;
    info!(
        "Control loop started with {} fan group(s)",
        orchestrator.group_count()
    );

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!("Control service cancelled, releasing GPU fans");
                orchestrator.shutdown().await;
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(Event::ConfigReloaded) => {
                        let config = state.config_manager().clone_config().await;
                        orchestrator.reconfigure(&config).await;
                        timer = tick_timer(&state).await;
                        info!("Control loop reconfigured");
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Control service missed {skipped} events");
                    }
                    Err(RecvError::Closed) => {
                        info!("Event bus closed, stopping control loop");
                        orchestrator.shutdown().await;
                        break;
                    }
                }
            }
            _instant = timer.tick() => {
                run_tick(&mut orchestrator, &state, &event_bus).await;
            }
        }
    }

    Ok(())
}

/// Runs one control tick and publishes its results.
pub(crate) async fn run_tick(orchestrator: &mut Orchestrator, state: &AppState, event_bus: &EventBus) {
    let sensors = state.sensors.read().await.read_all().await;
    let overrides = state.overrides().await;

    let tick = orchestrator.evaluate(&sensors, &overrides, Instant::now()).await;

    for transition in tick.transitions {
        info!(
            "Fan group '{}' mode {} -> {}",
            transition.group, transition.from, transition.to
        );
        if let Err(e) = event_bus.publish(Event::ModeChanged {
            group: transition.group,
            from: transition.from,
            to: transition.to,
        }) {
            debug!("No listener for mode change: {e}");
        }
    }

    if let Err(e) = event_bus.publish(Event::TemperatureChanged(sensors)) {
        debug!("No listener for temperatures: {e}");
    }

    state.publish_snapshot(tick.snapshot).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        actuators::{gpu::tests::Call, tests::TestBackend},
        config::{ConfigManager, tests::sample_config},
        sensors::{SensorAggregator, tests::FixedSensor},
    };
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    async fn sample_state() -> Arc<AppState> {
        let manager = ConfigManager::new(sample_config(), "/tmp/fanctld-test.json".into());
        let state = AppState::new(manager).await.unwrap();
        *state.sensors.write().await = SensorAggregator::new(
            vec![
                Box::new(FixedSensor::new("cpu", Some(65.0))),
                Box::new(FixedSensor::new("gpu", Some(50.0))),
            ],
            Duration::from_secs(1),
        );
        Arc::new(state)
    }

    #[tokio::test]
    async fn provider_metadata() {
        let provider = ControlServiceProvider::new(
            sample_state().await,
            EventBus::new(),
            Arc::new(TestBackend::new(1200)),
        );

        assert_eq!(provider.name(), "ControlService");
        assert_eq!(provider.priority(), 10);
        assert!(provider.is_critical());
    }

    #[tokio::test]
    async fn tick_publishes_snapshot_and_temperatures() {
        let state = sample_state().await;
        let event_bus = EventBus::new();
        let mut events = event_bus.subscribe();
        let mut orchestrator =
            Orchestrator::build(&sample_config(), Arc::new(TestBackend::new(1200))).await;

        run_tick(&mut orchestrator, &state, &event_bus).await;

        let snapshot = state.latest_snapshot().await.unwrap();
        assert_eq!(snapshot.sensors.get("cpu"), Some(&65.0));
        assert_eq!(snapshot.groups.len(), 2);
        // Overridden from the file.
        assert_eq!(snapshot.groups[1].mode, 1);
        assert_eq!(snapshot.groups[1].status, "MANUAL");

        match events.recv().await.unwrap() {
            Event::TemperatureChanged(values) => assert_eq!(values.get("gpu"), Some(&50.0)),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn override_change_emits_mode_changed() {
        let state = sample_state().await;
        let event_bus = EventBus::new();
        let mut orchestrator =
            Orchestrator::build(&sample_config(), Arc::new(TestBackend::new(1200))).await;

        run_tick(&mut orchestrator, &state, &event_bus).await;
        let mut events = event_bus.subscribe();
        state.set_override("gpu", false, 0, false).await.unwrap();
        run_tick(&mut orchestrator, &state, &event_bus).await;

        match events.recv().await.unwrap() {
            Event::ModeChanged { group, from, to } => {
                assert_eq!(group, "gpu");
                assert_eq!((from, to), (1, 0));
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn cancellation_releases_gpu_fans() {
        let state = sample_state().await;
        let event_bus = EventBus::new();
        let backend = Arc::new(TestBackend::new(1200));
        let driver = backend.driver.clone();
        let provider = ControlServiceProvider::new(state.clone(), event_bus, backend);

        let mut task_manager = TaskManager::new();
        provider.start(&mut task_manager).await.unwrap();

        timeout(Duration::from_secs(2), async {
            while state.latest_snapshot().await.is_none() {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        driver.take_calls();
        task_manager.shutdown_all().await.unwrap();
        assert_eq!(driver.take_calls(), vec![Call::Manual(0, false)]);
    }
}
