//! Tick orchestration across fan groups.
//!
//! Each tick resolves every group's mode (override or decision engine),
//! maps it to its profile target, drives the group's actuators and
//! collects the outcome into a [`Snapshot`].

use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    actuators::{ActuatorRegistry, FanStatus, HardwareBackend, TargetCommand},
    config::{Config, FanGroupCfg, FanGroupKind, Level, OverrideMap, TargetUnit},
    engine::{ModeDecisionEngine, SensorValues},
};

/// Reported state of one fan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanSnapshot {
    pub id: String,
    pub name: String,
    pub rpm: u32,
    pub drive: u8,
    pub target: f64,
    pub unit: TargetUnit,
    pub status: FanStatus,
}

/// Reported state of one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSnapshot {
    pub id: String,
    pub name: String,
    pub kind: FanGroupKind,
    pub mode: Level,
    pub target: f64,
    pub status: String,
    pub is_manual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub fans: Vec<FanSnapshot>,
}

/// Everything one tick produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub sensors: BTreeMap<String, f64>,
    pub groups: Vec<GroupSnapshot>,
}

/// Effective mode change of a group between two ticks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeTransition {
    pub group: String,
    pub from: Level,
    pub to: Level,
}

#[derive(Debug)]
pub struct Tick {
    pub snapshot: Snapshot,
    pub transitions: Vec<ModeTransition>,
}

struct GroupRuntime {
    cfg: FanGroupCfg,
    engine: ModeDecisionEngine,
    /// `Err` holds the startup failure that disabled this group.
    actuators: Result<ActuatorRegistry, String>,
    last_mode: Option<Level>,
}

impl GroupRuntime {
    async fn build(cfg: FanGroupCfg, backend: &dyn HardwareBackend) -> Self {
        let actuators = match ActuatorRegistry::build(&cfg, backend).await {
            Ok(registry) => {
                info!(
                    "Fan group '{}' ready with {} fan(s)",
                    cfg.id,
                    registry.len()
                );
                Ok(registry)
            }
            Err(e) => {
                error!("Fan group '{}' disabled: {e:#}", cfg.id);
                Err(format!("{e:#}"))
            }
        };

        Self {
            engine: ModeDecisionEngine::new(&cfg),
            cfg,
            actuators,
            last_mode: None,
        }
    }

    async fn release(&mut self) {
        if let Ok(registry) = &mut self.actuators {
            registry.release_all().await;
        }
    }

    async fn evaluate(
        &mut self,
        sensors: &SensorValues,
        overrides: &OverrideMap,
        now: Instant,
    ) -> (GroupSnapshot, Option<ModeTransition>) {
        let forced = overrides
            .get(&self.cfg.id)
            .filter(|ovr| ovr.enabled)
            .map(|ovr| ovr.mode);

        let registry = match &mut self.actuators {
            Ok(registry) => registry,
            Err(reason) => {
                return (
                    GroupSnapshot {
                        id: self.cfg.id.clone(),
                        name: self.cfg.name.clone(),
                        kind: self.cfg.kind,
                        mode: self.engine.current_mode(),
                        target: 0.0,
                        status: "Failed".to_string(),
                        is_manual: forced.is_some(),
                        error: Some(reason.clone()),
                        fans: Vec::new(),
                    },
                    None,
                );
            }
        };

        let mode = match forced {
            Some(mode) => {
                self.engine.mark_manual();
                mode
            }
            None => self.engine.update(sensors, now),
        };

        let (target, unit) = self.cfg.target_for(mode);
        if mode >= self.cfg.profiles.len() {
            warn!(
                "Fan group '{}' has no profile for mode {mode}, using target 0",
                self.cfg.id
            );
        }
        let command = TargetCommand::new(target, unit);

        let mut fans = Vec::with_capacity(registry.len());
        for slot in registry.slots_mut() {
            let outcome = slot.actuator.drive(command).await;
            debug!(
                "{}/{}: {} rpm, drive {}, {:?}",
                self.cfg.id, slot.id, outcome.rpm, outcome.drive, outcome.status
            );
            fans.push(FanSnapshot {
                id: slot.id.clone(),
                name: slot.name.clone(),
                rpm: outcome.rpm,
                drive: outcome.drive,
                target: outcome.target,
                unit: outcome.unit,
                status: outcome.status,
            });
        }

        let transition = match self.last_mode.replace(mode) {
            Some(previous) if previous != mode => Some(ModeTransition {
                group: self.cfg.id.clone(),
                from: previous,
                to: mode,
            }),
            _ => None,
        };

        (
            GroupSnapshot {
                id: self.cfg.id.clone(),
                name: self.cfg.name.clone(),
                kind: self.cfg.kind,
                mode,
                target,
                status: self.engine.status().to_string(),
                is_manual: forced.is_some(),
                error: None,
                fans,
            },
            transition,
        )
    }
}

/// Owns every group runtime and drives them once per tick.
pub struct Orchestrator {
    groups: Vec<GroupRuntime>,
    backend: Arc<dyn HardwareBackend>,
}

impl Orchestrator {
    /// Builds runtimes for every configured group.
    ///
    /// A group whose hardware cannot be opened is kept in a failed state;
    /// the remaining groups are unaffected.
    pub async fn build(config: &Config, backend: Arc<dyn HardwareBackend>) -> Self {
        let mut groups = Vec::with_capacity(config.fan_groups.len());
        for cfg in &config.fan_groups {
            groups.push(GroupRuntime::build(cfg.clone(), backend.as_ref()).await);
        }

        Self { groups, backend }
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// Runs one tick over all groups.
    pub async fn evaluate(
        &mut self,
        sensors: &SensorValues,
        overrides: &OverrideMap,
        now: Instant,
    ) -> Tick {
        let mut groups = Vec::with_capacity(self.groups.len());
        let mut transitions = Vec::new();

        for runtime in &mut self.groups {
            let (snapshot, transition) = runtime.evaluate(sensors, overrides, now).await;
            groups.push(snapshot);
            transitions.extend(transition);
        }

        Tick {
            snapshot: Snapshot {
                timestamp: unix_millis(),
                sensors: sensors.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                groups,
            },
            transitions,
        }
    }

    /// Applies a new configuration.
    ///
    /// Groups whose configuration is unchanged keep their engine and
    /// actuator state. Dropped or changed groups release their GPU fans
    /// before anything new is built.
    pub async fn reconfigure(&mut self, config: &Config) {
        let mut previous: Vec<GroupRuntime> = std::mem::take(&mut self.groups);

        for cfg in &config.fan_groups {
            let kept = previous
                .iter()
                .position(|runtime| runtime.cfg == *cfg && runtime.actuators.is_ok())
                .map(|idx| previous.swap_remove(idx));

            match kept {
                Some(runtime) => self.groups.push(runtime),
                None => {
                    if let Some(idx) = previous.iter().position(|r| r.cfg.id == cfg.id) {
                        let mut stale = previous.swap_remove(idx);
                        stale.release().await;
                    }
                    info!("Rebuilding fan group '{}'", cfg.id);
                    self.groups
                        .push(GroupRuntime::build(cfg.clone(), self.backend.as_ref()).await);
                }
            }
        }

        for mut stale in previous {
            info!("Fan group '{}' removed", stale.cfg.id);
            stale.release().await;
        }
    }

    /// Returns every GPU fan to automatic control. Failures are ignored.
    pub async fn shutdown(&mut self) {
        for runtime in &mut self.groups {
            runtime.release().await;
        }
        info!("All GPU fans returned to automatic control");
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
