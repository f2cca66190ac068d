//! Per-group mode decision engine.
//!
//! Turns a sensor map into a severity level with an escalation delay and a
//! de-escalation hold, so short spikes do not ramp fans and recovered
//! temperatures do not make them oscillate.

use std::{collections::HashMap, fmt, time::Duration, time::Instant};

use crate::config::{FanGroupCfg, Level};

/// Sensor id to current reading.
pub type SensorValues = HashMap<String, f64>;

/// Human-readable engine status. Never used for decisions.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    Init,
    /// An escalation waits for confirmation.
    Pending {
        level: Level,
        remaining: Duration,
        first_seen: bool,
    },
    Escalated,
    /// A de-escalation waits for the hold time to expire.
    Locked { remaining: Duration },
    DeEscalated,
    Stable,
    /// The group runs from an override.
    Manual,
}

impl fmt::Display for EngineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineStatus::Init => write!(f, "Init"),
            EngineStatus::Pending {
                level,
                remaining,
                first_seen: true,
            } => write!(f, "Pending Lvl{level} ({}s)", remaining.as_secs_f64()),
            EngineStatus::Pending {
                level, remaining, ..
            } => write!(f, "Pending Lvl{level} ({:.1}s)", remaining.as_secs_f64()),
            EngineStatus::Escalated => write!(f, "Escalated"),
            EngineStatus::Locked { remaining } => {
                write!(f, "Locked (Hold {:.0}s)", remaining.as_secs_f64())
            }
            EngineStatus::DeEscalated => write!(f, "De-escalated"),
            EngineStatus::Stable => write!(f, "Stable"),
            EngineStatus::Manual => write!(f, "MANUAL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pending {
    pub level: Level,
    pub since: Instant,
}

/// Mutable decision state of one group.
#[derive(Debug, Clone)]
pub struct EngineState {
    pub current_mode: Level,
    pub pending: Option<Pending>,
    /// `None` until the first committed change; no hold applies before it.
    pub last_mode_change: Option<Instant>,
    pub status: EngineStatus,
}

impl Default for EngineState {
    fn default() -> Self {
        Self {
            current_mode: 0,
            pending: None,
            last_mode_change: None,
            status: EngineStatus::Init,
        }
    }
}

/// Threshold table plus timing of one fan group.
#[derive(Debug, Clone)]
pub struct ModeDecisionEngine {
    /// `levels[n]` holds the (sensor, limit) pairs of level `n`; level 0 is empty.
    levels: Vec<Vec<(String, f64)>>,
    delay_up: Duration,
    hold_time: Duration,
    state: EngineState,
}

impl ModeDecisionEngine {
    /// Builds the engine for a group.
    ///
    /// Only thresholds with a limit whose sensor is listed in
    /// `temp_sources` take part; an empty source list disables the filter.
    pub fn new(group: &FanGroupCfg) -> Self {
        let monitored = |source: &str| {
            group.temp_sources.is_empty() || group.temp_sources.iter().any(|s| s == source)
        };

        let levels = group
            .profiles
            .iter()
            .enumerate()
            .map(|(level, profile)| {
                if level == 0 {
                    return Vec::new();
                }
                profile
                    .thresholds
                    .iter()
                    .filter(|(source, _)| monitored(source))
                    .filter_map(|(source, limit)| limit.map(|limit| (source.clone(), limit)))
                    .collect()
            })
            .collect();

        Self {
            levels,
            delay_up: group.delay_up(),
            hold_time: group.hold_time(),
            state: EngineState::default(),
        }
    }

    pub fn state(&self) -> &EngineState {
        &self.state
    }

    pub fn current_mode(&self) -> Level {
        self.state.current_mode
    }

    pub fn status(&self) -> &EngineStatus {
        &self.state.status
    }

    /// Highest level whose predicate holds for `sensors`, or 0.
    ///
    /// A level holds when any of its sensors reads strictly above its
    /// limit. Missing sensors read as 0.
    pub fn instant_level(&self, sensors: &SensorValues) -> Level {
        self.levels
            .iter()
            .enumerate()
            .skip(1)
            .rev()
            .find(|(_, thresholds)| {
                thresholds.iter().any(|(source, limit)| {
                    sensors.get(source).copied().unwrap_or(0.0) > *limit
                })
            })
            .map(|(level, _)| level)
            .unwrap_or(0)
    }

    /// Advances the state machine by one tick and returns the current mode.
    pub fn update(&mut self, sensors: &SensorValues, now: Instant) -> Level {
        let instant = self.instant_level(sensors);
        let current = self.state.current_mode;

        if instant > current {
            match self.state.pending {
                Some(pending) if pending.level == instant => {
                    let elapsed = now.saturating_duration_since(pending.since);
                    if elapsed >= self.delay_up {
                        self.commit(instant, now, EngineStatus::Escalated);
                    } else {
                        self.state.status = EngineStatus::Pending {
                            level: instant,
                            remaining: self.delay_up - elapsed,
                            first_seen: false,
                        };
                    }
                }
                _ => {
                    self.state.pending = Some(Pending {
                        level: instant,
                        since: now,
                    });
                    self.state.status = EngineStatus::Pending {
                        level: instant,
                        remaining: self.delay_up,
                        first_seen: true,
                    };
                }
            }
        } else if instant < current {
            self.state.pending = None;
            let held = self
                .state
                .last_mode_change
                .map(|changed| now.saturating_duration_since(changed));

            match held {
                Some(held) if held < self.hold_time => {
                    self.state.status = EngineStatus::Locked {
                        remaining: self.hold_time - held,
                    };
                }
                _ => self.commit(instant, now, EngineStatus::DeEscalated),
            }
        } else {
            self.state.pending = None;
            self.state.status = EngineStatus::Stable;
        }

        self.state.current_mode
    }

    /// Marks the group as driven by an override.
    ///
    /// The committed mode is left alone and any pending escalation is
    /// dropped so it has to be confirmed again once the override ends.
    pub fn mark_manual(&mut self) {
        self.state.pending = None;
        self.state.status = EngineStatus::Manual;
    }

    fn commit(&mut self, level: Level, now: Instant, status: EngineStatus) {
        self.state.current_mode = level;
        self.state.last_mode_change = Some(now);
        self.state.pending = None;
        self.state.status = status;
    }
}
