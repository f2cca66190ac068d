//! Speed actuators and the per-group registry that owns them.

pub mod gpu;
pub mod stepped_pwm;

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde::{Deserialize, Serialize};

pub use gpu::GpuSpeedActuator;
pub use stepped_pwm::SteppedPwmActuator;

use crate::{
    config::{FanBindingCfg, FanGroupCfg, GpuCfg, ManualControlPolicy, TargetUnit},
    drivers::{GpuFanDriver, NvidiaSettings, PwmChannel, SysfsPwmChannel},
};

/// Deviation from target above which a fan reports `ADJ`.
pub const STATUS_TOLERANCE: f64 = 50.0;

/// Lower end of the RPM band percentages map onto for system fans.
const SYSTEM_RPM_FLOOR: f64 = 500.0;
/// Width of that band.
const SYSTEM_RPM_SPAN: f64 = 1500.0;

/// A profile target translated into an actuator command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetCommand {
    /// Open-loop percentage; 0 hands control back to the driver.
    Percent(f64),
    /// Closed-loop RPM tracking.
    Rpm(f64),
}

impl TargetCommand {
    pub fn new(target: f64, unit: TargetUnit) -> Self {
        match unit {
            TargetUnit::Percent => TargetCommand::Percent(target),
            TargetUnit::Rpm => TargetCommand::Rpm(target),
        }
    }

    /// RPM goal for a PWM fan; percentages are spread over the RPM band.
    pub fn system_rpm(self) -> u32 {
        let rpm = match self {
            TargetCommand::Rpm(rpm) => rpm,
            TargetCommand::Percent(pct) => SYSTEM_RPM_FLOOR + pct / 100.0 * SYSTEM_RPM_SPAN,
        };
        rpm.max(0.0).round() as u32
    }
}

/// Per-fan outcome of one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ADJ")]
    Adjusting,
}

impl FanStatus {
    pub fn from_deviation(measured: f64, target: f64) -> Self {
        if (measured - target).abs() > STATUS_TOLERANCE {
            FanStatus::Adjusting
        } else {
            FanStatus::Ok
        }
    }
}

/// Measured state of a fan after it was driven.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanOutcome {
    pub rpm: u32,
    /// PWM byte for system fans, percentage for GPU fans.
    pub drive: u8,
    pub target: f64,
    pub unit: TargetUnit,
    pub status: FanStatus,
}

/// Controller bound to one fan entry of the configuration.
pub enum Actuator {
    Pwm(SteppedPwmActuator),
    Gpu(GpuSpeedActuator),
}

impl Actuator {
    /// Drives the fan toward `command` and reports the result.
    pub async fn drive(&mut self, command: TargetCommand) -> FanOutcome {
        match self {
            Actuator::Pwm(pwm) => {
                let target = command.system_rpm();
                pwm.set_target_rpm(target);
                pwm.update().await;
                FanOutcome {
                    rpm: pwm.current_rpm(),
                    drive: pwm.pwm(),
                    target: f64::from(target),
                    unit: TargetUnit::Rpm,
                    status: FanStatus::from_deviation(
                        f64::from(pwm.current_rpm()),
                        f64::from(target),
                    ),
                }
            }
            Actuator::Gpu(gpu) => match command {
                TargetCommand::Rpm(rpm) => {
                    let target = rpm.max(0.0).round() as u32;
                    gpu.set_target_rpm(target);
                    gpu.update().await;
                    FanOutcome {
                        rpm: gpu.current_rpm(),
                        drive: gpu.current_percent(),
                        target: f64::from(target),
                        unit: TargetUnit::Rpm,
                        status: FanStatus::from_deviation(
                            f64::from(gpu.current_rpm()),
                            f64::from(target),
                        ),
                    }
                }
                TargetCommand::Percent(pct) => {
                    let pct = pct.clamp(0.0, 100.0);
                    gpu.set_target_rpm(0);
                    let wanted = pct as u8;
                    // A reset is only needed while manual control is active.
                    let issue = match gpu.policy() {
                        ManualControlPolicy::EveryCommand => wanted != 0 || gpu.is_manual_active(),
                        ManualControlPolicy::OnTransition => {
                            wanted != gpu.current_percent()
                                || (wanted == 0 && gpu.is_manual_active())
                        }
                    };
                    if issue {
                        gpu.set_speed_percent(pct).await;
                    }
                    gpu.refresh().await;
                    let status = if wanted == 0 {
                        FanStatus::Ok
                    } else {
                        FanStatus::from_deviation(f64::from(gpu.actual_percent()), pct)
                    };
                    FanOutcome {
                        rpm: gpu.current_rpm(),
                        drive: gpu.current_percent(),
                        target: pct,
                        unit: TargetUnit::Percent,
                        status,
                    }
                }
            },
        }
    }

    /// Returns GPU fans to automatic control; no-op for PWM fans.
    pub async fn release(&mut self) {
        if let Actuator::Gpu(gpu) = self {
            gpu.reset().await;
        }
    }
}

/// Opens hardware channels for fan bindings.
#[async_trait]
pub trait HardwareBackend: Send + Sync {
    async fn open_pwm(&self, binding: &FanBindingCfg) -> Result<Box<dyn PwmChannel>>;

    fn gpu_driver(&self, gpu: &GpuCfg) -> Arc<dyn GpuFanDriver>;
}

/// sysfs and `nvidia-settings` backed hardware.
pub struct SystemHardware {
    timeout: Duration,
}

impl SystemHardware {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl HardwareBackend for SystemHardware {
    async fn open_pwm(&self, binding: &FanBindingCfg) -> Result<Box<dyn PwmChannel>> {
        match binding {
            FanBindingCfg::System {
                pwm_path,
                input_path,
                ..
            } => Ok(Box::new(SysfsPwmChannel::open(
                pwm_path,
                input_path,
                self.timeout,
            )?)),
            FanBindingCfg::Nvidia { id, .. } => {
                anyhow::bail!("Fan '{id}' is not a PWM fan")
            }
        }
    }

    fn gpu_driver(&self, gpu: &GpuCfg) -> Arc<dyn GpuFanDriver> {
        Arc::new(NvidiaSettings::new(gpu.display.clone(), self.timeout))
    }
}

/// A bound fan and its controller.
pub struct FanSlot {
    pub id: String,
    pub name: String,
    pub actuator: Actuator,
}

/// All actuators of one group, built once from its fan bindings.
pub struct ActuatorRegistry {
    slots: Vec<FanSlot>,
}

impl ActuatorRegistry {
    /// Builds every actuator of `group`.
    ///
    /// Fails when a PWM channel cannot be opened; GPU actuators are reset
    /// to automatic control on creation.
    pub async fn build(group: &FanGroupCfg, backend: &dyn HardwareBackend) -> Result<Self> {
        let mut slots = Vec::with_capacity(group.fans.len());
        let mut gpu_driver = None;

        for binding in &group.fans {
            let actuator = match binding {
                FanBindingCfg::System { .. } => {
                    let channel = backend.open_pwm(binding).await?;
                    Actuator::Pwm(SteppedPwmActuator::new(channel).await)
                }
                FanBindingCfg::Nvidia {
                    gpu_index,
                    fan_indices,
                    ..
                } => {
                    let driver = gpu_driver
                        .get_or_insert_with(|| backend.gpu_driver(&group.gpu))
                        .clone();
                    let mut gpu = GpuSpeedActuator::new(
                        driver,
                        *gpu_index,
                        fan_indices.clone(),
                        group.gpu.manual_control,
                    );
                    gpu.reset().await;
                    Actuator::Gpu(gpu)
                }
            };

            info!(
                "Fan '{}' of group '{}' bound",
                binding.id(),
                group.id
            );
            slots.push(FanSlot {
                id: binding.id().to_string(),
                name: binding.name().to_string(),
                actuator,
            });
        }

        Ok(Self { slots })
    }

    pub fn slots_mut(&mut self) -> impl Iterator<Item = &mut FanSlot> {
        self.slots.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Returns every GPU fan to automatic control.
    pub async fn release_all(&mut self) {
        for slot in &mut self.slots {
            slot.actuator.release().await;
        }
    }
}
