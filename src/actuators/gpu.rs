//! GPU fan actuator with open-loop percentage and closed-loop RPM modes.

use std::sync::Arc;

use log::debug;

use crate::{config::ManualControlPolicy, drivers::GpuFanDriver};

/// Dead band around the RPM target.
pub const RPM_TOLERANCE: u32 = 50;
/// Lowest percentage the closed loop may command.
pub const ANTI_STALL_FLOOR: u8 = 20;
/// RPM targets at or below this are not tracked.
pub const CLOSED_LOOP_MIN_TARGET: u32 = 100;

/// Drives one or more fans of one GPU as a unit.
pub struct GpuSpeedActuator {
    driver: Arc<dyn GpuFanDriver>,
    gpu_index: u32,
    fan_indices: Vec<u32>,
    policy: ManualControlPolicy,
    current_pct: u8,
    actual_pct: u8,
    current_rpm: u32,
    target_rpm: u32,
    manual_active: bool,
}

impl GpuSpeedActuator {
    /// Creates the actuator in driver-automatic state; no command is issued.
    pub fn new(
        driver: Arc<dyn GpuFanDriver>,
        gpu_index: u32,
        fan_indices: Vec<u32>,
        policy: ManualControlPolicy,
    ) -> Self {
        Self {
            driver,
            gpu_index,
            fan_indices,
            policy,
            current_pct: 0,
            actual_pct: 0,
            current_rpm: 0,
            target_rpm: 0,
            manual_active: false,
        }
    }

    pub fn is_manual_active(&self) -> bool {
        self.manual_active
    }

    pub fn policy(&self) -> ManualControlPolicy {
        self.policy
    }

    /// Last commanded percentage; 0 while under automatic control.
    pub fn current_percent(&self) -> u8 {
        self.current_pct
    }

    /// Last measured percentage of the first bound fan.
    pub fn actual_percent(&self) -> u8 {
        self.actual_pct
    }

    pub fn current_rpm(&self) -> u32 {
        self.current_rpm
    }

    pub fn target_rpm(&self) -> u32 {
        self.target_rpm
    }

    pub fn set_target_rpm(&mut self, rpm: u32) {
        self.target_rpm = rpm;
    }

    /// Hands the fans back to the driver's automatic curve.
    pub async fn reset(&mut self) {
        if let Err(e) = self.driver.set_manual_control(self.gpu_index, false).await {
            debug!("GPU {} reset to auto failed: {e}", self.gpu_index);
        }
        self.manual_active = false;
        self.current_pct = 0;
    }

    /// Open-loop command. Values are clamped to 0-100; 0 means automatic.
    pub async fn set_speed_percent(&mut self, percent: f64) {
        let percent = percent.clamp(0.0, 100.0) as u8;
        if percent == 0 {
            self.reset().await;
            return;
        }

        let reassert = match self.policy {
            ManualControlPolicy::EveryCommand => true,
            ManualControlPolicy::OnTransition => !self.manual_active,
        };
        self.apply(percent, reassert).await;
    }

    /// Reads RPM and percentage of the first bound fan.
    ///
    /// A failed read reports 0 RPM and keeps the last known percentage.
    pub async fn refresh(&mut self) {
        let Some(&fan) = self.fan_indices.first() else {
            self.current_rpm = 0;
            return;
        };

        match self.driver.read_fan(fan).await {
            Ok(reading) => {
                self.current_rpm = reading.rpm;
                self.actual_pct = reading.percent;
            }
            Err(e) => {
                debug!("GPU fan {fan} read failed: {e}");
                self.current_rpm = 0;
            }
        }
    }

    /// Closed-loop step toward the RPM target.
    ///
    /// Inert while the target is at or below [`CLOSED_LOOP_MIN_TARGET`].
    pub async fn update(&mut self) {
        self.refresh().await;

        if !self.manual_active {
            self.current_pct = self.actual_pct;
        }

        if self.target_rpm <= CLOSED_LOOP_MIN_TARGET {
            return;
        }

        let error = i64::from(self.target_rpm) - i64::from(self.current_rpm);
        if error.unsigned_abs() <= u64::from(RPM_TOLERANCE) {
            return;
        }

        let step = match error.abs() {
            e if e > 400 => 5,
            e if e > 200 => 2,
            _ => 1,
        };
        let next = if error > 0 {
            i32::from(self.current_pct) + step
        } else {
            i32::from(self.current_pct) - step
        };
        let next = next.clamp(i32::from(ANTI_STALL_FLOOR), 100) as u8;

        self.apply(next, true).await;
    }

    async fn apply(&mut self, percent: u8, reassert_manual: bool) {
        if reassert_manual {
            if let Err(e) = self.driver.set_manual_control(self.gpu_index, true).await {
                debug!("GPU {} manual control failed: {e}", self.gpu_index);
            }
        }
        self.manual_active = true;

        if let Err(e) = self.driver.set_fan_speed(&self.fan_indices, percent).await {
            debug!("GPU fan speed {percent}% failed: {e}");
        }
        self.current_pct = percent;
    }
}
