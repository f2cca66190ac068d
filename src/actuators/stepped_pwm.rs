//! Closed-loop RPM tracking over a linear PWM channel.

use log::debug;

use crate::drivers::PwmChannel;

/// Dead band around the target in RPM.
pub const RPM_TOLERANCE: u32 = 30;
/// Drive step per tick on the 0-255 scale.
pub const STEP: i32 = 2;
/// Error above which the step is doubled.
pub const LARGE_ERROR: i64 = 200;
pub const DEFAULT_TARGET_RPM: u32 = 1200;
/// Drive value assumed when the channel cannot be read at startup.
pub const FALLBACK_PWM: u8 = 128;

/// Incremental controller stepping a PWM byte toward a target RPM.
pub struct SteppedPwmActuator {
    channel: Box<dyn PwmChannel>,
    target_rpm: u32,
    current_rpm: u32,
    pwm: u8,
}

impl SteppedPwmActuator {
    /// Takes software control of the channel and seeds the drive value from it.
    pub async fn new(channel: Box<dyn PwmChannel>) -> Self {
        if let Err(e) = channel.enable_manual().await {
            debug!("Manual PWM mode not enabled: {e}");
        }
        let pwm = channel.read_pwm().await.unwrap_or(FALLBACK_PWM);

        Self {
            channel,
            target_rpm: DEFAULT_TARGET_RPM,
            current_rpm: 0,
            pwm,
        }
    }

    pub fn set_target_rpm(&mut self, rpm: u32) {
        self.target_rpm = rpm;
    }

    pub fn target_rpm(&self) -> u32 {
        self.target_rpm
    }

    pub fn current_rpm(&self) -> u32 {
        self.current_rpm
    }

    pub fn pwm(&self) -> u8 {
        self.pwm
    }

    /// Reads the tachometer and steps the drive value once if outside the band.
    ///
    /// Unreadable RPM counts as 0. A failed write keeps the new drive value.
    pub async fn update(&mut self) {
        self.current_rpm = self.channel.read_rpm().await.unwrap_or(0);

        let error = i64::from(self.target_rpm) - i64::from(self.current_rpm);
        if error.unsigned_abs() <= u64::from(RPM_TOLERANCE) {
            return;
        }

        let step = if error.abs() > LARGE_ERROR { STEP * 2 } else { STEP };
        let next = if error > 0 {
            i32::from(self.pwm) + step
        } else {
            i32::from(self.pwm) - step
        };
        self.pwm = next.clamp(0, 255) as u8;

        if let Err(e) = self.channel.write_pwm(self.pwm).await {
            debug!("PWM write of {} failed: {e}", self.pwm);
        }
    }
}
