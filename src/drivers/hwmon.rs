//! sysfs hwmon PWM channels.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use super::bounded;

/// Linear drive channel with tachometer feedback.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PwmChannel: Send + Sync {
    /// Current fan speed in RPM.
    async fn read_rpm(&self) -> Result<u32>;

    /// Current drive value (0-255).
    async fn read_pwm(&self) -> Result<u8>;

    async fn write_pwm(&self, value: u8) -> Result<()>;

    /// Switches the channel from firmware to software control.
    async fn enable_manual(&self) -> Result<()>;
}

/// `pwmN` / `fanN_input` pair of a hwmon device.
#[derive(Debug, Clone)]
pub struct SysfsPwmChannel {
    pwm_path: PathBuf,
    input_path: PathBuf,
    timeout: Duration,
}

impl SysfsPwmChannel {
    /// Opens the channel, failing when the PWM file does not exist.
    pub fn open(pwm_path: &Path, input_path: &Path, timeout: Duration) -> Result<Self> {
        if !pwm_path.exists() {
            bail!("PWM channel {} does not exist", pwm_path.display());
        }

        Ok(Self {
            pwm_path: pwm_path.to_path_buf(),
            input_path: input_path.to_path_buf(),
            timeout,
        })
    }

    fn enable_path(&self) -> PathBuf {
        let mut name = self.pwm_path.as_os_str().to_owned();
        name.push("_enable");
        PathBuf::from(name)
    }
}

async fn read_number<T: std::str::FromStr>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    content
        .trim()
        .parse()
        .map_err(|_| anyhow::anyhow!("Failed to parse '{}' from {}", content.trim(), path.display()))
}

async fn write_value(path: &Path, value: &str) -> Result<()> {
    tokio::fs::write(path, value)
        .await
        .with_context(|| format!("Failed to write '{value}' to {}", path.display()))
}

#[async_trait]
impl PwmChannel for SysfsPwmChannel {
    async fn read_rpm(&self) -> Result<u32> {
        bounded("fan read", self.timeout, read_number(&self.input_path)).await
    }

    async fn read_pwm(&self) -> Result<u8> {
        bounded("pwm read", self.timeout, read_number(&self.pwm_path)).await
    }

    async fn write_pwm(&self, value: u8) -> Result<()> {
        bounded(
            "pwm write",
            self.timeout,
            write_value(&self.pwm_path, &value.to_string()),
        )
        .await
    }

    async fn enable_manual(&self) -> Result<()> {
        bounded("pwm enable", self.timeout, write_value(&self.enable_path(), "1")).await
    }
}

/// Reads an hwmon temperature file in degrees Celsius.
pub async fn read_temperature(path: &Path, timeout: Duration) -> Result<f64> {
    let millidegrees: i64 = bounded("temperature read", timeout, read_number(path)).await?;
    Ok(millidegrees as f64 / 1000.0)
}
