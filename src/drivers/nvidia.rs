//! NVIDIA fan control through `nvidia-settings` and `nvidia-smi`.

use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::bounded;

/// Measured state of one GPU fan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanReading {
    pub rpm: u32,
    pub percent: u8,
}

/// Vendor channel for GPU fans.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GpuFanDriver: Send + Sync {
    /// Switches between manual (`true`) and driver automatic control.
    async fn set_manual_control(&self, gpu_index: u32, enabled: bool) -> Result<()>;

    /// Sets every listed fan to `percent` in one command.
    async fn set_fan_speed(&self, fan_indices: &[u32], percent: u8) -> Result<()>;

    async fn read_fan(&self, fan_index: u32) -> Result<FanReading>;
}

/// `nvidia-settings` bound to one X display.
#[derive(Debug, Clone)]
pub struct NvidiaSettings {
    display: String,
    timeout: Duration,
}

impl NvidiaSettings {
    pub fn new(display: impl Into<String>, timeout: Duration) -> Self {
        Self {
            display: display.into(),
            timeout,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        let mut full = vec!["-c".to_string(), self.display.clone()];
        full.extend(args);
        run_tool("nvidia-settings", &full, self.timeout).await
    }
}

#[async_trait]
impl GpuFanDriver for NvidiaSettings {
    async fn set_manual_control(&self, gpu_index: u32, enabled: bool) -> Result<()> {
        let state = u8::from(enabled);
        self.run(vec![
            "-a".to_string(),
            format!("[gpu:{gpu_index}]/GPUFanControlState={state}"),
        ])
        .await
        .map(|_| ())
    }

    async fn set_fan_speed(&self, fan_indices: &[u32], percent: u8) -> Result<()> {
        let args = fan_indices
            .iter()
            .flat_map(|idx| {
                [
                    "-a".to_string(),
                    format!("[fan:{idx}]/GPUTargetFanSpeed={percent}"),
                ]
            })
            .collect();
        self.run(args).await.map(|_| ())
    }

    async fn read_fan(&self, fan_index: u32) -> Result<FanReading> {
        let output = self
            .run(vec![
                "-t".to_string(),
                "-q".to_string(),
                format!("[fan:{fan_index}]/GPUCurrentFanSpeedRPM"),
                "-q".to_string(),
                format!("[fan:{fan_index}]/GPUCurrentFanSpeed"),
            ])
            .await?;
        parse_fan_reading(&output)
    }
}

/// Parses the terse two-line answer: RPM first, percent second.
fn parse_fan_reading(output: &str) -> Result<FanReading> {
    let mut values = output.lines().map(str::trim).filter(|line| !line.is_empty());

    let rpm = values
        .next()
        .and_then(parse_leading_number)
        .ok_or_else(|| anyhow!("missing fan RPM in '{output}'"))?;
    let percent = values
        .next()
        .and_then(parse_leading_number)
        .ok_or_else(|| anyhow!("missing fan percentage in '{output}'"))?;

    Ok(FanReading {
        rpm,
        percent: u8::try_from(percent.min(100)).unwrap_or(100),
    })
}

fn parse_leading_number(text: &str) -> Option<u32> {
    let digits: String = text.chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

/// GPU core temperature in degrees Celsius from `nvidia-smi`.
pub async fn read_gpu_temperature(gpu_index: u32, timeout: Duration) -> Result<f64> {
    let args = [
        "--query-gpu=temperature.gpu".to_string(),
        "--format=csv,noheader,nounits".to_string(),
        format!("--id={gpu_index}"),
    ];
    let output = run_tool("nvidia-smi", &args, timeout).await?;

    output
        .trim()
        .parse::<f64>()
        .with_context(|| format!("unexpected nvidia-smi output '{}'", output.trim()))
}

/// Runs an external tool with a time bound, returning its stdout.
async fn run_tool(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    debug!("{program} {}", args.join(" "));

    let output = bounded(program, timeout, async {
        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to run {program}"))
    })
    .await?;

    if !output.status.success() {
        bail!(
            "{program} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
