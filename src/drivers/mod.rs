//! Hardware channels behind the actuators.
//!
//! Each channel is a trait so actuators can be driven by simulated fans
//! in tests and by sysfs or the NVIDIA tools in production.

pub mod hwmon;
pub mod nvidia;

use std::{future::Future, time::Duration};

use anyhow::{Result, anyhow};

pub use hwmon::{PwmChannel, SysfsPwmChannel};
pub use nvidia::{FanReading, GpuFanDriver, NvidiaSettings};

/// Runs a hardware operation with an upper time bound.
pub(crate) async fn bounded<T, F>(what: &str, limit: Duration, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, operation)
        .await
        .map_err(|_| anyhow!("{what} timed out after {}ms", limit.as_millis()))?
}
