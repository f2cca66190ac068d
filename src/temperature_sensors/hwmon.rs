use std::{path::PathBuf, time::Duration};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use log::debug;

use crate::{drivers::hwmon::read_temperature, sensors::TemperatureSensor};

/// One or more raw hwmon `temp*_input` files; reports the hottest.
pub struct HwmonSensor {
    id: String,
    paths: Vec<PathBuf>,
    timeout: Duration,
}

impl HwmonSensor {
    pub fn new(id: &str, paths: Vec<PathBuf>, timeout: Duration) -> Self {
        Self {
            id: id.to_string(),
            paths,
            timeout,
        }
    }
}

#[async_trait]
impl TemperatureSensor for HwmonSensor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_temperature(&self) -> Result<f64> {
        let mut hottest: Option<f64> = None;

        for path in &self.paths {
            match read_temperature(path, self.timeout).await {
                Ok(value) => hottest = Some(hottest.map_or(value, |h| h.max(value))),
                Err(e) => debug!("{}: {e:#}", path.display()),
            }
        }

        hottest.ok_or_else(|| anyhow!("no readable input for sensor '{}'", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn reports_hottest_readable_input() {
        let dir = TempDir::new().unwrap();
        let temp1 = dir.path().join("temp1_input");
        let temp2 = dir.path().join("temp2_input");
        std::fs::write(&temp1, "41000\n").unwrap();
        std::fs::write(&temp2, "57500\n").unwrap();

        let sensor = HwmonSensor::new(
            "nvme",
            vec![temp1, dir.path().join("temp3_input"), temp2],
            Duration::from_secs(1),
        );

        assert_eq!(sensor.read_temperature().await.unwrap(), 57.5);
    }

    #[tokio::test]
    async fn fails_when_nothing_is_readable() {
        let dir = TempDir::new().unwrap();
        let sensor = HwmonSensor::new(
            "nvme",
            vec![dir.path().join("temp1_input")],
            Duration::from_secs(1),
        );

        assert!(sensor.read_temperature().await.is_err());
    }
}
