//! Temperature sensor abstraction and the per-tick aggregator.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures::future::join_all;
use lm_sensors::LMSensors;
use log::debug;

use crate::{config::SensorCfg, drivers::bounded, engine::SensorValues, temperature_sensors};

#[async_trait]
pub trait TemperatureSensor: Send + Sync {
    /// Identifier the sensor is referenced by in profile thresholds.
    fn id(&self) -> &str;

    /// Current temperature in degrees Celsius.
    async fn read_temperature(&self) -> Result<f64>;
}

/// Reads every configured sensor into one [`SensorValues`] map.
pub struct SensorAggregator {
    sensors: Vec<Box<dyn TemperatureSensor>>,
    timeout: Duration,
}

impl SensorAggregator {
    pub fn new(sensors: Vec<Box<dyn TemperatureSensor>>, timeout: Duration) -> Self {
        Self { sensors, timeout }
    }

    /// Builds sources for `cfg`. lm-sensors entries are skipped when the
    /// library is unavailable.
    pub fn from_config(
        cfg: &[SensorCfg],
        lmsensors: Option<&'static LMSensors>,
        timeout: Duration,
    ) -> Self {
        Self::new(temperature_sensors::build(cfg, lmsensors, timeout), timeout)
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    /// Reads all sensors concurrently. Failed or slow sensors are left out.
    pub async fn read_all(&self) -> SensorValues {
        let reads = self.sensors.iter().map(|sensor| async move {
            let value = bounded(sensor.id(), self.timeout, sensor.read_temperature()).await;
            (sensor.id(), value)
        });

        join_all(reads)
            .await
            .into_iter()
            .filter_map(|(id, value)| match value {
                Ok(celsius) => Some((id.to_string(), celsius)),
                Err(e) => {
                    debug!("Sensor '{id}' skipped: {e:#}");
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use anyhow::anyhow;
    use pretty_assertions::assert_eq;

    pub(crate) struct FixedSensor {
        pub id: String,
        pub value: Option<f64>,
        pub delay: Duration,
    }

    impl FixedSensor {
        pub fn new(id: &str, value: Option<f64>) -> Self {
            Self {
                id: id.to_string(),
                value,
                delay: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl TemperatureSensor for FixedSensor {
        fn id(&self) -> &str {
            &self.id
        }

        async fn read_temperature(&self) -> Result<f64> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.value.ok_or_else(|| anyhow!("sensor gone"))
        }
    }

    #[tokio::test]
    async fn failed_sensors_are_dropped() {
        let aggregator = SensorAggregator::new(
            vec![
                Box::new(FixedSensor::new("cpu", Some(48.5))),
                Box::new(FixedSensor::new("nvme", None)),
            ],
            Duration::from_secs(1),
        );

        let values = aggregator.read_all().await;
        assert_eq!(values.len(), 1);
        assert_eq!(values.get("cpu"), Some(&48.5));
    }

    #[tokio::test]
    async fn slow_sensor_times_out() {
        let mut slow = FixedSensor::new("gpu", Some(70.0));
        slow.delay = Duration::from_secs(10);
        let aggregator = SensorAggregator::new(
            vec![Box::new(slow), Box::new(FixedSensor::new("cpu", Some(40.0)))],
            Duration::from_millis(100),
        );

        let values = aggregator.read_all().await;
        assert_eq!(values.get("gpu"), None);
        assert_eq!(values.get("cpu"), Some(&40.0));
    }
}
