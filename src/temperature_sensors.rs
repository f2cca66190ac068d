//! Concrete temperature sources built from the sensor configuration.

pub mod hwmon;
pub mod lm_sensor;
pub mod nvidia;

use std::time::Duration;

use lm_sensors::LMSensors;
use log::warn;

use crate::{config::SensorCfg, sensors::TemperatureSensor};

pub use hwmon::HwmonSensor;
pub use lm_sensor::LmSensorSource;
pub use nvidia::NvidiaGpuSensor;

/// Builds one source per configured sensor.
///
/// lm-sensors entries need the library; they are skipped with a warning
/// when it is missing or the chip/feature cannot be found.
pub fn build(
    cfg: &[SensorCfg],
    lmsensors: Option<&'static LMSensors>,
    timeout: Duration,
) -> Vec<Box<dyn TemperatureSensor>> {
    let mut sensors: Vec<Box<dyn TemperatureSensor>> = Vec::with_capacity(cfg.len());

    for sensor in cfg {
        match sensor {
            SensorCfg::LmSensors { id, chip, feature } => match lmsensors {
                Some(lms) => match LmSensorSource::discover(lms, id, chip, feature) {
                    Ok(source) => sensors.push(Box::new(source)),
                    Err(e) => warn!("Sensor '{id}' unavailable: {e:#}"),
                },
                None => warn!("Sensor '{id}' needs lm-sensors, which is not available"),
            },
            SensorCfg::Hwmon { id, paths } => {
                sensors.push(Box::new(HwmonSensor::new(id, paths.clone(), timeout)));
            }
            SensorCfg::Nvidia { id, gpu_index } => {
                sensors.push(Box::new(NvidiaGpuSensor::new(id, *gpu_index, timeout)));
            }
        }
    }

    sensors
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn builds_sources_without_lm_sensors() {
        let cfg = vec![
            SensorCfg::Hwmon {
                id: "cpu".to_string(),
                paths: vec!["/sys/class/hwmon/hwmon2/temp1_input".into()],
            },
            SensorCfg::Nvidia {
                id: "gpu".to_string(),
                gpu_index: 0,
            },
            SensorCfg::LmSensors {
                id: "board".to_string(),
                chip: "nct6798-isa-0290".to_string(),
                feature: "SYSTIN".to_string(),
            },
        ];

        let sensors = build(&cfg, None, Duration::from_secs(1));
        let ids: Vec<_> = sensors.iter().map(|s| s.id().to_string()).collect();
        assert_eq!(ids, vec!["cpu", "gpu"]);
    }
}
