use anyhow::{Result, anyhow};
use async_trait::async_trait;
use lm_sensors::{
    LMSensors, SubFeatureRef,
    value::{Kind as ValueKind, Value},
};
use log::info;
use tokio::sync::Mutex;

use crate::sensors::TemperatureSensor;

struct Input(SubFeatureRef<'static>);

// SAFETY: libsensors (>= 3.6) guards all sensor access with an internal global mutex.
//         The `SubFeatureRef::value()` call is read-only.
//         Therefore, moving this pointer across threads cannot cause data races.
unsafe impl Send for Input {}
unsafe impl Sync for Input {}

/// Temperature input of one lm-sensors chip feature.
pub struct LmSensorSource {
    id: String,
    input: Mutex<Input>,
}

impl LmSensorSource {
    /// Finds the temperature input of `feature` on the chip named `chip`.
    pub fn discover(
        lmsensors: &'static LMSensors,
        id: &str,
        chip: &str,
        feature: &str,
    ) -> Result<Self> {
        let chip_ref = lmsensors
            .chip_iter(None)
            .find(|c| c.name().map(|n| n == chip).unwrap_or(false))
            .ok_or_else(|| anyhow!("chip '{chip}' not found"))?;

        let feature_ref = chip_ref
            .feature_iter()
            .find(|f| {
                f.name()
                    .and_then(|n| n.ok())
                    .map(|n| n == feature)
                    .unwrap_or(false)
            })
            .ok_or_else(|| anyhow!("feature '{feature}' not found on '{chip}'"))?;

        let input = feature_ref
            .sub_feature_iter()
            .find(|s| matches!(s.kind(), Some(ValueKind::TemperatureInput)))
            .ok_or_else(|| anyhow!("'{chip}:{feature}' has no temperature input"))?;

        info!("Sensor '{id}' bound to {chip}:{feature}");

        Ok(Self {
            id: id.to_string(),
            input: Mutex::new(Input(input)),
        })
    }
}

#[async_trait]
impl TemperatureSensor for LmSensorSource {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_temperature(&self) -> Result<f64> {
        match self.input.lock().await.0.value()? {
            Value::TemperatureInput(t) => Ok(t),
            _ => Err(anyhow!("non-temperature value")),
        }
    }
}
