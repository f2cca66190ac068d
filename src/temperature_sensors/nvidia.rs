use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use crate::{drivers::nvidia::read_gpu_temperature, sensors::TemperatureSensor};

/// GPU core temperature reported by `nvidia-smi`.
pub struct NvidiaGpuSensor {
    id: String,
    gpu_index: u32,
    timeout: Duration,
}

impl NvidiaGpuSensor {
    pub fn new(id: &str, gpu_index: u32, timeout: Duration) -> Self {
        Self {
            id: id.to_string(),
            gpu_index,
            timeout,
        }
    }
}

#[async_trait]
impl TemperatureSensor for NvidiaGpuSensor {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read_temperature(&self) -> Result<f64> {
        read_gpu_temperature(self.gpu_index, self.timeout).await
    }
}
