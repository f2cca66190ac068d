use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use anyhow::Result;
use async_trait::async_trait;
use fanctld::{
    actuators::{FanStatus, HardwareBackend},
    config::{Config, FanBindingCfg, GpuCfg, OverrideMap},
    drivers::{FanReading, GpuFanDriver, PwmChannel},
    orchestrator::Orchestrator,
};

const CONFIG: &str = r#"{
    "sensors": [{ "kind": "hwmon", "id": "cpu", "paths": ["/sys/class/hwmon/hwmon2/temp1_input"] }],
    "fan_groups": [
        {
            "id": "system", "name": "Chassis", "type": "system",
            "temp_sources": ["cpu"],
            "fans": [{ "type": "system", "id": "rear", "name": "Rear",
                       "pwm_path": "/sys/class/hwmon/hwmon3/pwm1",
                       "input_path": "/sys/class/hwmon/hwmon3/fan1_input" }],
            "profiles": [
                { "name": "Quiet", "target": 1200 },
                { "name": "Load", "target": 1600, "thresholds": { "cpu": 60 } },
                { "name": "Hot", "target": 2000, "thresholds": { "cpu": 70 } }
            ],
            "delay_up": 5, "hold_time": 40
        },
        {
            "id": "gpu", "name": "GPU", "type": "nvidia",
            "fans": [{ "type": "nvidia", "id": "gpu0", "name": "GPU 0" }],
            "profiles": [{ "name": "Auto", "target": 0 }]
        }
    ]
}"#;

/// Fan whose tachometer follows the drive value linearly.
struct SimulatedFan {
    pwm: Arc<Mutex<u8>>,
}

#[async_trait]
impl PwmChannel for SimulatedFan {
    async fn read_rpm(&self) -> Result<u32> {
        Ok(u32::from(*self.pwm.lock().unwrap()) * 8)
    }

    async fn read_pwm(&self) -> Result<u8> {
        Ok(*self.pwm.lock().unwrap())
    }

    async fn write_pwm(&self, value: u8) -> Result<()> {
        *self.pwm.lock().unwrap() = value;
        Ok(())
    }

    async fn enable_manual(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Default)]
struct GpuLog {
    manual: Mutex<Vec<bool>>,
}

#[async_trait]
impl GpuFanDriver for GpuLog {
    async fn set_manual_control(&self, _gpu_index: u32, enabled: bool) -> Result<()> {
        self.manual.lock().unwrap().push(enabled);
        Ok(())
    }

    async fn set_fan_speed(&self, _fan_indices: &[u32], _percent: u8) -> Result<()> {
        Ok(())
    }

    async fn read_fan(&self, _fan_index: u32) -> Result<FanReading> {
        Ok(FanReading {
            rpm: 1100,
            percent: 35,
        })
    }
}

struct Bench {
    pwm: Arc<Mutex<u8>>,
    gpu: Arc<GpuLog>,
}

#[async_trait]
impl HardwareBackend for Bench {
    async fn open_pwm(&self, _binding: &FanBindingCfg) -> Result<Box<dyn PwmChannel>> {
        Ok(Box::new(SimulatedFan {
            pwm: self.pwm.clone(),
        }))
    }

    fn gpu_driver(&self, _gpu: &GpuCfg) -> Arc<dyn GpuFanDriver> {
        self.gpu.clone()
    }
}

async fn bench() -> (Orchestrator, Arc<Bench>) {
    let config: Config = serde_json::from_str(CONFIG).unwrap();
    config.validate().unwrap();

    let bench = Arc::new(Bench {
        pwm: Arc::new(Mutex::new(150)),
        gpu: Arc::new(GpuLog::default()),
    });
    (Orchestrator::build(&config, bench.clone()).await, bench)
}

fn cpu(value: f64) -> HashMap<String, f64> {
    [("cpu".to_string(), value)].into_iter().collect()
}

#[tokio::test]
async fn sustained_heat_escalates_and_cooling_waits_for_hold() {
    let (mut orchestrator, _bench) = bench().await;
    let overrides = OverrideMap::new();
    let start = Instant::now();
    let at = |secs: u64| start + Duration::from_secs(secs);

    let mut modes = Vec::new();
    for secs in 0..6 {
        let tick = orchestrator.evaluate(&cpu(75.0), &overrides, at(secs)).await;
        modes.push(tick.snapshot.groups[0].mode);
    }
    assert_eq!(modes, vec![0, 0, 0, 0, 0, 2]);

    for secs in 6..45 {
        let tick = orchestrator.evaluate(&cpu(50.0), &overrides, at(secs)).await;
        let system = &tick.snapshot.groups[0];
        assert_eq!(system.mode, 2, "de-escalated after {secs}s");
        assert_eq!(system.target, 2000.0);
        assert!(system.status.starts_with("Locked"), "{}", system.status);
    }

    let tick = orchestrator.evaluate(&cpu(50.0), &overrides, at(45)).await;
    assert_eq!(tick.snapshot.groups[0].mode, 0);
    assert_eq!(tick.snapshot.groups[0].target, 1200.0);
    assert_eq!(tick.transitions.len(), 1);
    assert_eq!((tick.transitions[0].from, tick.transitions[0].to), (2, 0));
}

#[tokio::test]
async fn system_fan_converges_on_escalated_target() {
    let (mut orchestrator, bench) = bench().await;
    let overrides = OverrideMap::new();
    let start = Instant::now();

    let mut last = None;
    for secs in 0..60 {
        let tick = orchestrator
            .evaluate(&cpu(75.0), &overrides, start + Duration::from_secs(secs))
            .await;
        last = Some(tick.snapshot.groups[0].fans[0].clone());
    }

    let fan = last.unwrap();
    assert_eq!(fan.target, 2000.0);
    assert_eq!(fan.status, FanStatus::Ok);
    assert!(fan.rpm.abs_diff(2000) <= 50, "rpm {}", fan.rpm);
    assert!(*bench.pwm.lock().unwrap() < 255);
}

#[tokio::test]
async fn shutdown_returns_gpu_to_automatic_control() {
    let (mut orchestrator, bench) = bench().await;
    orchestrator
        .evaluate(&cpu(40.0), &OverrideMap::new(), Instant::now())
        .await;
    bench.gpu.manual.lock().unwrap().clear();

    orchestrator.shutdown().await;
    assert_eq!(*bench.gpu.manual.lock().unwrap(), vec![false]);
}
