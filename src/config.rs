//! Configuration management for the fanctld daemon.
//!
//! Handles loading, parsing, and validation of the JSON (or YAML)
//! configuration that defines fan groups, their profiles and thresholds,
//! sensors, and the persisted override map.

use anyhow::{Context, Result, anyhow, bail};
use log::info;
use serde::{Deserialize, Deserializer, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    env, fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::sync::RwLock;

use crate::event::ConfigChangeType;

/// Severity level of a fan group; the index into its profile table.
pub type Level = usize;

/// Override entries keyed by fan group id.
pub type OverrideMap = BTreeMap<String, OverrideCfg>;

/// Main configuration structure for the fanctld daemon.
///
/// # Example
///
/// ```json
/// {
///   "tick_seconds": 1,
///   "sensors": [
///     { "kind": "hwmon", "id": "cpu", "paths": ["/sys/class/hwmon/hwmon2/temp1_input"] }
///   ],
///   "fan_groups": [ {
///     "id": "system", "name": "Chassis", "type": "system",
///     "temp_sources": ["cpu"],
///     "fans": [ { "type": "system", "id": "rear", "name": "Rear",
///                 "pwm_path": "/sys/class/hwmon/hwmon3/pwm1",
///                 "input_path": "/sys/class/hwmon/hwmon3/fan1_input" } ],
///     "profiles": [
///       { "name": "Quiet", "target": 1200, "thresholds": {} },
///       { "name": "Load", "target": 1600, "thresholds": { "cpu": 60 } }
///     ],
///     "delay_up": 5, "hold_time": 40
///   } ],
///   "override": { "system": { "enabled": false, "mode": 0 } }
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Configuration version for compatibility checking.
    #[serde(default = "defaults::version")]
    pub version: u8,

    /// Control loop interval in seconds.
    #[serde(default = "defaults::tick_seconds")]
    pub tick_seconds: u16,

    /// Upper bound for every external read or write, in milliseconds.
    #[serde(default = "defaults::command_timeout_ms")]
    pub command_timeout_ms: u64,

    /// Snapshot history log settings.
    #[serde(default)]
    pub history: HistoryCfg,

    /// Temperature sources feeding the sensor map.
    #[serde(default)]
    pub sensors: Vec<SensorCfg>,

    /// Independently controlled fan groups.
    #[serde(default)]
    pub fan_groups: Vec<FanGroupCfg>,

    /// Persisted override state keyed by group id.
    #[serde(default, rename = "override")]
    pub overrides: OverrideMap,
}

/// Kind of hardware a fan group drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FanGroupKind {
    /// Chassis fans behind sysfs PWM channels.
    #[serde(rename = "system")]
    System,
    /// GPU fans driven through the vendor tool.
    #[serde(rename = "nvidia", alias = "accelerator")]
    Accelerator,
}

/// A group of fans sharing one mode decision engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanGroupCfg {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: FanGroupKind,
    /// Sensor ids whose thresholds participate in this group's decisions.
    ///
    /// An absent or empty list means every threshold participates; there is
    /// no implicit `cpu`/`gpu`/`hdd` default and no "filter everything" case.
    #[serde(default)]
    pub temp_sources: Vec<String>,
    #[serde(default)]
    pub fans: Vec<FanBindingCfg>,
    /// Accelerator-only driver options.
    #[serde(default)]
    pub gpu: GpuCfg,
    /// Ordered profile table; the index is the severity level.
    pub profiles: Vec<ProfileCfg>,
    /// Seconds an escalation must persist before it commits.
    #[serde(default = "defaults::delay_up")]
    pub delay_up: f64,
    /// Seconds a mode is held before it may de-escalate.
    #[serde(default = "defaults::hold_time")]
    pub hold_time: f64,
}

fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value.max(0.0)).unwrap_or(Duration::MAX)
}

impl FanGroupCfg {
    /// Values too large for a `Duration` saturate instead of failing.
    pub fn delay_up(&self) -> Duration {
        seconds(self.delay_up)
    }

    pub fn hold_time(&self) -> Duration {
        seconds(self.hold_time)
    }

    /// Target of the profile at `level`, or 0 when no such profile exists.
    pub fn target_for(&self, level: Level) -> (f64, TargetUnit) {
        self.profiles
            .get(level)
            .map(|p| (p.target, p.unit()))
            .unwrap_or((0.0, TargetUnit::Percent))
    }
}

/// Physical fan attached to a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FanBindingCfg {
    /// PWM fan exposed by a hwmon driver.
    System {
        id: String,
        name: String,
        pwm_path: PathBuf,
        input_path: PathBuf,
    },
    /// One or more fans on an NVIDIA GPU controlled as a unit.
    Nvidia {
        id: String,
        name: String,
        #[serde(default)]
        gpu_index: u32,
        #[serde(default = "defaults::gpu_fan_indices")]
        fan_indices: Vec<u32>,
    },
}

impl FanBindingCfg {
    pub fn id(&self) -> &str {
        match self {
            FanBindingCfg::System { id, .. } | FanBindingCfg::Nvidia { id, .. } => id,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            FanBindingCfg::System { name, .. } | FanBindingCfg::Nvidia { name, .. } => name,
        }
    }

    fn kind(&self) -> FanGroupKind {
        match self {
            FanBindingCfg::System { .. } => FanGroupKind::System,
            FanBindingCfg::Nvidia { .. } => FanGroupKind::Accelerator,
        }
    }
}

/// When the GPU actuator re-asserts manual fan control on open-loop commands.
///
/// Closed-loop corrections always re-assert it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ManualControlPolicy {
    /// Enable manual control before every speed command.
    #[default]
    EveryCommand,
    /// Enable manual control only when it is not already active.
    OnTransition,
}

/// Accelerator driver options shared by all fans of a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuCfg {
    /// X display passed to `nvidia-settings`.
    #[serde(default = "defaults::display")]
    pub display: String,
    #[serde(default)]
    pub manual_control: ManualControlPolicy,
}

impl Default for GpuCfg {
    fn default() -> Self {
        Self {
            display: defaults::display(),
            manual_control: ManualControlPolicy::default(),
        }
    }
}

/// Unit of a profile target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetUnit {
    Percent,
    Rpm,
}

impl TargetUnit {
    /// Legacy magnitude rule: values above 100 are RPM, the rest percent.
    pub fn infer(target: f64) -> Self {
        if target > 100.0 {
            TargetUnit::Rpm
        } else {
            TargetUnit::Percent
        }
    }
}

/// One row of a group's profile table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileCfg {
    pub name: String,
    pub target: f64,
    /// Sensor id to limit; `null` limits are ignored.
    #[serde(default)]
    pub thresholds: BTreeMap<String, Option<f64>>,
    /// Explicit unit; inferred from the target's magnitude when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<TargetUnit>,
}

impl ProfileCfg {
    pub fn unit(&self) -> TargetUnit {
        self.unit.unwrap_or_else(|| TargetUnit::infer(self.target))
    }
}

/// Forced mode for one group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideCfg {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, deserialize_with = "de_level")]
    pub mode: Level,
}

/// Accepts a level as a number or as a numeric string.
fn de_level<'de, D>(deserializer: D) -> std::result::Result<Level, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawLevel {
        Number(Level),
        Text(String),
    }

    match RawLevel::deserialize(deserializer)? {
        RawLevel::Number(level) => Ok(level),
        RawLevel::Text(text) => text
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid mode '{text}'"))),
    }
}

/// Temperature sensor configuration variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SensorCfg {
    /// lm-sensors hardware monitoring configuration.
    LmSensors {
        /// Unique identifier for this sensor.
        id: String,

        /// Hardware chip identifier (e.g., "k10temp-pci-00c3").
        chip: String,

        /// Sensor feature name (e.g., "Tctl").
        feature: String,
    },
    /// Raw hwmon `temp*_input` files; the hottest one wins.
    Hwmon { id: String, paths: Vec<PathBuf> },
    /// NVIDIA GPU core temperature via `nvidia-smi`.
    Nvidia {
        id: String,
        #[serde(default)]
        gpu_index: u32,
    },
}

impl SensorCfg {
    pub fn id(&self) -> &str {
        match self {
            SensorCfg::LmSensors { id, .. }
            | SensorCfg::Hwmon { id, .. }
            | SensorCfg::Nvidia { id, .. } => id,
        }
    }
}

/// Rotating snapshot history settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryCfg {
    #[serde(default = "defaults::history_enabled")]
    pub enabled: bool,
    #[serde(default = "defaults::history_path")]
    pub path: PathBuf,
    #[serde(default = "defaults::history_interval")]
    pub interval_seconds: u16,
    #[serde(default = "defaults::history_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "defaults::history_backups")]
    pub backups: usize,
}

impl Default for HistoryCfg {
    fn default() -> Self {
        Self {
            enabled: defaults::history_enabled(),
            path: defaults::history_path(),
            interval_seconds: defaults::history_interval(),
            max_bytes: defaults::history_max_bytes(),
            backups: defaults::history_backups(),
        }
    }
}

/// Partially specified fan group submitted through the API.
///
/// Missing fields are filled with the same defaults a hand-written
/// configuration would get.
#[derive(Debug, Clone, Deserialize)]
pub struct FanGroupDraft {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<FanGroupKind>,
    pub temp_sources: Vec<String>,
    pub fans: Vec<FanBindingCfg>,
    #[serde(default)]
    pub gpu: GpuCfg,
    #[serde(default)]
    pub profiles: Vec<ProfileCfg>,
    #[serde(default)]
    pub delay_up: Option<f64>,
    #[serde(default)]
    pub hold_time: Option<f64>,
}

impl FanGroupDraft {
    pub fn into_group(self) -> FanGroupCfg {
        let mut profiles = if self.profiles.is_empty() {
            [("Quiet", 800.0), ("Standard", 1200.0), ("Maximum", 2000.0)]
                .into_iter()
                .map(|(name, target)| ProfileCfg {
                    name: name.to_string(),
                    target,
                    thresholds: BTreeMap::new(),
                    unit: None,
                })
                .collect()
        } else {
            self.profiles
        };

        for profile in &mut profiles {
            for source in &self.temp_sources {
                profile.thresholds.entry(source.clone()).or_insert(None);
            }
        }

        FanGroupCfg {
            id: self.id,
            name: self.name,
            kind: self.kind.unwrap_or(FanGroupKind::System),
            temp_sources: self.temp_sources,
            fans: self.fans,
            gpu: self.gpu,
            profiles,
            delay_up: self.delay_up.unwrap_or_else(defaults::delay_up),
            hold_time: self.hold_time.unwrap_or_else(defaults::hold_time),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: defaults::version(),
            tick_seconds: defaults::tick_seconds(),
            command_timeout_ms: defaults::command_timeout_ms(),
            history: HistoryCfg::default(),
            sensors: Vec::new(),
            fan_groups: Vec::new(),
            overrides: OverrideMap::new(),
        }
    }
}

impl Config {
    /// Validates the configuration for consistency.
    ///
    /// Override modes are not checked against profile tables; an
    /// out-of-range mode degrades to target 0 at tick time.
    pub fn validate(&self) -> Result<()> {
        if self.tick_seconds == 0 {
            bail!("tick_seconds must be greater than zero");
        }

        let mut sensor_ids = HashSet::new();
        for sensor in &self.sensors {
            if !sensor_ids.insert(sensor.id()) {
                bail!("Duplicate sensor id '{}'", sensor.id());
            }
        }

        let mut group_ids = HashSet::new();
        let mut fan_ids = HashSet::new();
        for group in &self.fan_groups {
            if group.id.trim().is_empty() {
                bail!("Fan group '{}' has an empty id", group.name);
            }
            if !group_ids.insert(group.id.as_str()) {
                bail!("Duplicate fan group id '{}'", group.id);
            }
            if group.profiles.is_empty() {
                bail!("Fan group '{}' has no profiles", group.id);
            }
            for (field, value) in [("delay_up", group.delay_up), ("hold_time", group.hold_time)] {
                if !value.is_finite() || value < 0.0 {
                    bail!("Fan group '{}' has invalid {field} {value}", group.id);
                }
            }
            for fan in &group.fans {
                if fan.kind() != group.kind {
                    bail!(
                        "Fan '{}' does not match the {:?} kind of group '{}'",
                        fan.id(),
                        group.kind,
                        group.id
                    );
                }
                if !fan_ids.insert(fan.id()) {
                    bail!("Duplicate fan id '{}'", fan.id());
                }
            }
        }

        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.tick_seconds.max(1)))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn find_group(&self, id: &str) -> Option<&FanGroupCfg> {
        self.fan_groups.iter().find(|group| group.id == id)
    }

    /// Names of top-level sections that differ and cannot be applied live.
    pub fn cold_sections(&self, other: &Config) -> Vec<String> {
        let mut changed = Vec::new();
        if self.history != other.history {
            changed.push("history".to_string());
        }
        changed
    }
}

mod defaults {
    use std::path::PathBuf;

    pub fn version() -> u8 {
        1
    }

    /// Default control interval in seconds.
    pub fn tick_seconds() -> u16 {
        1
    }

    pub fn command_timeout_ms() -> u64 {
        3000
    }

    pub fn delay_up() -> f64 {
        5.0
    }

    pub fn hold_time() -> f64 {
        30.0
    }

    pub fn display() -> String {
        ":0".to_string()
    }

    pub fn gpu_fan_indices() -> Vec<u32> {
        vec![0]
    }

    pub fn history_enabled() -> bool {
        true
    }

    pub fn history_path() -> PathBuf {
        PathBuf::from("/var/log/fanctld/history.jsonl")
    }

    pub fn history_interval() -> u16 {
        5
    }

    pub fn history_max_bytes() -> u64 {
        10 * 1024 * 1024
    }

    pub fn history_backups() -> usize {
        5
    }
}

/// Serialization format chosen from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Json,
    Yaml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yml" | "yaml") => ConfigFormat::Yaml,
            _ => ConfigFormat::Json,
        }
    }

    fn parse(self, content: &str) -> Result<Config> {
        match self {
            ConfigFormat::Json => serde_json::from_str(content).context("Failed to parse JSON"),
            ConfigFormat::Yaml => serde_yaml::from_str(content).context("Failed to parse YAML"),
        }
    }

    fn render(self, config: &Config) -> Result<String> {
        match self {
            ConfigFormat::Json => {
                serde_json::to_string_pretty(config).context("Failed to serialize configuration")
            }
            ConfigFormat::Yaml => {
                serde_yaml::to_string(config).context("Failed to serialize configuration")
            }
        }
    }
}

fn locate_config() -> Result<PathBuf> {
    if let Ok(env_path) = env::var("FANCTLD_CONFIG") {
        return Ok(PathBuf::from(env_path));
    }

    if let Some(mut cfg_dir) = env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| env::var_os("HOME").map(|h| Path::new(&h).join(".config")))
    {
        cfg_dir.push("fanctld/config.json");
        if cfg_dir.exists() {
            return Ok(cfg_dir);
        }
    }

    let etc = Path::new("/etc/fanctld/config.json");
    if etc.exists() {
        return Ok(etc.to_path_buf());
    }

    bail!("Configuration file not found in any standard location")
}

/// Configuration manager that handles both config data and file operations.
///
/// # Example
///
/// ```no_run
/// use fanctld::config::ConfigManager;
/// use std::path::PathBuf;
///
/// # async fn example() -> anyhow::Result<()> {
/// let config_manager = ConfigManager::load(Some(PathBuf::from("config.json"))).await?;
/// let tick_seconds = config_manager.get().await.tick_seconds;
/// config_manager.reload().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ConfigManager {
    config: Arc<RwLock<Config>>,
    path: PathBuf,
}

impl ConfigManager {
    /// Creates a new ConfigManager with the given config and path.
    pub fn new(config: Config, path: PathBuf) -> Self {
        Self {
            config: Arc::new(RwLock::new(config)),
            path,
        }
    }

    /// Loads configuration from file or standard locations.
    ///
    /// Searches for configuration in the following order:
    /// 1. Provided path parameter
    /// 2. FANCTLD_CONFIG environment variable
    /// 3. XDG_CONFIG_HOME/fanctld/config.json or ~/.config/fanctld/config.json
    /// 4. /etc/fanctld/config.json
    pub async fn load(path: Option<PathBuf>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p,
            None => locate_config().context("No configuration file found")?,
        };

        info!("Loading config from: {}", config_path.display());
        let config = Self::load_config_from_path(&config_path)?;

        Ok(Self::new(config, config_path))
    }

    /// Gets a read-only reference to the current configuration.
    pub async fn get(&self) -> tokio::sync::RwLockReadGuard<'_, Config> {
        self.config.read().await
    }

    /// Returns the path to the configuration file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reloads configuration from the same file.
    pub async fn reload(&self) -> Result<()> {
        info!("Reloading config from: {}", self.path.display());
        let new_config = Self::load_config_from_path(&self.path)?;

        *self.config.write().await = new_config;
        info!("Configuration reloaded successfully");
        Ok(())
    }

    /// Compares the file on disk with the live configuration.
    pub async fn analyze_config_changes(&self) -> Result<ConfigChangeType> {
        let on_disk = Self::load_config_from_path(&self.path)?;
        let changed_sections = self.config.read().await.cold_sections(&on_disk);

        if changed_sections.is_empty() {
            Ok(ConfigChangeType::HotReload)
        } else {
            Ok(ConfigChangeType::ColdRestart { changed_sections })
        }
    }

    /// Saves the current configuration to file.
    pub async fn save(&self) -> Result<()> {
        let config = self.config.read().await;
        self.save_to_path(&config, &self.path)
    }

    /// Saves configuration to a specific path through a temporary file.
    pub fn save_to_path(&self, config: &Config, path: &Path) -> Result<()> {
        let rendered = ConfigFormat::from_path(path).render(config)?;

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        fs::write(&tmp_path, rendered).with_context(|| {
            format!("Failed to write temporary config to {}", tmp_path.display())
        })?;

        fs::rename(&tmp_path, path)
            .with_context(|| format!("Failed to move config to {}", path.display()))?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Clones the current configuration.
    pub async fn clone_config(&self) -> Config {
        self.config.read().await.clone()
    }

    /// Replaces the configuration after validating it.
    pub async fn update_config(&self, new_config: Config) -> Result<()> {
        new_config
            .validate()
            .context("New configuration is invalid")?;
        *self.config.write().await = new_config;
        info!("Configuration updated in memory");
        Ok(())
    }

    /// Writes the override map into the configuration and persists it.
    pub async fn persist_overrides(&self, overrides: &OverrideMap) -> Result<()> {
        let mut config = self.config.write().await;
        config.overrides = overrides.clone();
        self.save_to_path(&config, &self.path)
    }

    /// Appends a fan group and persists the result.
    pub async fn add_fan_group(&self, group: FanGroupCfg) -> Result<FanGroupCfg> {
        let mut config = self.config.write().await;
        if config.find_group(&group.id).is_some() {
            bail!("Fan group '{}' already exists", group.id);
        }

        let mut candidate = config.clone();
        candidate.fan_groups.push(group.clone());
        candidate
            .validate()
            .with_context(|| format!("Fan group '{}' is invalid", group.id))?;

        self.save_to_path(&candidate, &self.path)?;
        *config = candidate;
        info!("Added fan group '{}'", group.id);
        Ok(group)
    }

    /// Removes a system fan group together with its override entry.
    pub async fn remove_fan_group(&self, id: &str) -> Result<()> {
        let mut config = self.config.write().await;
        let group = config
            .find_group(id)
            .ok_or_else(|| anyhow!("Fan group '{id}' not found"))?;
        if group.kind == FanGroupKind::Accelerator {
            bail!("Fan group '{id}' drives GPU fans and cannot be removed");
        }

        let mut candidate = config.clone();
        candidate.fan_groups.retain(|group| group.id != id);
        candidate.overrides.remove(id);

        self.save_to_path(&candidate, &self.path)?;
        *config = candidate;
        info!("Removed fan group '{id}'");
        Ok(())
    }

    fn load_config_from_path(path: &Path) -> Result<Config> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = ConfigFormat::from_path(path)
            .parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        if config.version != 1 {
            bail!(
                "Unsupported config version {} in file: {}",
                config.version,
                path.display()
            );
        }

        config
            .validate()
            .with_context(|| format!("Configuration validation failed for: {}", path.display()))?;

        Ok(config)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    pub(crate) const SAMPLE_JSON: &str = r#"{
  "tick_seconds": 2,
  "sensors": [
    { "kind": "hwmon", "id": "cpu", "paths": ["/sys/class/hwmon/hwmon2/temp1_input"] },
    { "kind": "nvidia", "id": "gpu" }
  ],
  "fan_groups": [
    {
      "id": "system",
      "name": "Chassis",
      "type": "system",
      "temp_sources": ["cpu"],
      "fans": [
        { "type": "system", "id": "rear", "name": "Rear",
          "pwm_path": "/sys/class/hwmon/hwmon3/pwm1",
          "input_path": "/sys/class/hwmon/hwmon3/fan1_input" }
      ],
      "profiles": [
        { "name": "Quiet", "target": 1200, "thresholds": {} },
        { "name": "Load", "target": 1600, "thresholds": { "cpu": 60, "gpu": null } },
        { "name": "Max", "target": 2000, "thresholds": { "cpu": 70 } }
      ],
      "delay_up": 5,
      "hold_time": 40
    },
    {
      "id": "gpu",
      "name": "Graphics",
      "type": "nvidia",
      "temp_sources": ["gpu"],
      "fans": [ { "type": "nvidia", "id": "gpu0", "name": "GPU", "fan_indices": [0, 1] } ],
      "profiles": [
        { "name": "Auto", "target": 0, "thresholds": {} },
        { "name": "Hot", "target": 60, "thresholds": { "gpu": 75 } }
      ]
    }
  ],
  "override": { "gpu": { "enabled": true, "mode": "1" } }
}"#;

    fn create_temp_config(suffix: &str, content: &str) -> NamedTempFile {
        let mut temp_file = Builder::new().suffix(suffix).tempfile().unwrap();
        temp_file.write_all(content.as_bytes()).unwrap();
        temp_file.flush().unwrap();
        temp_file
    }

    pub(crate) fn sample_config() -> Config {
        serde_json::from_str(SAMPLE_JSON).unwrap()
    }

    #[tokio::test]
    async fn config_load_valid_json() {
        let temp_file = create_temp_config(".json", SAMPLE_JSON);

        let manager = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap();
        let config = manager.clone_config().await;

        assert_eq!(config.version, 1);
        assert_eq!(config.tick_seconds, 2);
        assert_eq!(config.command_timeout_ms, 3000);
        assert_eq!(config.sensors.len(), 2);
        assert_eq!(config.fan_groups.len(), 2);
        assert_eq!(config.fan_groups[0].kind, FanGroupKind::System);
        assert_eq!(config.fan_groups[1].kind, FanGroupKind::Accelerator);
        assert_eq!(config.fan_groups[1].delay_up, 5.0);
        assert_eq!(config.fan_groups[1].hold_time, 30.0);
        assert_eq!(config.fan_groups[1].gpu, GpuCfg::default());
        assert_eq!(
            config.overrides.get("gpu"),
            Some(&OverrideCfg {
                enabled: true,
                mode: 1
            })
        );
    }

    #[tokio::test]
    async fn config_load_yaml_by_extension() {
        let yaml = serde_yaml::to_string(&sample_config()).unwrap();
        let temp_file = create_temp_config(".yaml", &yaml);

        let manager = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap();

        assert_eq!(manager.clone_config().await, sample_config());
    }

    #[test]
    fn profile_unit_inferred_from_magnitude_unless_explicit() {
        let config = sample_config();
        let system = &config.fan_groups[0];
        let gpu = &config.fan_groups[1];

        assert_eq!(system.profiles[0].unit(), TargetUnit::Rpm);
        assert_eq!(gpu.profiles[1].unit(), TargetUnit::Percent);

        let explicit = ProfileCfg {
            name: "low rpm".to_string(),
            target: 90.0,
            thresholds: BTreeMap::new(),
            unit: Some(TargetUnit::Rpm),
        };
        assert_eq!(explicit.unit(), TargetUnit::Rpm);
    }

    #[test]
    fn target_for_missing_profile_is_zero() {
        let config = sample_config();
        let group = &config.fan_groups[0];

        assert_eq!(group.target_for(2), (2000.0, TargetUnit::Rpm));
        assert_eq!(group.target_for(7), (0.0, TargetUnit::Percent));
    }

    #[test]
    fn accelerator_alias_is_accepted() {
        let kind: FanGroupKind = serde_json::from_str("\"accelerator\"").unwrap();
        assert_eq!(kind, FanGroupKind::Accelerator);
        assert_eq!(serde_json::to_string(&kind).unwrap(), "\"nvidia\"");
    }

    #[test]
    fn override_mode_rejects_garbage() {
        let result: std::result::Result<OverrideCfg, _> =
            serde_json::from_str(r#"{ "enabled": true, "mode": "high" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn config_validate_duplicate_group() {
        let mut config = sample_config();
        config.fan_groups[1].id = "system".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate fan group id"));
    }

    #[test]
    fn config_validate_binding_kind_mismatch() {
        let mut config = sample_config();
        let gpu_fan = config.fan_groups[1].fans[0].clone();
        config.fan_groups[0].fans.push(gpu_fan);
        config.fan_groups[1].fans.clear();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn config_validate_rejects_empty_profiles_and_negative_timing() {
        let mut config = sample_config();
        config.fan_groups[0].profiles.clear();
        assert!(config.validate().is_err());

        let mut config = sample_config();
        config.fan_groups[0].hold_time = -1.0;
        assert!(config.validate().unwrap_err().to_string().contains("hold_time"));
    }

    #[test]
    fn config_validate_ignores_out_of_range_override() {
        let mut config = sample_config();
        config.overrides.insert(
            "system".to_string(),
            OverrideCfg {
                enabled: true,
                mode: 42,
            },
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn draft_fills_defaults_and_null_thresholds() {
        let draft: FanGroupDraft = serde_json::from_str(
            r#"{ "id": "front", "name": "Front", "temp_sources": ["cpu", "hdd"], "fans": [] }"#,
        )
        .unwrap();

        let group = draft.into_group();

        assert_eq!(group.kind, FanGroupKind::System);
        assert_eq!(group.delay_up, 5.0);
        assert_eq!(group.hold_time, 30.0);
        assert_eq!(group.profiles.len(), 3);
        for profile in &group.profiles {
            assert_eq!(profile.thresholds.get("cpu"), Some(&None));
            assert_eq!(profile.thresholds.get("hdd"), Some(&None));
        }
    }

    #[tokio::test]
    async fn add_and_remove_fan_group_persist() {
        let temp_file = create_temp_config(".json", SAMPLE_JSON);
        let manager = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap();

        let draft: FanGroupDraft = serde_json::from_str(
            r#"{ "id": "front", "name": "Front", "temp_sources": ["cpu"], "fans": [] }"#,
        )
        .unwrap();
        manager.add_fan_group(draft.clone().into_group()).await.unwrap();

        let duplicate = manager.add_fan_group(draft.into_group()).await;
        assert!(duplicate.unwrap_err().to_string().contains("already exists"));

        let reloaded = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap();
        assert!(reloaded.get().await.find_group("front").is_some());

        manager.remove_fan_group("front").await.unwrap();
        assert!(manager.get().await.find_group("front").is_none());

        let err = manager.remove_fan_group("gpu").await.unwrap_err();
        assert!(err.to_string().contains("cannot be removed"));
        assert!(manager.remove_fan_group("missing").await.is_err());
    }

    #[tokio::test]
    async fn persist_overrides_round_trips_through_file() {
        let temp_file = create_temp_config(".json", SAMPLE_JSON);
        let manager = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap();

        let mut overrides = OverrideMap::new();
        overrides.insert(
            "system".to_string(),
            OverrideCfg {
                enabled: true,
                mode: 2,
            },
        );
        manager.persist_overrides(&overrides).await.unwrap();
        manager.reload().await.unwrap();

        assert_eq!(manager.get().await.overrides, overrides);
    }

    #[tokio::test]
    async fn analyze_detects_history_changes_as_cold() {
        let temp_file = create_temp_config(".json", SAMPLE_JSON);
        let manager = ConfigManager::load(Some(temp_file.path().to_path_buf()))
            .await
            .unwrap();

        assert!(matches!(
            manager.analyze_config_changes().await.unwrap(),
            ConfigChangeType::HotReload
        ));

        let mut changed = sample_config();
        changed.history.backups = 2;
        std::fs::write(
            temp_file.path(),
            serde_json::to_string(&changed).unwrap(),
        )
        .unwrap();

        match manager.analyze_config_changes().await.unwrap() {
            ConfigChangeType::ColdRestart { changed_sections } => {
                assert_eq!(changed_sections, vec!["history".to_string()]);
            }
            other => panic!("expected cold restart, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_version_is_rejected() {
        let temp_file = create_temp_config(".json", r#"{ "version": 2 }"#);
        let err = ConfigManager::load_config_from_path(temp_file.path()).unwrap_err();
        assert!(err.to_string().contains("Unsupported config version"));
    }

    #[test]
    #[serial_test::serial]
    fn locate_config_prefers_environment() {
        // SAFETY: serialized with every other test touching the environment.
        unsafe { env::set_var("FANCTLD_CONFIG", "/tmp/fanctld-env.json") };
        let located = locate_config().unwrap();
        unsafe { env::remove_var("FANCTLD_CONFIG") };

        assert_eq!(located, PathBuf::from("/tmp/fanctld-env.json"));
    }

    #[test]
    fn oversized_durations_saturate() {
        let mut config = sample_config();
        config.fan_groups[0].delay_up = 1e300;
        config.fan_groups[0].hold_time = f64::MAX;
        config.validate().unwrap();

        let group = &config.fan_groups[0];
        assert_eq!(group.delay_up(), Duration::MAX);
        assert_eq!(group.hold_time(), Duration::MAX);
    }

    #[test]
    fn absent_temp_sources_parse_as_no_filter() {
        let group: FanGroupCfg = serde_json::from_str(
            r#"{"id": "drives", "name": "Drives", "type": "system",
                "profiles": [{ "name": "Quiet", "target": 900 }]}"#,
        )
        .unwrap();
        assert!(group.temp_sources.is_empty());
    }
}
