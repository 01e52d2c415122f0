use crate::models::screen::{DeviceProfile, RawScreen, Resolution};
use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_RUNTIME: &str = "com.apple.CoreSimulator.SimRuntime.iOS-26-1";

/// Accessibility bridge command. `{udid}` is replaced with the simulator's UDID.
pub const DEFAULT_TREE_COMMAND: &str = "idb ui describe-all --json --udid {udid}";

/// Project configuration from `appshots.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppShotsConfig {
    pub app: AppConfig,

    #[serde(default = "default_runtime")]
    pub runtime: String,

    #[serde(default)]
    pub devices: Vec<DeviceEntry>,

    #[serde(default)]
    pub screens: Vec<RawScreen>,

    #[serde(default)]
    pub output: OutputConfig,

    /// Raw `settings:` section. Layered into [`RunSettings`] by
    /// [`ConfigManager::run_settings`](crate::config::ConfigManager::run_settings).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub settings: Option<serde_yaml_ng::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub bundle_id: String,

    /// Prebuilt `.app` bundle to install before capturing. When absent the app must already
    /// be installed on the simulator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_path: Option<Utf8PathBuf>,
}

/// Device entry as written in the project file. The runtime falls back to the top-level one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceEntry {
    pub name: String,

    #[serde(rename = "type")]
    pub device_type: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<String>,

    /// Screenshot size; looked up from the device type when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OrganizeBy {
    #[default]
    Device,
    Screen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub directory: Utf8PathBuf,

    #[serde(default)]
    pub organize_by: OrganizeBy,

    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            directory: default_output_dir(),
            organize_by: OrganizeBy::Device,
            format: default_format(),
        }
    }
}

fn default_runtime() -> String {
    DEFAULT_RUNTIME.to_string()
}

fn default_output_dir() -> Utf8PathBuf {
    Utf8PathBuf::from("./screenshots")
}

fn default_format() -> String {
    "png".to_string()
}

impl AppShotsConfig {
    /// Resolve device entries into profiles, filling runtime and resolution.
    pub fn device_profiles(&self) -> Vec<DeviceProfile> {
        self.devices
            .iter()
            .map(|d| {
                let mut profile = DeviceProfile::new(
                    d.name.clone(),
                    d.device_type.clone(),
                    d.runtime.clone().unwrap_or_else(|| self.runtime.clone()),
                );
                if d.resolution.is_some() {
                    profile.resolution = d.resolution;
                }
                profile
            })
            .collect()
    }
}

/// Tunables for a capture run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunSettings {
    /// Attempts per screen on Timeout/DeviceCrash, each from a fresh launch.
    pub max_attempts: u32,
    pub max_parallel_devices: usize,
    pub step_timeout_ms: u64,
    pub verify_retries: u32,
    pub verify_interval_ms: u64,
    pub scroll_attempts: u32,
    pub alert_timeout_ms: u64,
    pub launch_settle_ms: u64,
    /// Upper bound for any single simulator command.
    pub command_timeout_secs: u64,
    pub run_timeout_secs: Option<u64>,
    /// Bound for each release call once a run is cancelled.
    pub cancel_grace_ms: u64,
    pub tree_command: String,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            max_parallel_devices: 2,
            step_timeout_ms: 10_000,
            verify_retries: 3,
            verify_interval_ms: 500,
            scroll_attempts: 5,
            alert_timeout_ms: 3_000,
            launch_settle_ms: 2_000,
            command_timeout_secs: 120,
            run_timeout_secs: None,
            cancel_grace_ms: 5_000,
            tree_command: DEFAULT_TREE_COMMAND.to_string(),
        }
    }
}

impl RunSettings {
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis(self.step_timeout_ms)
    }

    pub fn verify_interval(&self) -> Duration {
        Duration::from_millis(self.verify_interval_ms)
    }

    pub fn alert_timeout(&self) -> Duration {
        Duration::from_millis(self.alert_timeout_ms)
    }

    pub fn launch_settle(&self) -> Duration {
        Duration::from_millis(self.launch_settle_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
