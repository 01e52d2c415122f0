//! Screens, device profiles and capture results.

use crate::models::step::{NavigationStep, PlanError, RawStep, parse_step};
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

/// A seeded primitive value (user default or launch environment entry).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Bool(b) => write!(f, "{b}"),
            DefaultValue::Int(i) => write!(f, "{i}"),
            DefaultValue::Float(v) => write!(f, "{v}"),
            DefaultValue::Text(s) => f.write_str(s),
        }
    }
}

/// A file copied into the app's data container before launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFixture {
    /// Local source file. A leading `~/` is expanded to the home directory.
    pub src: Utf8PathBuf,

    /// Destination relative to the data container; defaults to the source file name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<Utf8PathBuf>,
}

impl FileFixture {
    pub fn new(src: impl Into<Utf8PathBuf>, dest: Option<&str>) -> Self {
        Self {
            src: src.into(),
            dest: dest.map(Utf8PathBuf::from),
        }
    }

    /// Container-relative destination.
    pub fn destination(&self) -> Utf8PathBuf {
        match &self.dest {
            Some(dest) => dest.clone(),
            None => Utf8PathBuf::from(self.src.file_name().unwrap_or(self.src.as_str())),
        }
    }
}

/// Whether `path` stays inside the directory it is joined to.
fn is_contained(path: &Utf8Path) -> bool {
    !path.as_str().is_empty()
        && path.is_relative()
        && path
            .components()
            .all(|c| matches!(c, camino::Utf8Component::Normal(_) | camino::Utf8Component::CurDir))
}

/// Everything fixed before the app starts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaunchSeed {
    pub defaults: IndexMap<String, DefaultValue>,
    pub env: IndexMap<String, DefaultValue>,
    pub launch_args: Vec<String>,
    pub files: Vec<FileFixture>,
}

impl LaunchSeed {
    /// Canonical rendering in declared order. Equal keys mean identical pre-launch state.
    pub fn key(&self) -> String {
        let mut key = String::new();
        for (k, v) in &self.defaults {
            key.push_str(&format!("d:{k}={v:?};"));
        }
        for (k, v) in &self.env {
            key.push_str(&format!("e:{k}={v:?};"));
        }
        for arg in &self.launch_args {
            key.push_str(&format!("a:{arg:?};"));
        }
        for file in &self.files {
            key.push_str(&format!("f:{}>{};", file.src, file.destination()));
        }
        key
    }
}

/// A screen record as written in the project file / emitted by the planner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawScreen {
    pub name: String,

    #[serde(default)]
    pub defaults: IndexMap<String, DefaultValue>,

    #[serde(default)]
    pub env: IndexMap<String, DefaultValue>,

    /// Extra arguments passed to the app process.
    #[serde(default)]
    pub launch_args: Vec<String>,

    #[serde(default)]
    pub files: Vec<FileFixture>,

    #[serde(default)]
    pub navigation: Vec<RawStep>,

    /// Seconds to let the UI settle before the screenshot.
    #[serde(default = "default_wait_seconds")]
    pub wait_seconds: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_name: Option<String>,
}

fn default_wait_seconds() -> f64 {
    2.0
}

impl RawScreen {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            defaults: IndexMap::new(),
            env: IndexMap::new(),
            launch_args: Vec::new(),
            files: Vec::new(),
            navigation: Vec::new(),
            wait_seconds: default_wait_seconds(),
            capture_name: None,
        }
    }
}

/// A validated capture target. Steps cannot change once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Screen {
    id: String,
    seed: LaunchSeed,
    steps: Vec<NavigationStep>,
    settle: Duration,
    capture_name: String,
}

impl Screen {
    pub fn new(id: impl Into<String>, steps: Vec<NavigationStep>) -> Self {
        let id = id.into();
        Self {
            capture_name: id.clone(),
            id,
            seed: LaunchSeed::default(),
            steps,
            settle: Duration::ZERO,
        }
    }

    pub fn with_default(mut self, key: impl Into<String>, value: DefaultValue) -> Self {
        self.seed.defaults.insert(key.into(), value);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: DefaultValue) -> Self {
        self.seed.env.insert(key.into(), value);
        self
    }

    pub fn with_launch_arg(mut self, arg: impl Into<String>) -> Self {
        self.seed.launch_args.push(arg.into());
        self
    }

    pub fn with_file(mut self, file: FileFixture) -> Self {
        self.seed.files.push(file);
        self
    }

    pub fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    pub fn with_capture_name(mut self, name: impl Into<String>) -> Self {
        self.capture_name = name.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn seed(&self) -> &LaunchSeed {
        &self.seed
    }

    pub fn defaults(&self) -> &IndexMap<String, DefaultValue> {
        &self.seed.defaults
    }

    pub fn env(&self) -> &IndexMap<String, DefaultValue> {
        &self.seed.env
    }

    pub fn steps(&self) -> &[NavigationStep] {
        &self.steps
    }

    pub fn settle(&self) -> Duration {
        self.settle
    }

    pub fn capture_name(&self) -> &str {
        &self.capture_name
    }

    /// Batching key: screens with the same key start from the same pre-launch state.
    pub fn seed_key(&self) -> String {
        self.seed.key()
    }
}

/// Validate planner records into screens.
///
/// # Errors
/// The first [`PlanError`] found; no partial result is returned.
pub fn validate_screens(raw: &[RawScreen]) -> Result<Vec<Screen>, PlanError> {
    let mut screens = Vec::with_capacity(raw.len());
    let mut capture_owners: HashMap<String, String> = HashMap::new();

    for record in raw {
        let id = record.name.trim();
        if id.is_empty() {
            return Err(PlanError::EmptyScreenId);
        }
        if screens.iter().any(|s: &Screen| s.id() == id) {
            return Err(PlanError::DuplicateScreen(id.to_string()));
        }
        let settle = Duration::try_from_secs_f64(record.wait_seconds).map_err(|_| {
            PlanError::InvalidScreen {
                screen: id.to_string(),
                field: "wait_seconds",
                reason: "expected a non-negative number of seconds".to_string(),
            }
        })?;
        if let Some(file) = record
            .files
            .iter()
            .find(|f| f.src.as_str().trim().is_empty() || !is_contained(&f.destination()))
        {
            return Err(PlanError::InvalidScreen {
                screen: id.to_string(),
                field: "files",
                reason: format!(
                    "'{}' needs a source and a destination inside the container",
                    file.src
                ),
            });
        }

        let steps = record
            .navigation
            .iter()
            .enumerate()
            .map(|(i, step)| parse_step(id, i + 1, step))
            .collect::<Result<Vec<_>, _>>()?;

        let capture_name = record
            .capture_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(id)
            .to_string();
        if let Some(first) = capture_owners.get(&capture_name) {
            return Err(PlanError::DuplicateCaptureName {
                first: first.clone(),
                second: id.to_string(),
                name: capture_name,
            });
        }
        capture_owners.insert(capture_name.clone(), id.to_string());

        screens.push(Screen {
            id: id.to_string(),
            seed: LaunchSeed {
                defaults: record.defaults.clone(),
                env: record.env.clone(),
                launch_args: record.launch_args.clone(),
                files: record.files.clone(),
            },
            steps,
            settle,
            capture_name,
        });
    }

    Ok(screens)
}

/// Pixel size of a device's screenshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

/// App Store screenshot sizes for the device names we know about.
const DEVICE_RESOLUTIONS: &[(&str, u32, u32)] = &[
    ("iPhone-16-Pro-Max", 1320, 2868),
    ("iPhone-16-Plus", 1290, 2796),
    ("iPhone-16-Pro", 1206, 2622),
    ("iPhone-16", 1179, 2556),
    ("iPhone-17-Pro-Max", 1320, 2868),
    ("iPhone-17-Pro", 1206, 2622),
    ("iPhone-17", 1206, 2622),
    ("iPhone-SE-3rd-generation", 750, 1334),
    ("iPad-Pro-13-inch-M4", 2064, 2752),
    ("iPad-Air-13-inch-M3", 2360, 1640),
];

/// Look up the built-in resolution for a device name or a CoreSimulator device type id.
///
/// Display names match too: `iPad Pro 13-inch (M4)` is `iPad-Pro-13-inch-M4`.
pub fn known_resolution(name_or_type: &str) -> Option<Resolution> {
    let short = name_or_type.rsplit('.').next().unwrap_or(name_or_type);
    let normalized = short
        .split(|c: char| c.is_whitespace() || c == '-')
        .map(|part| part.trim_matches(|c| c == '(' || c == ')'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    DEVICE_RESOLUTIONS
        .iter()
        .find(|(name, _, _)| name.eq_ignore_ascii_case(&normalized))
        .map(|&(_, width, height)| Resolution { width, height })
}

/// One device configuration to capture on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceProfile {
    pub name: String,

    /// Platform device type, e.g. `com.apple.CoreSimulator.SimDeviceType.iPhone-16-Pro-Max`.
    #[serde(rename = "type")]
    pub device_type: String,

    #[serde(default)]
    pub runtime: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl DeviceProfile {
    pub fn new(
        name: impl Into<String>,
        device_type: impl Into<String>,
        runtime: impl Into<String>,
    ) -> Self {
        let device_type = device_type.into();
        Self {
            name: name.into(),
            resolution: known_resolution(&device_type),
            device_type,
            runtime: runtime.into(),
        }
    }

    /// Declared resolution, or the built-in one for the device type.
    pub fn effective_resolution(&self) -> Option<Resolution> {
        self.resolution
            .or_else(|| known_resolution(&self.device_type))
            .or_else(|| known_resolution(&self.name))
    }
}

/// Terminal status of one (screen, device) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Captured,
    Failed,
    Unreachable,
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CaptureStatus::Captured => f.write_str("Captured"),
            CaptureStatus::Failed => f.write_str("Failed"),
            CaptureStatus::Unreachable => f.write_str("Unreachable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureResult {
    pub screen_id: String,
    pub device: String,
    pub status: CaptureStatus,
    pub output_path: Option<Utf8PathBuf>,
    pub reason: Option<String>,
    pub attempts: u32,
    pub launches: u32,
}

impl CaptureResult {
    pub fn captured(
        screen_id: &str,
        device: &str,
        path: Utf8PathBuf,
        attempts: u32,
        launches: u32,
    ) -> Self {
        Self {
            screen_id: screen_id.to_string(),
            device: device.to_string(),
            status: CaptureStatus::Captured,
            output_path: Some(path),
            reason: None,
            attempts,
            launches,
        }
    }

    pub fn failed(
        screen_id: &str,
        device: &str,
        status: CaptureStatus,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            screen_id: screen_id.to_string(),
            device: device.to_string(),
            status,
            output_path: None,
            reason: Some(reason.into()),
            attempts: 0,
            launches: 0,
        }
    }
}
