//! Scripted fake device shared by the integration tests.
//!
//! An [`AppScript`] describes the app as a set of named screens (accessibility trees) and
//! tap transitions between them. [`FakeConnector`] hands out one [`FakeDevice`] per
//! profile; every driver call is appended to a shared log so tests can assert on the exact
//! sequence of launches and input events.

#![allow(dead_code)]

use appshots::models::{
    AccessibilityNode, DefaultValue, DeviceProfile, FileFixture, OrganizeBy, Point, Rect, Role,
    RunSettings,
};
use appshots::services::{
    CaptureOrchestrator, DeviceConnector, DeviceDriver, DriverError, OutputLayout,
};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SCREEN: Rect = Rect {
    x: 0.0,
    y: 0.0,
    width: 390.0,
    height: 844.0,
};

/// Transition key used for swipes.
const SWIPE: &str = "<swipe>";

#[derive(Debug, Clone, Default)]
pub struct AppScript {
    initial: String,
    states: IndexMap<String, AccessibilityNode>,
    transitions: HashMap<(String, String), String>,
    crash_on_launches: HashSet<u32>,
    always_crash: bool,
    fetch_delay: Duration,
    shutdown_delay: Duration,
    broken_devices: HashSet<String>,
    /// Default the app bumps on every launch, and the state shown while it is still 0.
    launch_counter: Option<(String, String)>,
}

impl AppScript {
    pub fn new(initial: &str) -> Self {
        Self {
            initial: initial.to_string(),
            ..Self::default()
        }
    }

    pub fn state(mut self, name: &str, tree: AccessibilityNode) -> Self {
        self.states.insert(name.to_string(), tree);
        self
    }

    /// Tapping the element labelled `label` while in `from` moves the app to `to`.
    pub fn on_tap(mut self, from: &str, label: &str, to: &str) -> Self {
        self.transitions
            .insert((from.to_string(), label.to_string()), to.to_string());
        self
    }

    /// Any swipe while in `from` moves the app to `to`.
    pub fn on_swipe(self, from: &str, to: &str) -> Self {
        self.on_tap(from, SWIPE, to)
    }

    /// The app dies right after the n-th launch on a device (1-based, per device).
    pub fn crash_on_launch(mut self, n: u32) -> Self {
        self.crash_on_launches.insert(n);
        self
    }

    pub fn always_crash(mut self) -> Self {
        self.always_crash = true;
        self
    }

    pub fn fetch_delay(mut self, delay: Duration) -> Self {
        self.fetch_delay = delay;
        self
    }

    /// Releasing the device hangs this long.
    pub fn slow_shutdown(mut self, delay: Duration) -> Self {
        self.shutdown_delay = delay;
        self
    }

    /// Like a real app keeping a launch count: every launch increments the integer default
    /// `key`, and a launch that finds it at 0 (or unset) opens in `first_state`.
    pub fn counts_launches(mut self, key: &str, first_state: &str) -> Self {
        self.launch_counter = Some((key.to_string(), first_state.to_string()));
        self
    }

    /// `connect` fails for this device.
    pub fn broken_device(mut self, name: &str) -> Self {
        self.broken_devices.insert(name.to_string());
        self
    }
}

#[derive(Clone)]
pub struct FakeConnector {
    script: Arc<AppScript>,
    log: Arc<Mutex<Vec<String>>>,
    launches: Arc<Mutex<HashMap<String, u32>>>,
}

impl FakeConnector {
    pub fn new(script: AppScript) -> Self {
        Self {
            script: Arc::new(script),
            log: Arc::new(Mutex::new(Vec::new())),
            launches: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Log entries of one device, without the device prefix.
    pub fn device_log(&self, device: &str) -> Vec<String> {
        let prefix = format!("{device}: ");
        self.log()
            .into_iter()
            .filter_map(|line| line.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn count(&self, device: &str, action: &str) -> usize {
        self.device_log(device)
            .iter()
            .filter(|line| line.split_whitespace().next() == Some(action))
            .count()
    }

    pub fn launches(&self, device: &str) -> u32 {
        self.launches.lock().unwrap().get(device).copied().unwrap_or(0)
    }
}

#[async_trait]
impl DeviceConnector for FakeConnector {
    async fn connect(&self, profile: &DeviceProfile) -> Result<Box<dyn DeviceDriver>, DriverError> {
        if self.script.broken_devices.contains(&profile.name) {
            self.log.lock().unwrap().push(format!("{}: connect failed", profile.name));
            return Err(DriverError::CommandFailed("simulator failed to boot".to_string()));
        }
        Ok(Box::new(FakeDevice {
            device: profile.name.clone(),
            script: self.script.clone(),
            log: self.log.clone(),
            launches: self.launches.clone(),
            running: false,
            state: String::new(),
            current: AccessibilityNode::new(Role::Other, "", SCREEN),
            defaults: IndexMap::new(),
        }))
    }
}

pub struct FakeDevice {
    device: String,
    script: Arc<AppScript>,
    log: Arc<Mutex<Vec<String>>>,
    launches: Arc<Mutex<HashMap<String, u32>>>,
    running: bool,
    state: String,
    current: AccessibilityNode,
    defaults: IndexMap<String, DefaultValue>,
}

impl FakeDevice {
    fn record(&self, entry: String) {
        self.log.lock().unwrap().push(format!("{}: {}", self.device, entry));
    }

    fn ensure_running(&self) -> Result<(), DriverError> {
        if self.running {
            Ok(())
        } else {
            Err(DriverError::AppNotRunning)
        }
    }

    fn enter(&mut self, state: &str) {
        self.state = state.to_string();
        self.current = self
            .script
            .states
            .get(state)
            .cloned()
            .unwrap_or_else(|| panic!("unknown script state '{state}'"));
    }
}

fn hit(rect: &Rect, p: Point) -> bool {
    p.x >= rect.x && p.y >= rect.y && p.x <= rect.x + rect.width && p.y <= rect.y + rect.height
}

fn flip_switch(node: &mut AccessibilityNode, label: &str) -> bool {
    if node.role == Role::SwitchControl && node.label == label {
        let on = node.is_selected();
        node.value = Some(if on { "0" } else { "1" }.to_string());
        return true;
    }
    node.children.iter_mut().any(|c| flip_switch(c, label))
}

fn type_into_focused(node: &mut AccessibilityNode, text: &str) -> bool {
    if node.role == Role::TextField && node.focused {
        let mut value = node.value.take().unwrap_or_default();
        value.push_str(text);
        node.value = Some(value);
        return true;
    }
    node.children.iter_mut().any(|c| type_into_focused(c, text))
}

#[async_trait]
impl DeviceDriver for FakeDevice {
    async fn prepare(&mut self) -> Result<(), DriverError> {
        self.record("prepare".to_string());
        Ok(())
    }

    async fn reset_defaults(&mut self) -> Result<(), DriverError> {
        self.defaults.clear();
        self.record("reset_defaults".to_string());
        Ok(())
    }

    async fn write_default(&mut self, key: &str, value: &DefaultValue) -> Result<(), DriverError> {
        self.defaults.insert(key.to_string(), value.clone());
        self.record(format!("default {key}={value}"));
        Ok(())
    }

    async fn install_files(&mut self, files: &[FileFixture]) -> Result<(), DriverError> {
        let destinations: Vec<String> = files.iter().map(|f| f.destination().to_string()).collect();
        self.record(format!("files {}", destinations.join(",")));
        Ok(())
    }

    async fn launch_app(
        &mut self,
        args: &[String],
        _env: &IndexMap<String, DefaultValue>,
    ) -> Result<u32, DriverError> {
        let n = {
            let mut launches = self.launches.lock().unwrap();
            let n = launches.entry(self.device.clone()).or_insert(0);
            *n += 1;
            *n
        };
        if args.is_empty() {
            self.record(format!("launch #{n}"));
        } else {
            self.record(format!("launch #{n} {}", args.join(" ")));
        }

        let crashes = self.script.always_crash || self.script.crash_on_launches.contains(&n);
        self.running = !crashes;
        if self.running {
            let mut state = self.script.initial.clone();
            if let Some((key, first_state)) = &self.script.launch_counter {
                let count = match self.defaults.get(key) {
                    Some(DefaultValue::Int(count)) => *count,
                    _ => 0,
                };
                if count == 0 {
                    state = first_state.clone();
                }
                self.defaults.insert(key.clone(), DefaultValue::Int(count + 1));
            }
            self.enter(&state);
        }
        Ok(1000 + n)
    }

    async fn terminate_app(&mut self) -> Result<(), DriverError> {
        self.running = false;
        Ok(())
    }

    async fn fetch_tree(&mut self) -> Result<AccessibilityNode, DriverError> {
        if !self.script.fetch_delay.is_zero() {
            tokio::time::sleep(self.script.fetch_delay).await;
        }
        self.ensure_running()?;
        Ok(self.current.clone())
    }

    async fn tap(&mut self, at: Point) -> Result<(), DriverError> {
        self.ensure_running()?;
        let target = self
            .current
            .walk()
            .into_iter()
            .filter(|r| hit(&r.node.frame, at))
            .last()
            .map(|r| (r.node.role, r.node.label.clone()));
        let Some((role, label)) = target else {
            self.record(format!("tap ({}, {}) on nothing", at.x, at.y));
            return Ok(());
        };
        self.record(format!("tap \"{label}\""));

        if role == Role::SwitchControl {
            flip_switch(&mut self.current, &label);
        }
        if let Some(next) = self
            .script
            .transitions
            .get(&(self.state.clone(), label))
            .cloned()
        {
            self.enter(&next);
        }
        Ok(())
    }

    async fn swipe(&mut self, from: Point, to: Point) -> Result<(), DriverError> {
        self.ensure_running()?;
        self.record(format!("swipe ({}, {}) -> ({}, {})", from.x, from.y, to.x, to.y));
        if let Some(next) = self
            .script
            .transitions
            .get(&(self.state.clone(), SWIPE.to_string()))
            .cloned()
        {
            self.enter(&next);
        }
        Ok(())
    }

    async fn type_text(&mut self, text: &str) -> Result<(), DriverError> {
        self.ensure_running()?;
        self.record(format!("type \"{text}\""));
        type_into_focused(&mut self.current, text);
        Ok(())
    }

    async fn screenshot(&mut self, path: &Utf8Path) -> Result<(), DriverError> {
        self.ensure_running()?;
        std::fs::write(path, format!("{}:{}", self.device, self.state))?;
        self.record(format!("screenshot {}", self.state));
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        if !self.script.shutdown_delay.is_zero() {
            tokio::time::sleep(self.script.shutdown_delay).await;
        }
        self.record("shutdown".to_string());
        Ok(())
    }
}

// Fixtures

/// Settings with every wait shortened for tests.
pub fn fast_settings() -> RunSettings {
    RunSettings {
        max_attempts: 3,
        max_parallel_devices: 2,
        step_timeout_ms: 2_000,
        verify_retries: 2,
        verify_interval_ms: 1,
        scroll_attempts: 2,
        alert_timeout_ms: 20,
        launch_settle_ms: 0,
        command_timeout_secs: 5,
        run_timeout_secs: None,
        ..RunSettings::default()
    }
}

pub fn device(name: &str) -> DeviceProfile {
    DeviceProfile::new(name, "iPhone-16-Pro-Max", "com.apple.CoreSimulator.SimRuntime.iOS-26-1")
}

pub fn text(label: &str, y: f64) -> AccessibilityNode {
    AccessibilityNode::new(Role::Text, label, Rect::new(20.0, y, 300.0, 30.0))
}

pub fn tab(label: &str, x: f64, selected: bool) -> AccessibilityNode {
    AccessibilityNode::new(Role::Tab, label, Rect::new(x, 780.0, 130.0, 64.0))
        .with_value(if selected { "1" } else { "0" })
}

pub fn screen_with(children: Vec<AccessibilityNode>) -> AccessibilityNode {
    AccessibilityNode::new(Role::Other, "Demo", SCREEN).with_children(children)
}

/// Dashboard with a Home / Activity / Settings tab bar.
pub fn home_tree() -> AccessibilityNode {
    screen_with(vec![
        text("Dashboard", 100.0),
        text("Weekly summary", 140.0),
        tab("Home", 0.0, true),
        tab("Activity", 130.0, false),
        tab("Settings", 260.0, false),
    ])
}

pub fn settings_tree() -> AccessibilityNode {
    screen_with(vec![
        AccessibilityNode::new(Role::NavBar, "Settings", Rect::new(0.0, 47.0, 390.0, 44.0))
            .with_children(vec![text("Settings", 55.0)]),
        AccessibilityNode::new(
            Role::SwitchControl,
            "Notifications",
            Rect::new(300.0, 150.0, 60.0, 30.0),
        )
        .with_value("0"),
        AccessibilityNode::new(Role::Cell, "", Rect::new(0.0, 200.0, 390.0, 44.0))
            .with_children(vec![text("Account", 210.0)]),
        tab("Home", 0.0, false),
        tab("Activity", 130.0, false),
        tab("Settings", 260.0, true),
    ])
}

pub fn account_tree() -> AccessibilityNode {
    screen_with(vec![
        AccessibilityNode::new(Role::NavBar, "Account", Rect::new(0.0, 47.0, 390.0, 44.0))
            .with_children(vec![AccessibilityNode::new(
                Role::Button,
                "Settings",
                Rect::new(8.0, 50.0, 90.0, 38.0),
            )]),
        AccessibilityNode::new(Role::TextField, "Display name", Rect::new(20.0, 120.0, 350.0, 40.0))
            .with_focus(),
    ])
}

/// Two tab bar items both labelled "Settings".
pub fn duplicate_tabs_tree() -> AccessibilityNode {
    screen_with(vec![
        text("Dashboard", 100.0),
        tab("Home", 0.0, true),
        tab("Settings", 130.0, false),
        tab("Settings", 260.0, false),
    ])
}

/// The demo app: home -> settings -> account, with back navigation.
pub fn demo_app() -> AppScript {
    AppScript::new("home")
        .state("home", home_tree())
        .state("settings", settings_tree())
        .state("account", account_tree())
        .on_tap("home", "Settings", "settings")
        .on_tap("settings", "Home", "home")
        .on_tap("settings", "Account", "account")
        .on_tap("account", "Settings", "settings")
}

pub fn temp_output() -> (tempfile::TempDir, Utf8PathBuf) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::try_from(temp.path().join("screenshots")).unwrap();
    (temp, root)
}

pub fn orchestrator(
    connector: &FakeConnector,
    settings: RunSettings,
    output: &Utf8Path,
) -> CaptureOrchestrator {
    CaptureOrchestrator::new(
        Arc::new(connector.clone()),
        settings,
        OutputLayout::new(output, OrganizeBy::Device, "png"),
    )
}
