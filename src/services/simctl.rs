//! iOS simulator driver.
//!
//! Lifecycle, seeding, launching and screenshots go through `xcrun simctl`. The
//! accessibility tree and input events go through an external bridge command (`idb` by
//! default); the tree command is a template so other bridges can be plugged in.

use crate::models::{
    AccessibilityNode, AppShotsConfig, DefaultValue, DeviceProfile, FileFixture, Point, Rect,
    Role, RunSettings,
};
use crate::services::driver::{DeviceConnector, DeviceDriver, DriverError};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use std::process::Stdio;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::time::timeout;

/// Prefix of every simulator this tool creates.
pub const SIMULATOR_PREFIX: &str = "AppShots-";

static ISO_DATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}(:\d{2}(\.\d+)?)?(Z|[+-]\d{2}:?\d{2})?$")
        .expect("Invalid ISO-8601 regex")
});

/// Run one external command and return its stdout.
///
/// # Arguments
///
/// * `program` - Executable to run (resolved through `PATH`)
/// * `args` - Arguments, passed without a shell
/// * `envs` - Extra environment variables for the child
/// * `limit` - Kill the child and fail with [`DriverError::Timeout`] after this long
pub async fn run_command(
    program: &str,
    args: &[String],
    envs: &[(String, String)],
    limit: Duration,
) -> Result<String, DriverError> {
    tracing::debug!("Executing: {} {}", program, args.join(" "));
    let start = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = timeout(limit, cmd.output()).await.map_err(|_| {
        tracing::warn!("{} timed out after {:?}", program, limit);
        DriverError::Timeout(limit)
    })??;

    tracing::trace!(
        "{} completed in {:.2}s with status {}",
        program,
        start.elapsed().as_secs_f32(),
        output.status
    );

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(DriverError::CommandFailed(format!(
            "{} {} ({}): {}",
            program,
            args.first().map(String::as_str).unwrap_or_default(),
            output.status,
            stderr
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

async fn simctl(args: &[&str], limit: Duration) -> Result<String, DriverError> {
    let mut full = vec!["simctl".to_string()];
    full.extend(strings(args));
    run_command("xcrun", &full, &[], limit).await
}

/// What every driver of a run shares.
#[derive(Debug, Clone)]
pub struct SimctlConfig {
    pub bundle_id: String,
    pub app_path: Option<Utf8PathBuf>,
    pub tree_command: String,
    pub command_timeout: Duration,
}

impl SimctlConfig {
    pub fn new(config: &AppShotsConfig, settings: &RunSettings) -> Self {
        Self {
            bundle_id: config.app.bundle_id.clone(),
            app_path: config.app.app_path.clone(),
            tree_command: settings.tree_command.clone(),
            command_timeout: settings.command_timeout(),
        }
    }
}

// simctl list devices -j
#[derive(Debug, Deserialize)]
struct DeviceList {
    devices: IndexMap<String, Vec<SimDevice>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SimDevice {
    name: String,
    udid: String,
    #[serde(default)]
    state: String,
    #[serde(rename = "isAvailable", default = "available")]
    is_available: bool,
}

fn available() -> bool {
    true
}

fn parse_device_list(json: &str) -> Result<Vec<(String, SimDevice)>, DriverError> {
    let list: DeviceList =
        serde_json::from_str(json).map_err(|e| DriverError::Parse(format!("device list: {e}")))?;
    Ok(list
        .devices
        .into_iter()
        .flat_map(|(runtime, devices)| devices.into_iter().map(move |d| (runtime.clone(), d)))
        .collect())
}

async fn list_devices(limit: Duration) -> Result<Vec<(String, SimDevice)>, DriverError> {
    let json = simctl(&["list", "devices", "-j"], limit).await?;
    parse_device_list(&json)
}

pub fn simulator_name(profile: &DeviceProfile) -> String {
    format!("{}{}", SIMULATOR_PREFIX, profile.name)
}

/// Hands out one dedicated simulator per device profile, creating it on first use.
pub struct SimctlConnector {
    config: Arc<SimctlConfig>,
}

impl SimctlConnector {
    pub fn new(config: &AppShotsConfig, settings: &RunSettings) -> Self {
        Self {
            config: Arc::new(SimctlConfig::new(config, settings)),
        }
    }

    async fn find_or_create(&self, profile: &DeviceProfile) -> Result<String, DriverError> {
        let name = simulator_name(profile);
        let limit = self.config.command_timeout;

        let existing = list_devices(limit).await?.into_iter().find(|(runtime, d)| {
            d.name == name && d.is_available && runtime == &profile.runtime
        });
        if let Some((_, device)) = existing {
            tracing::debug!("Reusing simulator {} ({})", name, device.udid);
            return Ok(device.udid);
        }

        tracing::info!(
            "Creating simulator {} ({}, {})",
            name,
            profile.device_type,
            profile.runtime
        );
        let out = simctl(
            &["create", &name, &profile.device_type, &profile.runtime],
            limit,
        )
        .await?;
        let udid = out.trim().to_string();
        if udid.is_empty() {
            return Err(DriverError::Parse(format!(
                "simctl create returned no UDID for {name}"
            )));
        }
        Ok(udid)
    }
}

#[async_trait]
impl DeviceConnector for SimctlConnector {
    async fn connect(&self, profile: &DeviceProfile) -> Result<Box<dyn DeviceDriver>, DriverError> {
        let udid = self.find_or_create(profile).await?;
        Ok(Box::new(SimctlDriver {
            udid,
            name: simulator_name(profile),
            config: Arc::clone(&self.config),
            last_tap: None,
        }))
    }
}

/// One booted simulator.
pub struct SimctlDriver {
    udid: String,
    name: String,
    config: Arc<SimctlConfig>,
    /// Where the last tap landed; used to tell which text field holds focus.
    last_tap: Option<Point>,
}

impl SimctlDriver {
    fn limit(&self) -> Duration {
        self.config.command_timeout
    }

    async fn simctl(&self, args: &[&str]) -> Result<String, DriverError> {
        simctl(args, self.limit()).await
    }

    async fn spawn(&self, args: &[&str]) -> Result<String, DriverError> {
        let mut full = vec!["spawn", self.udid.as_str()];
        full.extend_from_slice(args);
        self.simctl(&full).await
    }

    async fn idb_ui(&self, args: Vec<String>) -> Result<(), DriverError> {
        let mut full = strings(&["ui"]);
        full.extend(args);
        full.push("--udid".to_string());
        full.push(self.udid.clone());
        run_command("idb", &full, &[], self.limit()).await?;
        Ok(())
    }

    async fn app_running(&self) -> Result<bool, DriverError> {
        let services = self.spawn(&["launchctl", "list"]).await?;
        let marker = format!("UIKitApplication:{}", self.config.bundle_id);
        Ok(services.contains(&marker))
    }
}

#[async_trait]
impl DeviceDriver for SimctlDriver {
    async fn prepare(&mut self) -> Result<(), DriverError> {
        let state = list_devices(self.limit())
            .await?
            .into_iter()
            .find(|(_, d)| d.udid == self.udid)
            .map(|(_, d)| d.state)
            .unwrap_or_default();

        if state != "Booted" {
            tracing::info!("Booting {} ({})", self.name, self.udid);
            self.simctl(&["boot", &self.udid]).await?;
        }
        self.simctl(&["bootstatus", &self.udid, "-b"]).await?;

        if let Some(app_path) = &self.config.app_path {
            tracing::info!("Installing {} on {}", app_path, self.name);
            self.simctl(&["install", &self.udid, app_path.as_str()]).await?;
        }
        Ok(())
    }

    async fn reset_defaults(&mut self) -> Result<(), DriverError> {
        let bundle = self.config.bundle_id.clone();
        // Fails when the domain does not exist yet.
        if let Err(e) = self.spawn(&["defaults", "delete", &bundle]).await {
            tracing::debug!("defaults delete {}: {}", bundle, e);
        }
        Ok(())
    }

    async fn write_default(&mut self, key: &str, value: &DefaultValue) -> Result<(), DriverError> {
        let bundle = self.config.bundle_id.clone();
        let typed = default_args(key, value);
        let mut args = vec!["defaults", "write", bundle.as_str()];
        args.extend(typed.iter().map(String::as_str));
        self.spawn(&args).await?;
        Ok(())
    }

    async fn install_files(&mut self, files: &[FileFixture]) -> Result<(), DriverError> {
        if files.is_empty() {
            return Ok(());
        }
        let out = self
            .simctl(&["get_app_container", &self.udid, &self.config.bundle_id, "data"])
            .await?;
        let container = Utf8PathBuf::from(out.trim());
        if container.as_str().is_empty() {
            return Err(DriverError::Parse("empty app container path".to_string()));
        }

        for file in files {
            let src = expand_home(&file.src);
            let dest = container.join(file.destination());
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&src, &dest).await.map_err(|e| {
                DriverError::CommandFailed(format!("copy {src} -> {dest}: {e}"))
            })?;
            tracing::debug!("[{}] copied {} -> {}", self.name, src, dest);
        }
        Ok(())
    }

    async fn launch_app(
        &mut self,
        args: &[String],
        env: &IndexMap<String, DefaultValue>,
    ) -> Result<u32, DriverError> {
        let envs = child_env(env);
        let argv = launch_argv(&self.udid, &self.config.bundle_id, args);
        let out = run_command("xcrun", &argv, &envs, self.limit()).await?;
        self.last_tap = None;
        parse_launch_pid(&out)
            .ok_or_else(|| DriverError::Parse(format!("no pid in launch output: {}", out.trim())))
    }

    async fn terminate_app(&mut self) -> Result<(), DriverError> {
        self.simctl(&["terminate", &self.udid, &self.config.bundle_id])
            .await?;
        Ok(())
    }

    async fn fetch_tree(&mut self) -> Result<AccessibilityNode, DriverError> {
        if !self.app_running().await? {
            return Err(DriverError::AppNotRunning);
        }
        let mut command = render_command(&self.config.tree_command, &self.udid);
        if command.is_empty() {
            return Err(DriverError::CommandFailed("empty tree command".to_string()));
        }
        let program = command.remove(0);
        let json = run_command(&program, &command, &[], self.limit()).await?;
        parse_tree(&json, self.last_tap)
    }

    async fn tap(&mut self, at: Point) -> Result<(), DriverError> {
        self.idb_ui(vec![
            "tap".to_string(),
            coord(at.x),
            coord(at.y),
        ])
        .await?;
        self.last_tap = Some(at);
        Ok(())
    }

    async fn swipe(&mut self, from: Point, to: Point) -> Result<(), DriverError> {
        self.idb_ui(vec![
            "swipe".to_string(),
            coord(from.x),
            coord(from.y),
            coord(to.x),
            coord(to.y),
        ])
        .await
    }

    async fn type_text(&mut self, text: &str) -> Result<(), DriverError> {
        self.idb_ui(vec!["text".to_string(), text.to_string()]).await
    }

    async fn screenshot(&mut self, path: &Utf8Path) -> Result<(), DriverError> {
        self.simctl(&["io", &self.udid, "screenshot", path.as_str()])
            .await?;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), DriverError> {
        tracing::info!("Shutting down {}", self.name);
        self.simctl(&["shutdown", &self.udid]).await?;
        Ok(())
    }
}

/// Delete every simulator whose name carries [`SIMULATOR_PREFIX`].
pub async fn clean_simulators(limit: Duration) -> anyhow::Result<usize> {
    let mut removed = 0;
    for (_, device) in list_devices(limit).await? {
        if !device.name.starts_with(SIMULATOR_PREFIX) {
            continue;
        }
        if device.state == "Booted"
            && let Err(e) = simctl(&["shutdown", &device.udid], limit).await
        {
            tracing::warn!("Failed to shut down {}: {}", device.name, e);
        }
        simctl(&["delete", &device.udid], limit).await?;
        tracing::info!("Deleted {} ({})", device.name, device.udid);
        removed += 1;
    }
    Ok(removed)
}

fn coord(v: f64) -> String {
    format!("{}", v.round() as i64)
}

/// `defaults write` arguments for one typed value.
pub fn default_args(key: &str, value: &DefaultValue) -> Vec<String> {
    let (flag, rendered) = match value {
        DefaultValue::Bool(b) => ("-bool", if *b { "YES" } else { "NO" }.to_string()),
        DefaultValue::Int(i) => ("-int", i.to_string()),
        DefaultValue::Float(f) => ("-float", f.to_string()),
        DefaultValue::Text(s) if ISO_DATE.is_match(s) => ("-date", s.clone()),
        DefaultValue::Text(s) => ("-string", s.clone()),
    };
    vec![key.to_string(), flag.to_string(), rendered]
}

/// simctl forwards `SIMCTL_CHILD_*` variables to the launched app with the prefix stripped.
fn child_env(env: &IndexMap<String, DefaultValue>) -> Vec<(String, String)> {
    env.iter()
        .map(|(k, v)| (format!("SIMCTL_CHILD_{k}"), v.to_string()))
        .collect()
}

/// `xcrun` argv for launching the app; `args` go to the app process.
pub fn launch_argv(udid: &str, bundle_id: &str, args: &[String]) -> Vec<String> {
    let mut argv = strings(&["simctl", "launch", udid, bundle_id]);
    argv.extend(args.iter().cloned());
    argv
}

/// `~/x` -> `$HOME/x`; anything else is returned as is.
fn expand_home(path: &Utf8Path) -> Utf8PathBuf {
    match (path.strip_prefix("~"), std::env::var("HOME")) {
        (Ok(rest), Ok(home)) => Utf8PathBuf::from(home).join(rest),
        _ => path.to_path_buf(),
    }
}

/// `com.example.app: 12345` -> 12345
pub fn parse_launch_pid(output: &str) -> Option<u32> {
    output
        .lines()
        .rev()
        .find_map(|line| line.rsplit(':').next()?.trim().parse().ok())
}

/// Split a command template into argv, substituting `{udid}`.
pub fn render_command(template: &str, udid: &str) -> Vec<String> {
    template
        .split_whitespace()
        .map(|token| token.replace("{udid}", udid))
        .collect()
}

/// Element as reported by `idb ui describe-all`.
#[derive(Debug, Deserialize)]
struct FlatElement {
    #[serde(rename = "AXLabel", default)]
    label: Option<String>,
    #[serde(rename = "AXUniqueId", default)]
    identifier: Option<String>,
    #[serde(rename = "AXValue", default)]
    value: Option<String>,
    #[serde(rename = "type", default)]
    element_type: Option<String>,
    #[serde(default)]
    role_description: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    frame: Rect,
}

impl FlatElement {
    fn resolve_role(&self) -> Role {
        // role_description distinguishes tab bar items from plain buttons.
        [&self.role_description, &self.element_type, &self.role]
            .into_iter()
            .flatten()
            .map(|raw| Role::from_raw(raw))
            .find(|role| *role != Role::Other)
            .unwrap_or(Role::Other)
    }

    fn is_keyboard(&self) -> bool {
        [&self.element_type, &self.role_description]
            .into_iter()
            .flatten()
            .any(|raw| raw.eq_ignore_ascii_case("keyboard"))
    }

    fn into_node(self) -> AccessibilityNode {
        let role = self.resolve_role();
        let mut node = AccessibilityNode::new(role, self.label.unwrap_or_default(), self.frame);
        node.identifier = self.identifier.filter(|s| !s.is_empty());
        node.value = self.value.filter(|s| !s.is_empty());
        node
    }
}

/// Parse bridge output into a tree.
///
/// Accepts either a nested object in the [`AccessibilityNode`] shape or the flat element
/// array `idb` prints. For the flat form the hierarchy is rebuilt from frame containment,
/// and when a keyboard is on screen the text field under the last tap is marked focused.
pub fn parse_tree(json: &str, last_tap: Option<Point>) -> Result<AccessibilityNode, DriverError> {
    let value: serde_json::Value =
        serde_json::from_str(json).map_err(|e| DriverError::Parse(format!("tree: {e}")))?;

    match value {
        serde_json::Value::Object(_) => serde_json::from_value(value)
            .map_err(|e| DriverError::Parse(format!("tree: {e}"))),
        serde_json::Value::Array(_) => {
            let elements: Vec<FlatElement> = serde_json::from_value(value)
                .map_err(|e| DriverError::Parse(format!("tree: {e}")))?;
            Ok(build_hierarchy(elements, last_tap))
        }
        other => Err(DriverError::Parse(format!(
            "tree: expected object or array, got {other}"
        ))),
    }
}

fn is_container(role: Role) -> bool {
    matches!(role, Role::Other | Role::NavBar | Role::Alert | Role::Cell)
}

fn area(rect: &Rect) -> f64 {
    rect.width.max(0.0) * rect.height.max(0.0)
}

fn contains_point(rect: &Rect, p: Point) -> bool {
    p.x >= rect.x && p.y >= rect.y && p.x <= rect.x + rect.width && p.y <= rect.y + rect.height
}

fn build_hierarchy(elements: Vec<FlatElement>, last_tap: Option<Point>) -> AccessibilityNode {
    let keyboard_up = elements.iter().any(FlatElement::is_keyboard);
    let mut nodes: Vec<AccessibilityNode> =
        elements.into_iter().map(FlatElement::into_node).collect();

    if keyboard_up {
        mark_focus(&mut nodes, last_tap);
    }

    // Largest first, so every candidate parent is placed before its children.
    let mut order: Vec<usize> = (0..nodes.len()).collect();
    order.sort_by(|&a, &b| area(&nodes[b].frame).total_cmp(&area(&nodes[a].frame)));

    let mut parent: Vec<Option<usize>> = vec![None; nodes.len()];
    for (pos, &i) in order.iter().enumerate() {
        parent[i] = order[..pos].iter().rev().copied().find(|&j| {
            is_container(nodes[j].role) && nodes[j].frame.contains(&nodes[i].frame)
        });
    }

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); nodes.len()];
    let mut roots = Vec::new();
    for (i, p) in parent.iter().enumerate() {
        match p {
            Some(p) => children[*p].push(i),
            None => roots.push(i),
        }
    }

    match roots.as_slice() {
        [single] => assemble(*single, &nodes, &children),
        _ => {
            let frame = roots
                .iter()
                .map(|&r| nodes[r].frame)
                .max_by(|a, b| area(a).total_cmp(&area(b)))
                .unwrap_or_default();
            AccessibilityNode::new(Role::Other, "", frame).with_children(
                roots
                    .iter()
                    .map(|&r| assemble(r, &nodes, &children))
                    .collect(),
            )
        }
    }
}

fn mark_focus(nodes: &mut [AccessibilityNode], last_tap: Option<Point>) {
    let fields: Vec<usize> = nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.role == Role::TextField)
        .map(|(i, _)| i)
        .collect();

    let focused = last_tap
        .and_then(|p| fields.iter().copied().find(|&i| contains_point(&nodes[i].frame, p)))
        .or(match fields.as_slice() {
            [only] => Some(*only),
            _ => None,
        });

    if let Some(i) = focused {
        nodes[i].focused = true;
    }
}

fn assemble(
    index: usize,
    nodes: &[AccessibilityNode],
    children: &[Vec<usize>],
) -> AccessibilityNode {
    let mut node = nodes[index].clone();
    node.children = children[index]
        .iter()
        .map(|&c| assemble(c, nodes, children))
        .collect();
    node
}
