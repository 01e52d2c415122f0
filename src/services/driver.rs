//! The device seam: everything the engine needs from a simulator or device.
//!
//! [`DeviceDriver`] is deliberately low-level (seed, launch, fetch tree, send one input
//! event, screenshot). Lifecycle rules live in [`SessionController`](super::SessionController)
//! and navigation semantics in [`ActionExecutor`](super::ActionExecutor).

use crate::models::{AccessibilityNode, DefaultValue, DeviceProfile, FileFixture, Point};
use async_trait::async_trait;
use camino::Utf8Path;
use indexmap::IndexMap;
use std::time::Duration;
use thiserror::Error;

/// Errors reported by a device driver
#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("App is not running")]
    AppNotRunning,

    #[error("Command failed: {0}")]
    CommandFailed(String),

    #[error("Process error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unexpected output: {0}")]
    Parse(String),
}

/// One exclusively-owned device.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeviceDriver: Send {
    /// Boot the device and install the app if needed.
    async fn prepare(&mut self) -> Result<(), DriverError>;

    /// Remove every seeded default of the app.
    async fn reset_defaults(&mut self) -> Result<(), DriverError>;

    async fn write_default(&mut self, key: &str, value: &DefaultValue) -> Result<(), DriverError>;

    /// Copy fixture files into the app's data container.
    async fn install_files(&mut self, files: &[FileFixture]) -> Result<(), DriverError>;

    /// Start the app with extra arguments and a launch environment, returning its pid.
    async fn launch_app(
        &mut self,
        args: &[String],
        env: &IndexMap<String, DefaultValue>,
    ) -> Result<u32, DriverError>;

    async fn terminate_app(&mut self) -> Result<(), DriverError>;

    /// Fresh accessibility snapshot. `AppNotRunning` when the app has gone away.
    async fn fetch_tree(&mut self) -> Result<AccessibilityNode, DriverError>;

    async fn tap(&mut self, at: Point) -> Result<(), DriverError>;

    async fn swipe(&mut self, from: Point, to: Point) -> Result<(), DriverError>;

    /// Type into whatever currently holds keyboard focus.
    async fn type_text(&mut self, text: &str) -> Result<(), DriverError>;

    async fn screenshot(&mut self, path: &Utf8Path) -> Result<(), DriverError>;

    async fn shutdown(&mut self) -> Result<(), DriverError>;
}

/// Hands out drivers, one per device profile.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    async fn connect(&self, profile: &DeviceProfile) -> Result<Box<dyn DeviceDriver>, DriverError>;
}
