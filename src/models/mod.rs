//! Data models for AppShots.
//!
//! - [`AccessibilityNode`]: one snapshot of the app's accessibility tree
//! - [`NavigationStep`]: a validated UI action, parsed from planner output ([`RawStep`])
//! - [`Screen`]: a capture target (a [`LaunchSeed`] plus ordered steps)
//! - [`DeviceProfile`] / [`CaptureResult`]: where a screen is captured and how it ended
//! - [`AppShotsConfig`] / [`RunSettings`]: the project file and run tunables

pub mod config;
pub mod screen;
pub mod step;
pub mod tree;

pub use config::{AppConfig, AppShotsConfig, DeviceEntry, OrganizeBy, OutputConfig, RunSettings};
pub use screen::{
    CaptureResult, CaptureStatus, DefaultValue, DeviceProfile, FileFixture, LaunchSeed, RawScreen,
    Resolution, Screen, validate_screens,
};
pub use step::{AlertPolicy, NavigationStep, PlanError, RawStep, StepKind, SwipeDirection};
pub use tree::{AccessibilityNode, NodeRef, Point, Rect, Role};
