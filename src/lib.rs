// AppShots - App Store screenshot capture for iOS simulators
//
// This is the library crate containing the capture engine and data structures.
// The binary crate (main.rs) provides the command-line entry point.

pub mod config;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod report;
pub mod services;
pub mod state;

// Re-export commonly used types for convenience
pub use config::ConfigManager;
pub use models::{AppShotsConfig, CaptureResult, CaptureStatus, RunSettings, Screen};
pub use report::RunReport;
pub use services::CaptureOrchestrator;
pub use state::{ReachabilityChange, ReachabilityState, ReachabilityTracker};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
