//! Services module - the capture engine.
//!
//! Everything here is independent of the CLI: the binary only builds a
//! [`CaptureOrchestrator`], hands it validated screens and devices, and prints what comes
//! back.
//!
//! # Components
//!
//! - [`locator`]: pure resolution of a step target against an accessibility snapshot.
//!   Identifier match first, then exact label, then case-insensitive substring; more than
//!   one hit is an [`AmbiguousMatch`](LocatorError::AmbiguousMatch), never a guess.
//!
//! - [`ActionExecutor`]: applies one [`NavigationStep`](crate::models::NavigationStep) to a
//!   [`Session`] and verifies that it took effect, classifying failures as
//!   [`NavigationError`].
//!
//! - [`SessionController`]: acquires devices through a [`DeviceConnector`], seeds defaults,
//!   (re)launches the app and tracks crashes.
//!
//! - [`CaptureOrchestrator`]: runs every (screen, device) pair with bounded device
//!   parallelism, retry on transient failures and cooperative cancellation.
//!
//! - [`OutputLayout`]: deterministic screenshot paths.
//!
//! - [`simctl`]: the iOS simulator implementation of [`DeviceDriver`].
//!
//! # Usage Example
//!
//! ```ignore
//! use appshots::services::{CaptureOrchestrator, OutputLayout, SimctlConnector};
//!
//! let connector = Arc::new(SimctlConnector::new(&config, &settings));
//! let layout = OutputLayout::from_config(&config.output);
//! let orchestrator = CaptureOrchestrator::new(connector, settings, layout);
//! let results = orchestrator
//!     .run_raw(&config.screens, &config.device_profiles(), cancel_rx)
//!     .await?;
//! ```

pub mod driver;
pub mod executor;
pub mod locator;
pub mod orchestrator;
pub mod output;
pub mod session;
pub mod simctl;

pub use driver::{DeviceConnector, DeviceDriver, DriverError};
pub use executor::{ActionExecutor, NavigationError};
pub use locator::{Candidate, LocatorError};
pub use orchestrator::{CaptureOrchestrator, batch_order};
pub use output::OutputLayout;
pub use session::{Session, SessionController, SessionState};
pub use simctl::{SimctlConnector, SimctlDriver, clean_simulators};
