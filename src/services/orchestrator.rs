//! Capture orchestration across screens and devices.
//!
//! One pipeline task per device, at most `max_parallel_devices` of them running at once
//! (semaphore permits). Inside a pipeline, screens run strictly one after another; screens
//! sharing a seed run back to back. Every screen still gets its own reset, seed and launch.
//!
//! Cancellation arrives on a `watch` channel (user interrupt) or from the run timeout. It is
//! raced against every await that can take long, so in-flight work stops promptly; pairs
//! that were not captured by then end as `Failed` with reason "cancelled".

use crate::metrics::Metrics;
use crate::models::{
    CaptureResult, DeviceProfile, PlanError, RawScreen, RunSettings, Screen, StepKind,
    validate_screens,
};
use crate::services::driver::DeviceConnector;
use crate::services::executor::{ActionExecutor, NavigationError};
use crate::services::output::OutputLayout;
use crate::services::session::{Session, SessionController};
use crate::state::ReachabilityTracker;
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Semaphore, watch};
use tokio::time::Instant;

const CANCELLED: &str = "cancelled";

/// Resolves once the run is cancelled. Never resolves if the sender is gone without
/// cancelling.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Screen indexes in execution order: groups of identical seeds by first appearance,
/// declared order inside a group.
pub fn batch_order(screens: &[Screen]) -> Vec<usize> {
    let mut groups: IndexMap<String, Vec<usize>> = IndexMap::new();
    for (index, screen) in screens.iter().enumerate() {
        groups.entry(screen.seed_key()).or_default().push(index);
    }
    groups.into_values().flatten().collect()
}

/// Why one attempt at a screen stopped.
#[derive(Debug)]
enum AttemptFailure {
    Launch(NavigationError),
    Step {
        index: usize,
        kind: StepKind,
        error: NavigationError,
    },
    Screenshot(NavigationError),
    Output(String),
    Cancelled,
}

impl AttemptFailure {
    fn is_retryable(&self) -> bool {
        match self {
            AttemptFailure::Launch(e)
            | AttemptFailure::Screenshot(e)
            | AttemptFailure::Step { error: e, .. } => e.is_retryable(),
            AttemptFailure::Output(_) | AttemptFailure::Cancelled => false,
        }
    }

    fn is_unreachable(&self) -> bool {
        matches!(self, AttemptFailure::Step { error, .. } if error.is_unreachable())
    }
}

impl fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptFailure::Launch(e) => write!(f, "{e} (launch)"),
            AttemptFailure::Step { index, kind, error } => {
                write!(f, "{error} (step {index}: {kind})")
            }
            AttemptFailure::Screenshot(e) => write!(f, "{e} (screenshot)"),
            AttemptFailure::Output(msg) => write!(f, "output: {msg}"),
            AttemptFailure::Cancelled => f.write_str(CANCELLED),
        }
    }
}

/// Everything a device pipeline needs; cheap to clone into a task.
#[derive(Clone)]
struct Pipeline {
    sessions: SessionController,
    executor: ActionExecutor,
    settings: Arc<RunSettings>,
    layout: OutputLayout,
    tracker: ReachabilityTracker,
    metrics: Arc<Metrics>,
}

pub struct CaptureOrchestrator {
    pipeline: Pipeline,
}

impl CaptureOrchestrator {
    pub fn new(
        connector: Arc<dyn DeviceConnector>,
        settings: RunSettings,
        layout: OutputLayout,
    ) -> Self {
        let settings = Arc::new(settings);
        Self {
            pipeline: Pipeline {
                sessions: SessionController::new(connector, settings.clone()),
                executor: ActionExecutor::new(settings.clone()),
                settings,
                layout,
                tracker: ReachabilityTracker::new(),
                metrics: Arc::new(Metrics::new()),
            },
        }
    }

    /// Tracker of the current (or last) run. Subscribe before `run` to see every transition.
    pub fn tracker(&self) -> &ReachabilityTracker {
        &self.pipeline.tracker
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.pipeline.metrics.clone()
    }

    /// Validate planner records, then run them.
    ///
    /// # Errors
    /// A [`PlanError`] before any device work; no results are produced in that case.
    pub async fn run_raw(
        &self,
        raw: &[RawScreen],
        devices: &[DeviceProfile],
        cancel: watch::Receiver<bool>,
    ) -> Result<Vec<CaptureResult>, PlanError> {
        let screens = validate_screens(raw)?;
        let mut names = HashSet::new();
        for device in devices {
            if !names.insert(device.name.as_str()) {
                return Err(PlanError::DuplicateDevice(device.name.clone()));
            }
        }
        Ok(self.run(&screens, devices, cancel).await)
    }

    /// Capture every screen on every device.
    ///
    /// # Returns
    /// Exactly one result per (screen, device) pair, in device order then declared screen
    /// order. Device names must be unique.
    pub async fn run(
        &self,
        screens: &[Screen],
        devices: &[DeviceProfile],
        cancel: watch::Receiver<bool>,
    ) -> Vec<CaptureResult> {
        let pipeline = &self.pipeline;
        pipeline.tracker.clear();
        for device in devices {
            for screen in screens {
                pipeline.tracker.register(screen.id(), &device.name);
            }
        }

        let limit = pipeline.settings.max_parallel_devices.max(1);
        tracing::info!(
            "Capturing {} screens on {} devices (max parallel devices: {})",
            screens.len(),
            devices.len(),
            limit
        );

        // Run-wide stop signal: external cancel or the run timeout, whichever comes first.
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut external = cancel.clone();
        let run_timeout = pipeline.settings.run_timeout();
        let watchdog = tokio::spawn(async move {
            let timed_out = async {
                match run_timeout {
                    Some(limit) => tokio::time::sleep(limit).await,
                    None => std::future::pending::<()>().await,
                }
            };
            tokio::select! {
                _ = cancelled(&mut external) => tracing::warn!("Capture run cancelled"),
                _ = timed_out => tracing::warn!("Run timeout reached, cancelling"),
            }
            let _ = stop_tx.send(true);
        });

        let semaphore = Arc::new(Semaphore::new(limit));
        let screens = Arc::new(screens.to_vec());
        let mut tasks = Vec::with_capacity(devices.len());

        for profile in devices {
            let pipeline = pipeline.clone();
            let profile = profile.clone();
            let screens = screens.clone();
            let semaphore = semaphore.clone();
            let mut stop = stop_rx.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return,
                    },
                    _ = cancelled(&mut stop) => {
                        tracing::warn!("[{}] cancelled before start", profile.name);
                        return;
                    }
                };
                pipeline.run_device(&profile, &screens, stop).await;
            }));
        }

        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Device pipeline join error: {}", e);
            }
        }
        watchdog.abort();

        let reason = if *stop_rx.borrow() {
            CANCELLED
        } else {
            "device pipeline aborted"
        };
        let incomplete = pipeline.tracker.fail_incomplete(reason);
        if incomplete > 0 {
            tracing::warn!("{} screen captures did not complete ({})", incomplete, reason);
        }

        let results = pipeline.tracker.results();
        for result in &results {
            pipeline.metrics.record_outcome(result.status);
        }
        results
    }
}

impl Pipeline {
    async fn run_device(
        &self,
        profile: &DeviceProfile,
        screens: &[Screen],
        mut stop: watch::Receiver<bool>,
    ) {
        let device = profile.name.as_str();
        tracing::info!("[{}] starting pipeline", device);

        let acquired = tokio::select! {
            result = self.sessions.acquire(profile) => result,
            _ = cancelled(&mut stop) => return,
        };
        let mut session = match acquired {
            Ok(session) => session,
            Err(e) => {
                tracing::error!("[{}] device setup failed: {}", device, e);
                for screen in screens {
                    let _ = self
                        .tracker
                        .mark_failed(screen.id(), device, format!("device setup failed: {e}"));
                }
                return;
            }
        };

        for index in batch_order(screens) {
            if *stop.borrow() {
                break;
            }
            self.capture_screen(&mut session, &screens[index], &mut stop).await;
        }

        self.metrics.record_session(
            u64::from(session.launches()),
            session.input_events(),
            session.tree_fetches(),
        );
        if *stop.borrow() {
            self.sessions
                .release_within(session, self.settings.cancel_grace())
                .await;
        } else {
            self.sessions.release(session).await;
        }
        tracing::info!("[{}] pipeline finished", device);
    }

    /// Attempt loop for one screen. Always leaves the pair in a terminal state.
    async fn capture_screen(
        &self,
        session: &mut Session,
        screen: &Screen,
        stop: &mut watch::Receiver<bool>,
    ) {
        let device = session.profile().name.clone();
        let id = screen.id();
        let started = Instant::now();
        let launches_before = session.launches();
        let max_attempts = self.settings.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if let Err(e) = self.tracker.begin_attempt(id, &device) {
                tracing::error!("{}", e);
                return;
            }
            tracing::info!("[{}] {} attempt {}/{}", device, id, attempt, max_attempts);

            let outcome = tokio::select! {
                result = self.attempt(session, screen) => result,
                _ = cancelled(stop) => Err(AttemptFailure::Cancelled),
            };
            self.tracker
                .set_launches(id, &device, session.launches() - launches_before);

            let failure = match outcome {
                Ok(path) => {
                    tracing::info!("[{}] {} captured -> {}", device, id, path);
                    self.metrics.record_capture_time(started.elapsed());
                    let _ = self.tracker.mark_captured(id, &device, path);
                    return;
                }
                Err(failure) => failure,
            };

            let reason = failure.to_string();
            if failure.is_unreachable() {
                tracing::error!("[{}] {} unreachable: {}", device, id, reason);
                let _ = self.tracker.mark_unreachable(id, &device, reason);
                return;
            }
            if failure.is_retryable() && attempt < max_attempts {
                tracing::warn!(
                    "[{}] {} attempt {} failed: {}; retrying",
                    device,
                    id,
                    attempt,
                    reason
                );
                continue;
            }
            tracing::error!("[{}] {} failed: {}", device, id, reason);
            let _ = self.tracker.mark_failed(id, &device, reason);
            return;
        }
    }

    /// One full attempt: fresh launch, every step in order, settle, screenshot.
    async fn attempt(
        &self,
        session: &mut Session,
        screen: &Screen,
    ) -> Result<camino::Utf8PathBuf, AttemptFailure> {
        self.sessions
            .launch(session, screen.seed())
            .await
            .map_err(|e| AttemptFailure::Launch(NavigationError::from_driver(e, "launch")))?;

        for (i, step) in screen.steps().iter().enumerate() {
            self.executor
                .apply(session, step)
                .await
                .map_err(|error| AttemptFailure::Step {
                    index: i + 1,
                    kind: step.kind(),
                    error,
                })?;
        }

        tokio::time::sleep(screen.settle()).await;

        let path = self.layout.capture_path(&session.profile().name, screen.capture_name());
        self.layout
            .prepare(&path)
            .map_err(|e| AttemptFailure::Output(format!("{e:#}")))?;
        session
            .screenshot(&path)
            .await
            .map_err(|e| {
                AttemptFailure::Screenshot(NavigationError::from_driver(e, "screenshot"))
            })?;
        Ok(path)
    }
}
