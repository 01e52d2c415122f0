//! Device sessions: one exclusively-owned driver plus the launched app's lifecycle.
//!
//! Lifecycle: `Idle -> Launching -> Ready -> (Terminated | Crashed)`. A terminated or
//! crashed session goes back to `Idle` before it is launched again. A device pipeline owns
//! its only [`Session`] value, so two pipelines can never drive the same device.

use crate::models::{AccessibilityNode, DeviceProfile, LaunchSeed, Point, RunSettings};
use crate::services::driver::{DeviceConnector, DeviceDriver, DriverError};
use camino::Utf8Path;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Launching,
    Ready,
    Terminated,
    Crashed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Launching => "launching",
            SessionState::Ready => "ready",
            SessionState::Terminated => "terminated",
            SessionState::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

/// Run a driver call with an upper bound.
async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, DriverError>>,
) -> Result<T, DriverError> {
    match timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(DriverError::Timeout(limit)),
    }
}

pub struct Session {
    profile: DeviceProfile,
    driver: Box<dyn DeviceDriver>,
    state: SessionState,
    pid: Option<u32>,
    step_timeout: Duration,
    command_timeout: Duration,
    launches: u32,
    input_events: u64,
    tree_fetches: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("device", &self.profile.name)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("launches", &self.launches)
            .finish()
    }
}

impl Session {
    pub fn new(
        profile: DeviceProfile,
        driver: Box<dyn DeviceDriver>,
        settings: &RunSettings,
    ) -> Self {
        Self {
            profile,
            driver,
            state: SessionState::Idle,
            pid: None,
            step_timeout: settings.step_timeout(),
            command_timeout: settings.command_timeout(),
            launches: 0,
            input_events: 0,
            tree_fetches: 0,
        }
    }

    pub fn profile(&self) -> &DeviceProfile {
        &self.profile
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Total launches over the session's life.
    pub fn launches(&self) -> u32 {
        self.launches
    }

    pub fn input_events(&self) -> u64 {
        self.input_events
    }

    pub fn tree_fetches(&self) -> u64 {
        self.tree_fetches
    }

    fn record_failure(&mut self, err: &DriverError) {
        if matches!(err, DriverError::AppNotRunning) {
            tracing::warn!("[{}] app is no longer running", self.profile.name);
            self.state = SessionState::Crashed;
            self.pid = None;
        }
    }

    fn ensure_ready(&self) -> Result<(), DriverError> {
        if self.state == SessionState::Ready {
            Ok(())
        } else {
            Err(DriverError::AppNotRunning)
        }
    }

    fn observe<T>(&mut self, result: Result<T, DriverError>) -> Result<T, DriverError> {
        if let Err(err) = &result {
            self.record_failure(err);
        }
        result
    }

    /// Fresh accessibility snapshot, bounded by the step timeout.
    pub async fn fetch_tree(&mut self) -> Result<AccessibilityNode, DriverError> {
        self.ensure_ready()?;
        self.tree_fetches += 1;
        let result = bounded(self.step_timeout, self.driver.fetch_tree()).await;
        self.observe(result)
    }

    pub async fn tap(&mut self, at: Point) -> Result<(), DriverError> {
        self.ensure_ready()?;
        self.note_input();
        let result = bounded(self.step_timeout, self.driver.tap(at)).await;
        self.observe(result)
    }

    pub async fn swipe(&mut self, from: Point, to: Point) -> Result<(), DriverError> {
        self.ensure_ready()?;
        self.note_input();
        let result = bounded(self.step_timeout, self.driver.swipe(from, to)).await;
        self.observe(result)
    }

    pub async fn type_text(&mut self, text: &str) -> Result<(), DriverError> {
        self.ensure_ready()?;
        self.note_input();
        let result = bounded(self.step_timeout, self.driver.type_text(text)).await;
        self.observe(result)
    }

    pub async fn screenshot(&mut self, path: &Utf8Path) -> Result<(), DriverError> {
        self.ensure_ready()?;
        let result = bounded(self.command_timeout, self.driver.screenshot(path)).await;
        self.observe(result)
    }

    fn note_input(&mut self) {
        self.input_events += 1;
    }
}

/// Acquires, launches and releases sessions.
#[derive(Clone)]
pub struct SessionController {
    connector: Arc<dyn DeviceConnector>,
    settings: Arc<RunSettings>,
}

impl SessionController {
    pub fn new(connector: Arc<dyn DeviceConnector>, settings: Arc<RunSettings>) -> Self {
        Self { connector, settings }
    }

    /// Connect to the device for `profile` and get it ready (booted, app installed).
    pub async fn acquire(&self, profile: &DeviceProfile) -> Result<Session, DriverError> {
        let limit = self.settings.command_timeout();
        let mut driver = bounded(limit, self.connector.connect(profile)).await?;
        bounded(limit, driver.prepare()).await?;
        tracing::info!("[{}] session acquired", profile.name);
        Ok(Session::new(profile.clone(), driver, &self.settings))
    }

    /// (Re)launch the app with the given seed.
    ///
    /// Any running instance is terminated first. Defaults are always cleared and rewritten
    /// and fixture files copied, since the app may have changed its own state while running.
    pub async fn launch(
        &self,
        session: &mut Session,
        seed: &LaunchSeed,
    ) -> Result<(), DriverError> {
        match session.state {
            SessionState::Ready | SessionState::Launching => {
                session.state = SessionState::Terminated
            }
            SessionState::Idle | SessionState::Terminated | SessionState::Crashed => {}
        }
        if matches!(session.state, SessionState::Terminated | SessionState::Crashed) {
            session.state = SessionState::Idle;
        }
        session.state = SessionState::Launching;
        session.pid = None;

        let result = self.launch_inner(session, seed).await;
        match &result {
            Ok(pid) => {
                session.state = SessionState::Ready;
                session.pid = Some(*pid);
                tracing::info!("[{}] app launched (pid {})", session.profile.name, pid);
            }
            Err(err) => {
                tracing::warn!("[{}] launch failed: {}", session.profile.name, err);
                session.state = SessionState::Crashed;
            }
        }
        result.map(|_| ())
    }

    async fn launch_inner(
        &self,
        session: &mut Session,
        seed: &LaunchSeed,
    ) -> Result<u32, DriverError> {
        let limit = self.settings.command_timeout();
        let driver = session.driver.as_mut();

        if let Err(err) = bounded(limit, driver.terminate_app()).await {
            tracing::debug!("[{}] terminate before launch: {}", session.profile.name, err);
        }

        bounded(limit, driver.reset_defaults()).await?;
        for (name, value) in &seed.defaults {
            bounded(limit, driver.write_default(name, value)).await?;
        }
        if !seed.files.is_empty() {
            bounded(limit, driver.install_files(&seed.files)).await?;
        }

        session.launches += 1;
        let pid = bounded(limit, driver.launch_app(&seed.launch_args, &seed.env)).await?;
        tokio::time::sleep(self.settings.launch_settle()).await;
        Ok(pid)
    }

    /// Stop the app and release the device.
    pub async fn release(&self, session: Session) {
        self.release_within(session, self.settings.command_timeout()).await;
    }

    /// [`release`](Self::release) with every device call bounded by `limit`.
    pub async fn release_within(&self, mut session: Session, limit: Duration) {
        if let Err(err) = bounded(limit, session.driver.terminate_app()).await {
            tracing::debug!("[{}] terminate on release: {}", session.profile.name, err);
        }
        if let Err(err) = bounded(limit, session.driver.shutdown()).await {
            tracing::warn!("[{}] shutdown failed: {}", session.profile.name, err);
        }
        session.state = SessionState::Terminated;
        tracing::info!("[{}] session released", session.profile.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DefaultValue, FileFixture};
    use crate::services::driver::MockDeviceDriver;
    use mockall::predicate::eq;
    use std::sync::Mutex;

    fn settings() -> RunSettings {
        RunSettings {
            launch_settle_ms: 0,
            ..RunSettings::default()
        }
    }

    fn profile() -> DeviceProfile {
        DeviceProfile::new("iPhone", "iPhone-16", "iOS")
    }

    fn seeded() -> LaunchSeed {
        let mut seed = LaunchSeed::default();
        seed.defaults.insert("hasOnboarded".to_string(), DefaultValue::Bool(true));
        seed
    }

    fn controller() -> SessionController {
        struct NoConnector;
        #[async_trait::async_trait]
        impl DeviceConnector for NoConnector {
            async fn connect(
                &self,
                _: &DeviceProfile,
            ) -> Result<Box<dyn DeviceDriver>, DriverError> {
                Err(DriverError::CommandFailed("unused".to_string()))
            }
        }
        SessionController::new(Arc::new(NoConnector), Arc::new(settings()))
    }

    #[tokio::test]
    async fn test_launch_seeds_then_starts() {
        let mut driver = MockDeviceDriver::new();
        let mut seq = mockall::Sequence::new();
        driver.expect_terminate_app().times(1).in_sequence(&mut seq).returning(|| Ok(()));
        driver.expect_reset_defaults().times(1).in_sequence(&mut seq).returning(|| Ok(()));
        driver
            .expect_write_default()
            .with(eq("hasOnboarded"), eq(DefaultValue::Bool(true)))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        driver.expect_launch_app().times(1).in_sequence(&mut seq).returning(|_, _| Ok(4242));

        let mut session = Session::new(profile(), Box::new(driver), &settings());
        controller().launch(&mut session, &seeded()).await.unwrap();

        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.pid(), Some(4242));
        assert_eq!(session.launches(), 1);
    }

    #[tokio::test]
    async fn test_every_launch_reseeds() {
        let mut driver = MockDeviceDriver::new();
        driver.expect_terminate_app().times(2).returning(|| Ok(()));
        driver.expect_reset_defaults().times(2).returning(|| Ok(()));
        driver.expect_write_default().times(2).returning(|_, _| Ok(()));
        driver.expect_install_files().never();
        driver.expect_launch_app().times(2).returning(|_, _| Ok(1));

        let controller = controller();
        let mut session = Session::new(profile(), Box::new(driver), &settings());
        controller.launch(&mut session, &seeded()).await.unwrap();
        controller.launch(&mut session, &seeded()).await.unwrap();
        assert_eq!(session.launches(), 2);
    }

    #[tokio::test]
    async fn test_files_and_args_applied_before_start() {
        let mut seed = seeded();
        seed.launch_args = vec!["-UITestMode".to_string()];
        seed.files = vec![FileFixture::new("fixtures/feed.json", Some("Documents/feed.json"))];

        let calls = Arc::new(Mutex::new(Vec::new()));
        let mut driver = MockDeviceDriver::new();
        driver.expect_terminate_app().returning(|| Ok(()));
        driver.expect_reset_defaults().returning(|| Ok(()));
        driver.expect_write_default().returning(|_, _| Ok(()));
        let log = calls.clone();
        driver.expect_install_files().times(1).returning(move |files| {
            log.lock().unwrap().push(format!("files {}", files[0].destination()));
            Ok(())
        });
        let log = calls.clone();
        driver.expect_launch_app().times(1).returning(move |args, _| {
            log.lock().unwrap().push(format!("launch {}", args.join(" ")));
            Ok(9)
        });

        let mut session = Session::new(profile(), Box::new(driver), &settings());
        controller().launch(&mut session, &seed).await.unwrap();
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["files Documents/feed.json", "launch -UITestMode"]
        );
    }

    #[tokio::test]
    async fn test_fixture_copy_failure_fails_launch() {
        let mut seed = LaunchSeed::default();
        seed.files = vec![FileFixture::new("missing.json", None)];

        let mut driver = MockDeviceDriver::new();
        driver.expect_terminate_app().returning(|| Ok(()));
        driver.expect_reset_defaults().returning(|| Ok(()));
        driver
            .expect_install_files()
            .returning(|_| Err(DriverError::CommandFailed("copy missing.json".to_string())));
        driver.expect_launch_app().never();

        let mut session = Session::new(profile(), Box::new(driver), &settings());
        assert!(controller().launch(&mut session, &seed).await.is_err());
        assert_eq!(session.state(), SessionState::Crashed);
        assert_eq!(session.launches(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_marks_crashed() {
        let mut driver = MockDeviceDriver::new();
        driver.expect_terminate_app().returning(|| Ok(()));
        driver.expect_reset_defaults().returning(|| Ok(()));
        driver.expect_write_default().returning(|_, _| Ok(()));
        driver
            .expect_launch_app()
            .returning(|_, _| Err(DriverError::CommandFailed("launch refused".to_string())));

        let mut session = Session::new(profile(), Box::new(driver), &settings());
        let result = controller().launch(&mut session, &seeded()).await;

        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Crashed);
        assert_eq!(session.launches(), 1);
    }

    #[tokio::test]
    async fn test_app_not_running_marks_crashed() {
        let mut driver = MockDeviceDriver::new();
        driver.expect_terminate_app().returning(|| Ok(()));
        driver.expect_reset_defaults().returning(|| Ok(()));
        driver.expect_launch_app().returning(|_, _| Ok(7));
        driver.expect_fetch_tree().returning(|| Err(DriverError::AppNotRunning));

        let mut session = Session::new(profile(), Box::new(driver), &settings());
        controller().launch(&mut session, &LaunchSeed::default()).await.unwrap();

        let err = session.fetch_tree().await.unwrap_err();
        assert!(matches!(err, DriverError::AppNotRunning));
        assert_eq!(session.state(), SessionState::Crashed);
        assert_eq!(session.pid(), None);
    }

    #[tokio::test]
    async fn test_calls_rejected_before_launch() {
        let driver = MockDeviceDriver::new();
        let mut session = Session::new(profile(), Box::new(driver), &settings());
        assert!(matches!(session.fetch_tree().await, Err(DriverError::AppNotRunning)));
        assert_eq!(session.state(), SessionState::Idle);
    }
}
