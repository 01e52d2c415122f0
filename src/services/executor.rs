//! Applies one navigation step to a live session and verifies its effect.
//!
//! Every step works on a freshly fetched tree. Mutating steps send exactly one input event;
//! verification only re-reads the tree, it never repeats the input.

use crate::models::{
    AccessibilityNode, AlertPolicy, NavigationStep, Point, Rect, Role, RunSettings, StepKind,
    SwipeDirection,
};
use crate::services::driver::DriverError;
use crate::services::locator::{self, LocatorError, format_candidates};
use crate::services::session::Session;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Why a step (and with it the screen attempt) failed.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum NavigationError {
    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("AmbiguousMatch: {0}")]
    AmbiguousMatch(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("DeviceCrash: {0}")]
    DeviceCrash(String),

    #[error("cancelled")]
    Cancelled,
}

impl NavigationError {
    /// The target cannot be reached on this device; retrying will not help.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, NavigationError::NotFound(_) | NavigationError::AmbiguousMatch(_))
    }

    /// Worth another attempt from a fresh launch.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NavigationError::Timeout(_) | NavigationError::DeviceCrash(_))
    }

    pub fn from_driver(err: DriverError, action: &str) -> Self {
        match err {
            DriverError::Timeout(limit) => {
                NavigationError::Timeout(format!("{action} after {limit:?}"))
            }
            DriverError::AppNotRunning => {
                NavigationError::DeviceCrash("app is not running".to_string())
            }
            other => NavigationError::DeviceCrash(format!("{action}: {other}")),
        }
    }
}

impl From<LocatorError> for NavigationError {
    fn from(err: LocatorError) -> Self {
        match err {
            LocatorError::NotFound { kind, target } => {
                NavigationError::NotFound(format!("no element for {kind} \"{target}\""))
            }
            LocatorError::AmbiguousMatch {
                kind,
                target,
                candidates,
            } => NavigationError::AmbiguousMatch(format!(
                "{kind} \"{target}\" matched {} elements: {}",
                candidates.len(),
                format_candidates(&candidates)
            )),
        }
    }
}

/// Post-condition of a mutating step.
enum Check {
    /// Tree must differ from the pre-input snapshot.
    Changed(u64),
    /// The switch must report the opposite value.
    Flipped { target: String, was_on: bool },
    /// Tree changed, or the tab now reports selected.
    TabSelected { target: String, before: u64 },
    None,
}

#[derive(Debug, Clone)]
pub struct ActionExecutor {
    settings: Arc<RunSettings>,
}

impl ActionExecutor {
    pub fn new(settings: Arc<RunSettings>) -> Self {
        Self { settings }
    }

    /// Apply `step` to `session`.
    ///
    /// # Returns
    /// `Ok(())` once the step's post-condition holds. Errors say whether the screen is
    /// unreachable (`NotFound`/`AmbiguousMatch`) or the attempt may be retried
    /// (`Timeout`/`DeviceCrash`).
    pub async fn apply(
        &self,
        session: &mut Session,
        step: &NavigationStep,
    ) -> Result<(), NavigationError> {
        tracing::debug!("[{}] {}", session.profile().name, step);
        match step {
            NavigationStep::Tap { kind, target, expect } => {
                self.tap(session, *kind, target, expect.as_deref()).await
            }
            NavigationStep::Back { target, expect } => {
                self.back(session, target.as_deref(), expect.as_deref()).await
            }
            NavigationStep::Swipe { direction } => {
                let tree = fetch(session).await?;
                let (from, to) = swipe_points(&tree.frame, *direction);
                session
                    .swipe(from, to)
                    .await
                    .map_err(|e| NavigationError::from_driver(e, "swipe"))?;
                fetch(session).await.map(|_| ())
            }
            NavigationStep::ScrollTo { target } => self.scroll_to(session, target).await,
            NavigationStep::TypeText { field, text } => self.type_text(session, field, text).await,
            NavigationStep::Wait { duration } => {
                tokio::time::sleep(*duration).await;
                Ok(())
            }
            NavigationStep::Alert { kind, policy } => self.alert(session, *kind, *policy).await,
        }
    }

    async fn tap(
        &self,
        session: &mut Session,
        kind: StepKind,
        target: &str,
        expect: Option<&str>,
    ) -> Result<(), NavigationError> {
        let tree = fetch(session).await?;
        let node = locator::resolve(&tree, kind, target)?;
        let point = node.frame.center();
        let before = tree.fingerprint();

        let check = match kind {
            StepKind::TapSwitch => Check::Flipped {
                target: target.to_string(),
                was_on: node.is_selected(),
            },
            StepKind::TapTab => Check::TabSelected {
                target: target.to_string(),
                before,
            },
            StepKind::TapNav => Check::Changed(before),
            _ => Check::None,
        };

        session
            .tap(point)
            .await
            .map_err(|e| NavigationError::from_driver(e, "tap"))?;
        self.verify(session, &check, expect, &format!("{kind} \"{target}\"")).await
    }

    async fn back(
        &self,
        session: &mut Session,
        target: Option<&str>,
        expect: Option<&str>,
    ) -> Result<(), NavigationError> {
        let tree = fetch(session).await?;
        let node = match target {
            Some(label) => locator::resolve(&tree, StepKind::Back, label)?,
            None => locator::first_nav_button(&tree).ok_or_else(|| {
                NavigationError::NotFound("no back button in navigation bar".to_string())
            })?,
        };
        let point = node.frame.center();
        let check = Check::Changed(tree.fingerprint());

        session
            .tap(point)
            .await
            .map_err(|e| NavigationError::from_driver(e, "tap"))?;
        self.verify(session, &check, expect, "back").await
    }

    /// Re-poll the tree until `check` and the optional marker hold.
    async fn verify(
        &self,
        session: &mut Session,
        check: &Check,
        expect: Option<&str>,
        what: &str,
    ) -> Result<(), NavigationError> {
        for poll in 0..=self.settings.verify_retries {
            if poll > 0 {
                tokio::time::sleep(self.settings.verify_interval()).await;
            }
            let tree = fetch(session).await?;
            let marker_shown = expect.is_none_or(|marker| locator::is_present(&tree, marker));
            if satisfied(&tree, check) && marker_shown {
                return Ok(());
            }
        }

        let reason = match expect {
            Some(marker) => format!("\"{marker}\" did not appear after {what}"),
            None => format!("no visible effect after {what}"),
        };
        Err(NavigationError::Timeout(reason))
    }

    async fn type_text(
        &self,
        session: &mut Session,
        field: &str,
        text: &str,
    ) -> Result<(), NavigationError> {
        let tree = fetch(session).await?;
        let node = locator::resolve(&tree, StepKind::TypeText, field)?;
        if !node.focused {
            return Err(NavigationError::NotFound(format!("text field \"{field}\" is not focused")));
        }
        session
            .type_text(text)
            .await
            .map_err(|e| NavigationError::from_driver(e, "type_text"))?;
        fetch(session).await.map(|_| ())
    }

    async fn scroll_to(&self, session: &mut Session, target: &str) -> Result<(), NavigationError> {
        let attempts = self.settings.scroll_attempts;
        for attempt in 0..=attempts {
            let tree = fetch(session).await?;
            match locator::resolve(&tree, StepKind::ScrollTo, target) {
                Ok(node) if tree.frame.is_empty() || node.frame.is_hittable_within(&tree.frame) => {
                    return Ok(());
                }
                Ok(_) | Err(LocatorError::NotFound { .. }) => {}
                Err(ambiguous) => return Err(ambiguous.into()),
            }
            if attempt == attempts {
                break;
            }
            let (from, to) = swipe_points(&tree.frame, SwipeDirection::Up);
            session
                .swipe(from, to)
                .await
                .map_err(|e| NavigationError::from_driver(e, "scroll"))?;
        }
        Err(NavigationError::NotFound(format!(
            "\"{target}\" not on screen after {attempts} scrolls"
        )))
    }

    async fn alert(
        &self,
        session: &mut Session,
        kind: StepKind,
        policy: AlertPolicy,
    ) -> Result<(), NavigationError> {
        let deadline = Instant::now() + self.settings.alert_timeout();
        loop {
            let tree = fetch(session).await?;
            if let Some(alert) = tree.find_role(Role::Alert) {
                let buttons: Vec<&AccessibilityNode> = alert
                    .walk()
                    .into_iter()
                    .map(|r| r.node)
                    .filter(|n| n.role == Role::Button)
                    .collect();
                let choice = if kind == StepKind::AlertAccept {
                    buttons.last()
                } else {
                    buttons.first()
                };
                let button = choice.ok_or_else(|| {
                    NavigationError::NotFound(format!("alert \"{}\" has no buttons", alert.label))
                })?;
                tracing::debug!("[{}] {} \"{}\"", session.profile().name, kind, button.label);

                let point = button.frame.center();
                let before = alert.fingerprint();
                session
                    .tap(point)
                    .await
                    .map_err(|e| NavigationError::from_driver(e, "tap"))?;
                return self.verify_alert_gone(session, before).await;
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let pause = self.settings.verify_interval().min(deadline - now);
            tokio::time::sleep(pause.max(Duration::from_millis(1))).await;
        }

        match policy {
            AlertPolicy::Optional => {
                tracing::debug!("[{}] no alert for optional {}", session.profile().name, kind);
                Ok(())
            }
            AlertPolicy::Required => Err(NavigationError::NotFound(format!(
                "no alert appeared within {:?}",
                self.settings.alert_timeout()
            ))),
        }
    }

    async fn verify_alert_gone(
        &self,
        session: &mut Session,
        alert_fingerprint: u64,
    ) -> Result<(), NavigationError> {
        for poll in 0..=self.settings.verify_retries {
            if poll > 0 {
                tokio::time::sleep(self.settings.verify_interval()).await;
            }
            let tree = fetch(session).await?;
            let same_alert = tree
                .find_role(Role::Alert)
                .is_some_and(|a| a.fingerprint() == alert_fingerprint);
            if !same_alert {
                return Ok(());
            }
        }
        Err(NavigationError::Timeout("alert still showing after tap".to_string()))
    }
}

async fn fetch(session: &mut Session) -> Result<AccessibilityNode, NavigationError> {
    session
        .fetch_tree()
        .await
        .map_err(|e| NavigationError::from_driver(e, "tree fetch"))
}

fn satisfied(tree: &AccessibilityNode, check: &Check) -> bool {
    match check {
        Check::None => true,
        Check::Changed(before) => tree.fingerprint() != *before,
        Check::Flipped { target, was_on } => locator::resolve(tree, StepKind::TapSwitch, target)
            .map(|n| n.is_selected() != *was_on)
            .unwrap_or(false),
        Check::TabSelected { target, before } => {
            tree.fingerprint() != *before
                || locator::resolve(tree, StepKind::TapTab, target).is_ok_and(|n| n.is_selected())
        }
    }
}

/// Start and end of a swipe across the middle of `bounds`. `Up` moves content up.
fn swipe_points(bounds: &Rect, direction: SwipeDirection) -> (Point, Point) {
    let c = bounds.center();
    let (near_x, far_x) = (bounds.x + bounds.width * 0.2, bounds.x + bounds.width * 0.8);
    let (near_y, far_y) = (bounds.y + bounds.height * 0.25, bounds.y + bounds.height * 0.75);
    match direction {
        SwipeDirection::Up => (Point::new(c.x, far_y), Point::new(c.x, near_y)),
        SwipeDirection::Down => (Point::new(c.x, near_y), Point::new(c.x, far_y)),
        SwipeDirection::Left => (Point::new(far_x, c.y), Point::new(near_x, c.y)),
        SwipeDirection::Right => (Point::new(near_x, c.y), Point::new(far_x, c.y)),
    }
}
