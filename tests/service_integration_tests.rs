//! Integration tests for the session controller and action executor
//!
//! These tests verify:
//! - Verification of switches, alerts and expected markers
//! - Text entry only into a focused field
//! - Scrolling a target into view
//! - Crash detection on a live session
//! - Exactly one input event per mutating step

mod common;

use appshots::models::{
    AccessibilityNode, AlertPolicy, LaunchSeed, NavigationStep, Rect, Role, StepKind,
    SwipeDirection,
};
use appshots::services::{
    ActionExecutor, NavigationError, Session, SessionController, SessionState,
};
use common::*;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    connector: FakeConnector,
    controller: SessionController,
    executor: ActionExecutor,
    session: Session,
}

async fn launched(script: AppScript) -> Harness {
    let settings = Arc::new(fast_settings());
    let connector = FakeConnector::new(script);
    let controller = SessionController::new(Arc::new(connector.clone()), settings.clone());
    let mut session = controller.acquire(&device("iPhone")).await.unwrap();
    controller
        .launch(&mut session, &LaunchSeed::default())
        .await
        .unwrap();
    Harness {
        connector,
        controller,
        executor: ActionExecutor::new(settings),
        session,
    }
}

impl Harness {
    async fn apply(&mut self, step: NavigationStep) -> Result<(), NavigationError> {
        self.executor.apply(&mut self.session, &step).await
    }
}

fn node(role: Role, label: &str, frame: Rect) -> AccessibilityNode {
    AccessibilityNode::new(role, label, frame)
}

fn alert_tree() -> AccessibilityNode {
    screen_with(vec![
        text("Dashboard", 100.0),
        node(Role::Alert, "Allow notifications?", Rect::new(45.0, 300.0, 300.0, 200.0))
            .with_children(vec![
                node(Role::Button, "Don't Allow", Rect::new(45.0, 450.0, 150.0, 50.0)),
                node(Role::Button, "Allow", Rect::new(195.0, 450.0, 150.0, 50.0)),
            ]),
    ])
}

fn alert_app() -> AppScript {
    AppScript::new("alert")
        .state("alert", alert_tree())
        .state("home", home_tree())
        .on_tap("alert", "Allow", "home")
        .on_tap("alert", "Don't Allow", "home")
}

#[tokio::test]
async fn test_switch_flip_is_verified() {
    let mut h = launched(demo_app()).await;
    h.apply(NavigationStep::tap(StepKind::TapTab, "Settings")).await.unwrap();
    h.apply(NavigationStep::tap(StepKind::TapSwitch, "Notifications")).await.unwrap();

    let tree = h.session.fetch_tree().await.unwrap();
    let switch = tree.find_role(Role::SwitchControl).unwrap();
    assert!(switch.is_selected());
    assert_eq!(h.session.input_events(), 2);
    assert_eq!(h.connector.count("iPhone", "tap"), 2);
}

#[tokio::test]
async fn test_expected_marker_missing_times_out() {
    let mut h = launched(demo_app()).await;
    let step = NavigationStep::Tap {
        kind: StepKind::TapTab,
        target: "Settings".to_string(),
        expect: Some("Privacy Policy".to_string()),
    };
    let err = h.apply(step).await.unwrap_err();

    assert!(matches!(err, NavigationError::Timeout(ref msg) if msg.contains("Privacy Policy")));
    assert!(err.is_retryable());
    // Verification re-reads the tree, it never taps again.
    assert_eq!(h.connector.count("iPhone", "tap"), 1);
}

#[tokio::test]
async fn test_type_text_into_focused_field() {
    let mut h = launched(demo_app()).await;
    h.apply(NavigationStep::tap(StepKind::TapTab, "Settings")).await.unwrap();
    h.apply(NavigationStep::tap(StepKind::TapCell, "Account")).await.unwrap();
    h.apply(NavigationStep::TypeText {
        field: "Display name".to_string(),
        text: "Ada".to_string(),
    })
    .await
    .unwrap();

    let tree = h.session.fetch_tree().await.unwrap();
    assert_eq!(tree.find_role(Role::TextField).unwrap().value.as_deref(), Some("Ada"));
    assert_eq!(h.connector.count("iPhone", "type"), 1);
}

#[tokio::test]
async fn test_type_text_without_focus_is_not_found() {
    let tree = screen_with(vec![AccessibilityNode::new(
        Role::TextField,
        "Search",
        Rect::new(20.0, 100.0, 350.0, 40.0),
    )]);
    let mut h = launched(AppScript::new("search").state("search", tree)).await;

    let err = h
        .apply(NavigationStep::TypeText {
            field: "Search".to_string(),
            text: "coffee".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NavigationError::NotFound(_)));
    assert!(err.is_unreachable());
    assert_eq!(h.connector.count("iPhone", "type"), 0);
}

#[tokio::test]
async fn test_alert_accept_taps_default_action() {
    let mut h = launched(alert_app()).await;
    h.apply(NavigationStep::Alert {
        kind: StepKind::AlertAccept,
        policy: AlertPolicy::Required,
    })
    .await
    .unwrap();

    assert_eq!(h.connector.device_log("iPhone").last().map(String::as_str), Some("tap \"Allow\""));
    let tree = h.session.fetch_tree().await.unwrap();
    assert!(tree.find_role(Role::Alert).is_none());
}

#[tokio::test]
async fn test_alert_dismiss_taps_cancel_action() {
    let mut h = launched(alert_app()).await;
    h.apply(NavigationStep::Alert {
        kind: StepKind::AlertDismiss,
        policy: AlertPolicy::Required,
    })
    .await
    .unwrap();

    assert!(h.connector.device_log("iPhone").contains(&"tap \"Don't Allow\"".to_string()));
}

#[tokio::test]
async fn test_missing_alert_depends_on_policy() {
    let mut h = launched(demo_app()).await;

    h.apply(NavigationStep::Alert {
        kind: StepKind::AlertAccept,
        policy: AlertPolicy::Optional,
    })
    .await
    .unwrap();

    let err = h
        .apply(NavigationStep::Alert {
            kind: StepKind::AlertAccept,
            policy: AlertPolicy::Required,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, NavigationError::NotFound(_)));
    assert_eq!(h.connector.count("iPhone", "tap"), 0);
}

#[tokio::test]
async fn test_scroll_to_brings_target_into_view() {
    let below = screen_with(vec![text("General", 100.0), text("Privacy", 1200.0)]);
    let scrolled = screen_with(vec![text("General", -300.0), text("Privacy", 400.0)]);
    let script = AppScript::new("top")
        .state("top", below)
        .state("scrolled", scrolled)
        .on_swipe("top", "scrolled");
    let mut h = launched(script).await;

    h.apply(NavigationStep::ScrollTo {
        target: "Privacy".to_string(),
    })
    .await
    .unwrap();

    assert_eq!(h.connector.count("iPhone", "swipe"), 1);
    assert_eq!(h.connector.count("iPhone", "tap"), 0);
}

#[tokio::test]
async fn test_scroll_to_gives_up() {
    let mut h = launched(demo_app()).await;
    let err = h
        .apply(NavigationStep::ScrollTo {
            target: "Privacy".to_string(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, NavigationError::NotFound(_)));
    // scroll_attempts swipes, then give up.
    assert_eq!(h.connector.count("iPhone", "swipe"), 2);
}

#[tokio::test]
async fn test_swipe_and_wait() {
    let mut h = launched(demo_app()).await;
    let fetches = h.session.tree_fetches();

    h.apply(NavigationStep::Wait {
        duration: Duration::from_millis(5),
    })
    .await
    .unwrap();
    assert_eq!(h.session.tree_fetches(), fetches);

    h.apply(NavigationStep::Swipe {
        direction: SwipeDirection::Left,
    })
    .await
    .unwrap();
    assert_eq!(h.connector.count("iPhone", "swipe"), 1);
    assert_eq!(h.session.input_events(), 1);
}

#[tokio::test]
async fn test_back_returns_to_previous_screen() {
    let mut h = launched(demo_app()).await;
    h.apply(NavigationStep::tap(StepKind::TapTab, "Settings")).await.unwrap();
    h.apply(NavigationStep::tap(StepKind::TapCell, "Account")).await.unwrap();
    h.apply(NavigationStep::Back {
        target: None,
        expect: Some("Notifications".to_string()),
    })
    .await
    .unwrap();

    let tree = h.session.fetch_tree().await.unwrap();
    assert!(tree.find_role(Role::SwitchControl).is_some());
}

#[tokio::test]
async fn test_crash_is_detected_and_relaunch_recovers() {
    let mut h = launched(demo_app().crash_on_launch(1)).await;

    let err = h
        .apply(NavigationStep::tap(StepKind::TapTab, "Settings"))
        .await
        .unwrap_err();
    assert!(matches!(err, NavigationError::DeviceCrash(_)));
    assert_eq!(h.session.state(), SessionState::Crashed);

    h.controller
        .launch(&mut h.session, &LaunchSeed::default())
        .await
        .unwrap();
    assert_eq!(h.session.state(), SessionState::Ready);
    assert_eq!(h.session.launches(), 2);
    h.apply(NavigationStep::tap(StepKind::TapTab, "Settings")).await.unwrap();

    h.controller.release(h.session).await;
    assert_eq!(h.connector.count("iPhone", "shutdown"), 1);
}
