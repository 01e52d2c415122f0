//! Navigation steps: the closed step vocabulary and its validation.
//!
//! Planner output arrives as untyped YAML records ([`RawStep`]). They are converted into
//! [`NavigationStep`] once, when the plan is loaded, so an unknown kind or a missing field
//! is a [`PlanError`] before any device is touched.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_yaml_ng::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Closed vocabulary of step kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Tap,
    TapTab,
    TapText,
    TapCell,
    TapNav,
    TapSwitch,
    TapId,
    Swipe,
    ScrollTo,
    TypeText,
    Wait,
    AlertAccept,
    AlertDismiss,
    Back,
}

impl StepKind {
    pub const ALL: [StepKind; 14] = [
        StepKind::Tap,
        StepKind::TapTab,
        StepKind::TapText,
        StepKind::TapCell,
        StepKind::TapNav,
        StepKind::TapSwitch,
        StepKind::TapId,
        StepKind::Swipe,
        StepKind::ScrollTo,
        StepKind::TypeText,
        StepKind::Wait,
        StepKind::AlertAccept,
        StepKind::AlertDismiss,
        StepKind::Back,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::Tap => "tap",
            StepKind::TapTab => "tap_tab",
            StepKind::TapText => "tap_text",
            StepKind::TapCell => "tap_cell",
            StepKind::TapNav => "tap_nav",
            StepKind::TapSwitch => "tap_switch",
            StepKind::TapId => "tap_id",
            StepKind::Swipe => "swipe",
            StepKind::ScrollTo => "scroll_to",
            StepKind::TypeText => "type_text",
            StepKind::Wait => "wait",
            StepKind::AlertAccept => "alert_accept",
            StepKind::AlertDismiss => "alert_dismiss",
            StepKind::Back => "back",
        }
    }

    pub fn is_tap(&self) -> bool {
        matches!(
            self,
            StepKind::Tap
                | StepKind::TapTab
                | StepKind::TapText
                | StepKind::TapCell
                | StepKind::TapNav
                | StepKind::TapSwitch
                | StepKind::TapId
        )
    }
}

impl FromStr for StepKind {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StepKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or(())
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}

impl FromStr for SwipeDirection {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "up" => Ok(SwipeDirection::Up),
            "down" => Ok(SwipeDirection::Down),
            "left" => Ok(SwipeDirection::Left),
            "right" => Ok(SwipeDirection::Right),
            _ => Err(()),
        }
    }
}

/// Whether an alert step fails when no alert shows up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPolicy {
    Required,
    Optional,
}

/// One validated navigation action.
#[derive(Debug, Clone, PartialEq)]
pub enum NavigationStep {
    /// Any of the `tap*` kinds. `expect` names a marker that must appear afterwards.
    Tap {
        kind: StepKind,
        target: String,
        expect: Option<String>,
    },
    Swipe {
        direction: SwipeDirection,
    },
    ScrollTo {
        target: String,
    },
    TypeText {
        field: String,
        text: String,
    },
    Wait {
        duration: Duration,
    },
    Alert {
        kind: StepKind,
        policy: AlertPolicy,
    },
    Back {
        target: Option<String>,
        expect: Option<String>,
    },
}

impl NavigationStep {
    pub fn tap(kind: StepKind, target: impl Into<String>) -> Self {
        debug_assert!(kind.is_tap());
        NavigationStep::Tap {
            kind,
            target: target.into(),
            expect: None,
        }
    }

    pub fn kind(&self) -> StepKind {
        match self {
            NavigationStep::Tap { kind, .. } | NavigationStep::Alert { kind, .. } => *kind,
            NavigationStep::Swipe { .. } => StepKind::Swipe,
            NavigationStep::ScrollTo { .. } => StepKind::ScrollTo,
            NavigationStep::TypeText { .. } => StepKind::TypeText,
            NavigationStep::Wait { .. } => StepKind::Wait,
            NavigationStep::Back { .. } => StepKind::Back,
        }
    }
}

impl fmt::Display for NavigationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NavigationStep::Tap { kind, target, .. } => write!(f, "{kind} \"{target}\""),
            NavigationStep::Swipe { direction } => write!(f, "swipe {direction:?}"),
            NavigationStep::ScrollTo { target } => write!(f, "scroll_to \"{target}\""),
            NavigationStep::TypeText { field, .. } => write!(f, "type_text into \"{field}\""),
            NavigationStep::Wait { duration } => write!(f, "wait {:.1}s", duration.as_secs_f64()),
            NavigationStep::Alert { kind, policy } => write!(f, "{kind} ({policy:?})"),
            NavigationStep::Back { target: Some(t), .. } => write!(f, "back \"{t}\""),
            NavigationStep::Back { target: None, .. } => f.write_str("back"),
        }
    }
}

/// A step as the planner wrote it: either a bare label (shorthand for `tap`) or a map with
/// exactly one step-kind key plus optional modifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawStep {
    Shorthand(String),
    Fields(IndexMap<String, Value>),
}

/// Modifier keys accepted next to the step kind.
const MODIFIER_KEYS: [&str; 2] = ["field", "expect"];

/// Errors found while validating a plan. All of them abort the run before device work.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    #[error("screen '{screen}' step {index}: unknown step kind '{kind}'")]
    UnknownStepKind {
        screen: String,
        index: usize,
        kind: String,
    },

    #[error("screen '{screen}' step {index}: '{kind}' requires '{field}'")]
    MissingField {
        screen: String,
        index: usize,
        kind: StepKind,
        field: &'static str,
    },

    #[error("screen '{screen}' step {index}: invalid '{field}': {reason}")]
    InvalidValue {
        screen: String,
        index: usize,
        field: String,
        reason: String,
    },

    #[error("screen '{screen}' step {index}: a step must declare exactly one kind, found {found}")]
    KindCount {
        screen: String,
        index: usize,
        found: usize,
    },

    #[error("screen id must not be empty")]
    EmptyScreenId,

    #[error("screen '{screen}': invalid '{field}': {reason}")]
    InvalidScreen {
        screen: String,
        field: &'static str,
        reason: String,
    },

    #[error("duplicate screen id '{0}'")]
    DuplicateScreen(String),

    #[error("duplicate device name '{0}'")]
    DuplicateDevice(String),

    #[error("screens '{first}' and '{second}' both capture to '{name}'")]
    DuplicateCaptureName {
        first: String,
        second: String,
        name: String,
    },
}

/// Convert one raw planner step. `index` is 1-based and only used for messages.
pub fn parse_step(screen: &str, index: usize, raw: &RawStep) -> Result<NavigationStep, PlanError> {
    let fields = match raw {
        RawStep::Shorthand(label) => {
            if label.trim().is_empty() {
                return Err(invalid(screen, index, "tap", "label is empty"));
            }
            return Ok(NavigationStep::tap(StepKind::Tap, label.clone()));
        }
        RawStep::Fields(fields) => fields,
    };

    let mut kinds = Vec::new();
    for key in fields.keys() {
        match key.parse::<StepKind>() {
            Ok(kind) => kinds.push(kind),
            Err(()) if MODIFIER_KEYS.contains(&key.as_str()) => {}
            Err(()) => {
                return Err(PlanError::UnknownStepKind {
                    screen: screen.to_string(),
                    index,
                    kind: key.clone(),
                });
            }
        }
    }
    if kinds.len() != 1 {
        return Err(PlanError::KindCount {
            screen: screen.to_string(),
            index,
            found: kinds.len(),
        });
    }

    let kind = kinds[0];
    let value = &fields[kind.as_str()];
    let field = optional_text(screen, index, fields, "field")?;
    let expect = optional_text(screen, index, fields, "expect")?;

    let allows_expect = kind.is_tap() || kind == StepKind::Back;
    if expect.is_some() && !allows_expect {
        return Err(invalid(screen, index, "expect", &format!("not valid on {kind}")));
    }
    if field.is_some() && kind != StepKind::TypeText {
        return Err(invalid(screen, index, "field", &format!("not valid on {kind}")));
    }

    let step = match kind {
        k if k.is_tap() => NavigationStep::Tap {
            kind: k,
            target: required_text(screen, index, k, value)?,
            expect,
        },
        StepKind::ScrollTo => NavigationStep::ScrollTo {
            target: required_text(screen, index, kind, value)?,
        },
        StepKind::Swipe => {
            let direction = scalar_text(value)
                .and_then(|s| s.parse::<SwipeDirection>().ok())
                .ok_or_else(|| {
                    invalid(screen, index, "swipe", "expected up, down, left or right")
                })?;
            NavigationStep::Swipe { direction }
        }
        StepKind::TypeText => {
            let text = scalar_text(value)
                .ok_or_else(|| invalid(screen, index, "type_text", "expected text"))?;
            let field = field.ok_or_else(|| PlanError::MissingField {
                screen: screen.to_string(),
                index,
                kind,
                field: "field",
            })?;
            NavigationStep::TypeText { field, text }
        }
        StepKind::Wait => {
            let duration = value
                .as_f64()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or_else(|| {
                    invalid(screen, index, "wait", "expected a non-negative number of seconds")
                })?;
            NavigationStep::Wait { duration }
        }
        StepKind::AlertAccept | StepKind::AlertDismiss => {
            let policy = match value {
                Value::Bool(true) => AlertPolicy::Required,
                Value::String(s) if s.eq_ignore_ascii_case("required") => AlertPolicy::Required,
                Value::String(s) if s.eq_ignore_ascii_case("optional") => AlertPolicy::Optional,
                _ => {
                    return Err(invalid(
                        screen,
                        index,
                        kind.as_str(),
                        "expected 'required', 'optional' or true",
                    ));
                }
            };
            NavigationStep::Alert { kind, policy }
        }
        StepKind::Back => {
            let target = match value {
                Value::Bool(true) | Value::Null => None,
                other => Some(
                    scalar_text(other)
                        .filter(|s| !s.trim().is_empty())
                        .ok_or_else(|| {
                            invalid(screen, index, "back", "expected true or a button label")
                        })?,
                ),
            };
            NavigationStep::Back { target, expect }
        }
        _ => unreachable!("tap kinds handled above"),
    };

    Ok(step)
}

fn invalid(screen: &str, index: usize, field: &str, reason: &str) -> PlanError {
    PlanError::InvalidValue {
        screen: screen.to_string(),
        index,
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// Scalars are accepted as text so numeric labels like `1` survive YAML typing.
fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn required_text(
    screen: &str,
    index: usize,
    kind: StepKind,
    value: &Value,
) -> Result<String, PlanError> {
    match scalar_text(value) {
        Some(text) if !text.trim().is_empty() && !matches!(value, Value::Bool(_)) => Ok(text),
        _ => Err(PlanError::MissingField {
            screen: screen.to_string(),
            index,
            kind,
            field: "target",
        }),
    }
}

fn optional_text(
    screen: &str,
    index: usize,
    fields: &IndexMap<String, Value>,
    key: &str,
) -> Result<Option<String>, PlanError> {
    match fields.get(key) {
        None => Ok(None),
        Some(value) => scalar_text(value)
            .filter(|s| !s.trim().is_empty())
            .map(Some)
            .ok_or_else(|| invalid(screen, index, key, "expected non-empty text")),
    }
}
