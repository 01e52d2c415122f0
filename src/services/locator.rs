//! Locator resolution: from a step's textual target to exactly one node of a tree snapshot.
//!
//! The candidate set is restricted by the step kind to one or more role groups, tried in
//! order. Inside a group, matching runs in tiers (exact identifier, exact label,
//! case-insensitive substring) and stops at the first tier that yields anything. More than
//! one node at that tier is an ambiguity, never a guess.

use crate::models::{AccessibilityNode, NodeRef, Rect, Role, StepKind};
use std::fmt;
use thiserror::Error;

/// Summary of a matching node, kept for error reports.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub role: Role,
    pub label: String,
    pub identifier: Option<String>,
    pub frame: Rect,
}

impl Candidate {
    fn from_node(node: &AccessibilityNode) -> Self {
        Self {
            role: node.role,
            label: node.label.clone(),
            identifier: node.identifier.clone(),
            frame: node.frame,
        }
    }
}

impl fmt::Display for Candidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} \"{}\" at {}", self.role, self.label, self.frame)
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LocatorError {
    #[error("NotFound: no element for {kind} \"{target}\"")]
    NotFound { kind: StepKind, target: String },

    #[error(
        "AmbiguousMatch: {kind} \"{target}\" matched {} elements: {}",
        .candidates.len(),
        format_candidates(.candidates)
    )]
    AmbiguousMatch {
        kind: StepKind,
        target: String,
        candidates: Vec<Candidate>,
    },
}

pub(crate) fn format_candidates(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(Candidate::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Which nodes a step kind may land on.
struct Scope {
    groups: &'static [&'static [Role]],
    nav_bar_only: bool,
    identifier_only: bool,
    /// Cells answer to the labels of the texts they contain.
    descendant_labels: bool,
}

const ALL_ROLES: &[Role] = &[
    Role::Button,
    Role::Tab,
    Role::Text,
    Role::Cell,
    Role::NavBar,
    Role::SwitchControl,
    Role::TextField,
    Role::Alert,
    Role::Other,
];

const TAP: &[&[Role]] = &[&[Role::Button], &[Role::TextField], &[Role::Text]];
const TABS: &[&[Role]] = &[&[Role::Tab]];
const TEXTS: &[&[Role]] = &[&[Role::Text]];
const CELLS: &[&[Role]] = &[&[Role::Cell]];
const BUTTONS: &[&[Role]] = &[&[Role::Button]];
const SWITCHES: &[&[Role]] = &[&[Role::SwitchControl]];
const FIELDS: &[&[Role]] = &[&[Role::TextField]];
const SCROLLABLE: &[&[Role]] = &[&[Role::Text, Role::Button, Role::Cell]];
const ANY: &[&[Role]] = &[ALL_ROLES];

fn plain(groups: &'static [&'static [Role]]) -> Scope {
    Scope {
        groups,
        nav_bar_only: false,
        identifier_only: false,
        descendant_labels: false,
    }
}

fn scope_for(kind: StepKind) -> Scope {
    match kind {
        StepKind::Tap => plain(TAP),
        StepKind::TapTab => plain(TABS),
        StepKind::TapText => plain(TEXTS),
        StepKind::TapCell => Scope {
            descendant_labels: true,
            ..plain(CELLS)
        },
        StepKind::TapNav | StepKind::Back => Scope {
            nav_bar_only: true,
            ..plain(BUTTONS)
        },
        StepKind::TapSwitch => plain(SWITCHES),
        StepKind::TapId => Scope {
            identifier_only: true,
            ..plain(ANY)
        },
        StepKind::ScrollTo => Scope {
            descendant_labels: true,
            ..plain(SCROLLABLE)
        },
        StepKind::TypeText => plain(FIELDS),
        _ => plain(ANY),
    }
}

/// Resolve `target` for a step of `kind` against `tree`.
///
/// # Returns
/// The single matching node, or `NotFound` / `AmbiguousMatch` (with every candidate at the
/// producing tier).
pub fn resolve<'a>(
    tree: &'a AccessibilityNode,
    kind: StepKind,
    target: &str,
) -> Result<&'a AccessibilityNode, LocatorError> {
    let scope = scope_for(kind);
    let nodes = tree.walk();

    for group in scope.groups {
        let in_group: Vec<&NodeRef<'a>> = nodes
            .iter()
            .filter(|r| group.contains(&r.node.role) && (!scope.nav_bar_only || r.in_nav_bar))
            .collect();
        if in_group.is_empty() {
            continue;
        }

        if let Some(matches) = match_tiers(&in_group, target, &scope) {
            return match matches.as_slice() {
                [single] => Ok(*single),
                _ => Err(LocatorError::AmbiguousMatch {
                    kind,
                    target: target.to_string(),
                    candidates: matches.iter().map(|n| Candidate::from_node(n)).collect(),
                }),
            };
        }
    }

    Err(LocatorError::NotFound {
        kind,
        target: target.to_string(),
    })
}

/// Presence check for `expect` markers: any role, and an ambiguous match still counts.
pub fn is_present(tree: &AccessibilityNode, marker: &str) -> bool {
    let nodes = tree.walk();
    let refs: Vec<&NodeRef<'_>> = nodes.iter().collect();
    match_tiers(&refs, marker, &plain(ANY)).is_some()
}

/// The first button inside a navigation bar, in document order.
pub fn first_nav_button(tree: &AccessibilityNode) -> Option<&AccessibilityNode> {
    tree.walk()
        .into_iter()
        .find(|r| r.in_nav_bar && r.node.role == Role::Button)
        .map(|r| r.node)
}

fn match_tiers<'a>(
    candidates: &[&NodeRef<'a>],
    target: &str,
    scope: &Scope,
) -> Option<Vec<&'a AccessibilityNode>> {
    let by_identifier = collect(candidates, |n| n.identifier.as_deref() == Some(target));
    if !by_identifier.is_empty() || scope.identifier_only {
        return (!by_identifier.is_empty()).then_some(by_identifier);
    }

    let labels_of = |n: &AccessibilityNode| -> Vec<String> {
        let mut labels = vec![n.label.clone()];
        if scope.descendant_labels && n.role == Role::Cell {
            labels.extend(n.descendant_text_labels().into_iter().map(str::to_string));
        }
        labels
    };

    let exact = collect(candidates, |n| labels_of(n).iter().any(|l| l == target));
    if !exact.is_empty() {
        return Some(exact);
    }

    let needle = target.to_lowercase();
    if needle.is_empty() {
        return None;
    }
    let partial = collect(candidates, |n| {
        labels_of(n)
            .iter()
            .any(|l| !l.is_empty() && l.to_lowercase().contains(&needle))
    });
    (!partial.is_empty()).then_some(partial)
}

fn collect<'a>(
    candidates: &[&NodeRef<'a>],
    pred: impl Fn(&AccessibilityNode) -> bool,
) -> Vec<&'a AccessibilityNode> {
    candidates
        .iter()
        .map(|r| r.node)
        .filter(|n| pred(n))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn node(role: Role, label: &str, y: f64) -> AccessibilityNode {
        AccessibilityNode::new(role, label, Rect::new(0.0, y, 100.0, 40.0))
    }

    fn root(children: Vec<AccessibilityNode>) -> AccessibilityNode {
        AccessibilityNode::new(Role::Other, "", Rect::new(0.0, 0.0, 390.0, 844.0))
            .with_children(children)
    }

    #[test]
    fn test_identifier_beats_label() {
        let tree = root(vec![
            node(Role::Button, "Save", 0.0),
            node(Role::Button, "Save draft", 50.0).with_identifier("Save"),
        ]);
        let found = resolve(&tree, StepKind::Tap, "Save").unwrap();
        assert_eq!(found.label, "Save draft");
    }

    #[test]
    fn test_exact_label_beats_substring() {
        let tree = root(vec![
            node(Role::Tab, "Settings", 0.0),
            node(Role::Tab, "Advanced Settings", 50.0),
        ]);
        assert_eq!(resolve(&tree, StepKind::TapTab, "Settings").unwrap().label, "Settings");
    }

    #[test]
    fn test_substring_is_case_insensitive() {
        let tree = root(vec![node(Role::Text, "Welcome back, Ana", 0.0)]);
        assert!(resolve(&tree, StepKind::TapText, "WELCOME").is_ok());
    }

    #[test]
    fn test_tap_prefers_buttons_over_text() {
        let tree = root(vec![
            node(Role::Text, "Continue", 0.0),
            node(Role::Button, "Continue", 50.0),
        ]);
        assert_eq!(resolve(&tree, StepKind::Tap, "Continue").unwrap().role, Role::Button);

        let text_only = root(vec![node(Role::Text, "Continue", 0.0)]);
        assert_eq!(resolve(&text_only, StepKind::Tap, "Continue").unwrap().role, Role::Text);
    }

    #[test]
    fn test_role_restriction() {
        let tree = root(vec![node(Role::Button, "Home", 0.0)]);
        assert_eq!(
            resolve(&tree, StepKind::TapTab, "Home"),
            Err(LocatorError::NotFound {
                kind: StepKind::TapTab,
                target: "Home".to_string()
            })
        );
    }

    #[test]
    fn test_duplicate_tabs_are_ambiguous_with_frames() {
        let tree = root(vec![node(Role::Tab, "Settings", 0.0), node(Role::Tab, "Settings", 800.0)]);
        let err = resolve(&tree, StepKind::TapTab, "Settings").unwrap_err();
        match &err {
            LocatorError::AmbiguousMatch { candidates, .. } => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(candidates[1].frame, Rect::new(0.0, 800.0, 100.0, 40.0));
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
        let message = err.to_string();
        assert!(message.starts_with("AmbiguousMatch"));
        assert!(message.contains("(0, 0, 100x40)"));
        assert!(message.contains("(0, 800, 100x40)"));
    }

    #[test]
    fn test_cell_matches_contained_text() {
        let tree = root(vec![
            node(Role::Cell, "", 0.0).with_children(vec![node(Role::Text, "Notifications", 5.0)]),
            node(Role::Cell, "", 50.0).with_children(vec![node(Role::Text, "Privacy", 55.0)]),
        ]);
        let cell = resolve(&tree, StepKind::TapCell, "Privacy").unwrap();
        assert_eq!(cell.frame.y, 50.0);
    }

    #[test]
    fn test_nav_scope_and_first_nav_button() {
        let tree = root(vec![
            node(Role::Button, "Back", 600.0),
            node(Role::NavBar, "Detail", 40.0).with_children(vec![
                node(Role::Button, "Back", 40.0),
                node(Role::Button, "Edit", 40.0),
            ]),
        ]);
        let back = resolve(&tree, StepKind::Back, "Back").unwrap();
        assert_eq!(back.frame.y, 40.0);
        assert_eq!(first_nav_button(&tree).unwrap().label, "Back");
        assert!(resolve(&tree, StepKind::TapNav, "Edit").is_ok());
    }

    #[test]
    fn test_tap_id_uses_identifier_only() {
        let tree = root(vec![node(Role::Other, "avatar", 0.0).with_identifier("profile.avatar")]);
        assert!(resolve(&tree, StepKind::TapId, "profile.avatar").is_ok());
        assert!(resolve(&tree, StepKind::TapId, "avatar").is_err());
    }

    #[test]
    fn test_is_present_counts_ambiguous() {
        let tree = root(vec![node(Role::Text, "Saved", 0.0), node(Role::Text, "Saved", 50.0)]);
        assert!(is_present(&tree, "Saved"));
        assert!(!is_present(&tree, "Deleted"));
    }

    proptest! {
        #[test]
        fn prop_unique_label_always_resolves(
            labels in prop::collection::hash_set("[a-z]{3,8}", 1..12),
            pick in 0usize..12,
        ) {
            let labels: Vec<String> = labels.into_iter().collect();
            let target = labels[pick % labels.len()].clone();
            // Prefix every label so no label is a substring of another.
            let children = labels
                .iter()
                .enumerate()
                .map(|(i, l)| node(Role::Button, &format!("#{l}#"), i as f64 * 50.0))
                .collect();
            let tree = root(children);
            let found = resolve(&tree, StepKind::Tap, &format!("#{target}#")).unwrap();
            prop_assert_eq!(&found.label, &format!("#{target}#"));
        }

        #[test]
        fn prop_duplicates_never_resolve(copies in 2usize..6, label in "[A-Za-z]{1,10}") {
            let children = (0..copies).map(|i| node(Role::Tab, &label, i as f64 * 50.0)).collect();
            let tree = root(children);
            match resolve(&tree, StepKind::TapTab, &label) {
                Err(LocatorError::AmbiguousMatch { candidates, .. }) => {
                    prop_assert_eq!(candidates.len(), copies)
                }
                other => prop_assert!(false, "expected ambiguity, got {:?}", other),
            }
        }
    }
}
