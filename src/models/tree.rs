//! Accessibility tree snapshots.
//!
//! The tree arrives from the accessibility bridge as loosely-shaped JSON. It is converted at
//! the boundary into [`AccessibilityNode`], whose [`Role`] is a closed enum: anything the
//! bridge reports that we do not recognise lands in [`Role::Other`] instead of leaking raw
//! strings into the matching logic.

use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Closed set of element roles the locator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    Button,
    Tab,
    Text,
    Cell,
    NavBar,
    SwitchControl,
    TextField,
    Alert,
    Other,
}

impl Role {
    /// Map a role/type string from any of the usual sources (our own dumps, XCUIElementType
    /// names, AX roles) onto the closed enum.
    pub fn from_raw(raw: &str) -> Self {
        let lowered = raw.trim().to_ascii_lowercase();
        let name = lowered
            .strip_prefix("xcuielementtype")
            .or_else(|| lowered.strip_prefix("ax"))
            .unwrap_or(&lowered);

        match name {
            "button" => Role::Button,
            "tab" | "tabbutton" | "radiobutton" => Role::Tab,
            "text" | "statictext" => Role::Text,
            "cell" => Role::Cell,
            "navbar" | "navigationbar" => Role::NavBar,
            "switch" | "switchcontrol" | "toggle" => Role::SwitchControl,
            "textfield" | "securetextfield" | "searchfield" | "textview" | "textarea" => {
                Role::TextField
            }
            "alert" | "dialog" => Role::Alert,
            _ => Role::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Button => "button",
            Role::Tab => "tab",
            Role::Text => "text",
            Role::Cell => "cell",
            Role::NavBar => "navBar",
            Role::SwitchControl => "switchControl",
            Role::TextField => "textField",
            Role::Alert => "alert",
            Role::Other => "other",
        }
    }
}

impl From<String> for Role {
    fn from(raw: String) -> Self {
        Role::from_raw(&raw)
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A point in screen coordinates (points, not pixels).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// Element frame in screen coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0.0 || self.height <= 0.0
    }

    pub fn contains(&self, other: &Rect) -> bool {
        other.x >= self.x
            && other.y >= self.y
            && other.x + other.width <= self.x + self.width
            && other.y + other.height <= self.y + self.height
    }

    /// True when the centre of `self` lies inside `bounds`, i.e. a tap on it would land.
    pub fn is_hittable_within(&self, bounds: &Rect) -> bool {
        let c = self.center();
        !self.is_empty()
            && c.x >= bounds.x
            && c.y >= bounds.y
            && c.x <= bounds.x + bounds.width
            && c.y <= bounds.y + bounds.height
    }

    fn hash_into<H: Hasher>(&self, state: &mut H) {
        self.x.to_bits().hash(state);
        self.y.to_bits().hash(state);
        self.width.to_bits().hash(state);
        self.height.to_bits().hash(state);
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}, {}x{})",
            self.x, self.y, self.width, self.height
        )
    }
}

/// One element of an accessibility tree snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessibilityNode {
    pub role: Role,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub identifier: Option<String>,
    /// Reported value, e.g. "1" for an enabled switch or a selected tab.
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub focused: bool,
    #[serde(default)]
    pub frame: Rect,
    #[serde(default)]
    pub children: Vec<AccessibilityNode>,
}

/// A node seen during traversal, together with what it is nested in.
#[derive(Debug, Clone, Copy)]
pub struct NodeRef<'a> {
    pub node: &'a AccessibilityNode,
    pub in_nav_bar: bool,
}

impl AccessibilityNode {
    pub fn new(role: Role, label: impl Into<String>, frame: Rect) -> Self {
        Self {
            role,
            label: label.into(),
            identifier: None,
            value: None,
            focused: false,
            frame,
            children: Vec::new(),
        }
    }

    pub fn with_identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_focus(mut self) -> Self {
        self.focused = true;
        self
    }

    pub fn with_children(mut self, children: Vec<AccessibilityNode>) -> Self {
        self.children = children;
        self
    }

    /// Pre-order traversal of the whole tree, root included.
    pub fn walk(&self) -> Vec<NodeRef<'_>> {
        let mut out = Vec::new();
        self.walk_into(false, &mut out);
        out
    }

    fn walk_into<'a>(&'a self, in_nav_bar: bool, out: &mut Vec<NodeRef<'a>>) {
        out.push(NodeRef { node: self, in_nav_bar });
        let nav = in_nav_bar || self.role == Role::NavBar;
        for child in &self.children {
            child.walk_into(nav, out);
        }
    }

    /// First node with the given role, in document order.
    pub fn find_role(&self, role: Role) -> Option<&AccessibilityNode> {
        if self.role == role {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_role(role))
    }

    /// Labels of all text descendants (not including `self`).
    pub fn descendant_text_labels(&self) -> Vec<&str> {
        let mut labels = Vec::new();
        for child in &self.children {
            for r in child.walk() {
                if r.node.role == Role::Text && !r.node.label.is_empty() {
                    labels.push(r.node.label.as_str());
                }
            }
        }
        labels
    }

    /// Whether the reported value reads as "on"/"selected".
    pub fn is_selected(&self) -> bool {
        matches!(
            self.value.as_deref().map(str::to_ascii_lowercase).as_deref(),
            Some("1" | "true" | "on" | "selected")
        )
    }

    /// Structural hash of the snapshot, used to detect whether an action changed the UI.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.hash_into(&mut hasher);
        hasher.finish()
    }

    fn hash_into<H: Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.label.hash(state);
        self.identifier.hash(state);
        self.value.hash(state);
        self.focused.hash(state);
        self.frame.hash_into(state);
        self.children.len().hash(state);
        for child in &self.children {
            child.hash_into(state);
        }
    }

    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(|c| c.node_count()).sum::<usize>()
    }
}
