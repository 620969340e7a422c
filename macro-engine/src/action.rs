use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents a position on the screen
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        let dx = f64::from(self.x - other.x);
        let dy = f64::from(self.y - other.y);
        (dx * dx + dy * dy).sqrt()
    }
}

/// Represents the type of mouse button
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// How coordinates of a mouse action are interpreted
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CoordinateMode {
    #[default]
    Absolute,
    Relative,
}

/// Progress curve for smooth pointer motion
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Easing {
    #[default]
    Linear,
    EaseIn,
    EaseOut,
    EaseInOut,
}

impl Easing {
    /// Maps linear progress `t` in `[0, 1]` onto the curve.
    pub fn apply(&self, t: f64) -> f64 {
        let t = t.clamp(0.0, 1.0);
        match self {
            Easing::Linear => t,
            Easing::EaseIn => t * t,
            Easing::EaseOut => t * (2.0 - t),
            Easing::EaseInOut => {
                if t < 0.5 {
                    2.0 * t * t
                } else {
                    -1.0 + (4.0 - 2.0 * t) * t
                }
            }
        }
    }
}

fn default_clicks() -> u32 {
    1
}

fn is_zero(value: &f64) -> bool {
    *value == 0.0
}

/// One atomic step of a macro.
///
/// Serialized internally tagged by `type` so a persisted macro reads as a flat
/// list of `{"type": "key_press", "key": "w"}` objects. `Condition` branches
/// are inline sub-sequences; loops are flat `LoopStart`/`LoopEnd` markers that
/// must balance within the sequence that contains them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    KeyPress {
        key: String,
    },
    KeyHold {
        key: String,
        /// Seconds
        duration: f64,
    },
    KeyRelease {
        key: String,
    },
    TypeText {
        text: String,
    },
    /// Pressed in order, released in reverse.
    KeyCombo {
        keys: Vec<String>,
    },
    MouseClick {
        #[serde(default)]
        button: MouseButton,
        x: i32,
        y: i32,
        #[serde(default)]
        mode: CoordinateMode,
        #[serde(default = "default_clicks")]
        clicks: u32,
    },
    MouseMove {
        x: i32,
        y: i32,
        #[serde(default, skip_serializing_if = "is_zero")]
        duration: f64,
        #[serde(default)]
        easing: Easing,
        #[serde(default)]
        mode: CoordinateMode,
    },
    MouseScroll {
        dx: i32,
        dy: i32,
    },
    MouseDrag {
        from: Point,
        to: Point,
        #[serde(default, skip_serializing_if = "is_zero")]
        duration: f64,
        #[serde(default)]
        button: MouseButton,
    },
    Delay {
        seconds: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        jitter: Option<f64>,
    },
    LoopStart {
        count: u32,
    },
    LoopEnd,
    Condition {
        expr: String,
        #[serde(default, rename = "then")]
        then_branch: Vec<Action>,
        #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
        else_branch: Vec<Action>,
    },
    VariableSet {
        name: String,
        expr: String,
    },
    HotkeyTrigger {
        macro_id: String,
    },
}

impl Action {
    pub fn key_press(key: impl Into<String>) -> Self {
        Action::KeyPress { key: key.into() }
    }

    pub fn delay(seconds: f64) -> Self {
        Action::Delay {
            seconds,
            jitter: None,
        }
    }

    pub fn loop_start(count: u32) -> Self {
        Action::LoopStart { count }
    }

    pub fn set(name: impl Into<String>, expr: impl Into<String>) -> Self {
        Action::VariableSet {
            name: name.into(),
            expr: expr.into(),
        }
    }

    /// The snake_case variant name, matching the persisted `type` tag.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::KeyPress { .. } => "key_press",
            Action::KeyHold { .. } => "key_hold",
            Action::KeyRelease { .. } => "key_release",
            Action::TypeText { .. } => "type_text",
            Action::KeyCombo { .. } => "key_combo",
            Action::MouseClick { .. } => "mouse_click",
            Action::MouseMove { .. } => "mouse_move",
            Action::MouseScroll { .. } => "mouse_scroll",
            Action::MouseDrag { .. } => "mouse_drag",
            Action::Delay { .. } => "delay",
            Action::LoopStart { .. } => "loop_start",
            Action::LoopEnd => "loop_end",
            Action::Condition { .. } => "condition",
            Action::VariableSet { .. } => "variable_set",
            Action::HotkeyTrigger { .. } => "hotkey_trigger",
        }
    }

    /// Whether the action reaches the injection device.
    pub fn is_input(&self) -> bool {
        matches!(
            self,
            Action::KeyPress { .. }
                | Action::KeyHold { .. }
                | Action::KeyRelease { .. }
                | Action::TypeText { .. }
                | Action::KeyCombo { .. }
                | Action::MouseClick { .. }
                | Action::MouseMove { .. }
                | Action::MouseScroll { .. }
                | Action::MouseDrag { .. }
        )
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::KeyPress { key } => write!(f, "press {key}"),
            Action::KeyHold { key, duration } => write!(f, "hold {key} for {duration}s"),
            Action::KeyRelease { key } => write!(f, "release {key}"),
            Action::TypeText { text } => write!(f, "type {text:?}"),
            Action::KeyCombo { keys } => write!(f, "combo {}", keys.join("+")),
            Action::MouseClick { button, x, y, .. } => write!(f, "click {button:?} at ({x}, {y})"),
            Action::MouseMove { x, y, .. } => write!(f, "move to ({x}, {y})"),
            Action::MouseScroll { dx, dy } => write!(f, "scroll ({dx}, {dy})"),
            Action::MouseDrag { from, to, .. } => {
                write!(f, "drag ({}, {}) -> ({}, {})", from.x, from.y, to.x, to.y)
            }
            Action::Delay { seconds, .. } => write!(f, "wait {seconds}s"),
            Action::LoopStart { count } => write!(f, "loop x{count}"),
            Action::LoopEnd => write!(f, "end loop"),
            Action::Condition { expr, .. } => write!(f, "if {expr}"),
            Action::VariableSet { name, expr } => write!(f, "set {name} = {expr}"),
            Action::HotkeyTrigger { macro_id } => write!(f, "trigger {macro_id}"),
        }
    }
}
