use macro_engine::{canonical_key, is_modifier_key, MouseButton, Point};
use serde::{Deserialize, Serialize};

/// Modifier keys, in the order a combo presses them.
pub const MODIFIER_KEYS: [&str; 4] = ["ctrl", "shift", "alt", "meta"];

/// Canonical key name, with left/right variants folded together.
pub fn normalize_key(key: &str) -> String {
    canonical_key(key)
}

pub fn is_modifier(key: &str) -> bool {
    is_modifier_key(key)
}

/// What physically happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CapturedEventKind {
    KeyDown { key: String },
    KeyUp { key: String },
    MouseDown { button: MouseButton, x: i32, y: i32 },
    MouseUp { button: MouseButton, x: i32, y: i32 },
    MouseMove { x: i32, y: i32 },
    Wheel { dx: i32, dy: i32 },
}

impl CapturedEventKind {
    pub fn key_down(key: &str) -> Self {
        CapturedEventKind::KeyDown { key: normalize_key(key) }
    }

    pub fn key_up(key: &str) -> Self {
        CapturedEventKind::KeyUp { key: normalize_key(key) }
    }

    pub fn is_keyboard(&self) -> bool {
        matches!(self, CapturedEventKind::KeyDown { .. } | CapturedEventKind::KeyUp { .. })
    }

    /// Screen position carried by the event, if any
    pub fn position(&self) -> Option<Point> {
        match self {
            CapturedEventKind::MouseDown { x, y, .. }
            | CapturedEventKind::MouseUp { x, y, .. }
            | CapturedEventKind::MouseMove { x, y } => Some(Point::new(*x, *y)),
            _ => None,
        }
    }
}

/// A captured input event, stamped in milliseconds since the session started.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedEvent {
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: CapturedEventKind,
}

impl CapturedEvent {
    pub fn new(timestamp_ms: u64, kind: CapturedEventKind) -> Self {
        Self { timestamp_ms, kind }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_names_are_normalized() {
        assert_eq!(normalize_key(" Control "), "ctrl");
        assert_eq!(normalize_key("Cmd"), "meta");
        assert_eq!(normalize_key("F5"), "f5");
        assert!(is_modifier(&normalize_key("RShift")));
        assert!(!is_modifier("a"));
    }

    #[test]
    fn test_event_json_shape() {
        let event = CapturedEvent::new(
            120,
            CapturedEventKind::MouseDown {
                button: MouseButton::Right,
                x: 5,
                y: 7,
            },
        );
        let json: serde_json::Value = serde_json::to_value(&event).unwrap();
        assert_eq!(json["timestamp_ms"], 120);
        assert_eq!(json["type"], "mouse_down");
        assert_eq!(json["button"], "right");
        assert_eq!(event.kind.position(), Some(Point::new(5, 7)));
    }
}
