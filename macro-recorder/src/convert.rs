//! Turns a buffer of captured events into an action sequence.
//!
//! Events are replayed in timestamp order through a small state machine that
//! pairs downs with ups. Each paired gesture becomes one [`Step`] spanning the
//! time from its first to its last physical event; the quiet time between
//! consecutive steps becomes a `Delay`, quantized by [`Precision`].

use crate::events::{is_modifier, CapturedEvent, CapturedEventKind, MODIFIER_KEYS};
use crate::recorder::RecorderConfig;
use macro_engine::{Action, CoordinateMode, Easing, MouseButton, Point};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Delay quantization bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    High,
    #[default]
    Medium,
    Low,
}

impl Precision {
    /// Granularity recorded delays are rounded to
    pub fn step_ms(self) -> u64 {
        match self {
            Precision::High => 10,
            Precision::Medium => 50,
            Precision::Low => 100,
        }
    }

    /// Gaps shorter than this are not recorded at all
    pub fn floor_ms(self) -> u64 {
        self.step_ms()
    }

    /// Rounds `ms` to the nearest step.
    pub fn round(self, ms: u64) -> u64 {
        let step = self.step_ms();
        (ms + step / 2) / step * step
    }

    /// The delay to record for a gap, or `None` when it is below the floor.
    pub fn quantize(self, gap_ms: u64) -> Option<u64> {
        if gap_ms < self.floor_ms() {
            return None;
        }
        Some(self.round(gap_ms))
    }
}

fn seconds(ms: u64) -> f64 {
    ms as f64 / 1000.0
}

struct Step {
    start_ms: u64,
    end_ms: u64,
    action: Action,
}

struct HeldKey {
    key: String,
    down_ms: u64,
    /// Already emitted as part of a combo
    chorded: bool,
}

struct PressedButton {
    button: MouseButton,
    down_ms: u64,
    at: Point,
}

struct Converter<'a> {
    config: &'a RecorderConfig,
    held: Vec<HeldKey>,
    pressed: Vec<PressedButton>,
    last_move_ms: Option<u64>,
    steps: Vec<Step>,
}

impl<'a> Converter<'a> {
    fn new(config: &'a RecorderConfig) -> Self {
        Self {
            config,
            held: Vec::new(),
            pressed: Vec::new(),
            last_move_ms: None,
            steps: Vec::new(),
        }
    }

    fn push(&mut self, start_ms: u64, end_ms: u64, action: Action) {
        self.steps.push(Step {
            start_ms,
            end_ms,
            action,
        });
    }

    fn feed(&mut self, event: &CapturedEvent) {
        let t = event.timestamp_ms;
        if event.kind.is_keyboard() && !self.config.record_keyboard {
            return;
        }
        if !event.kind.is_keyboard() && !self.config.record_mouse {
            return;
        }
        match &event.kind {
            CapturedEventKind::KeyDown { key } => self.key_down(key, t),
            CapturedEventKind::KeyUp { key } => self.key_up(key, t),
            CapturedEventKind::MouseDown { button, x, y } => {
                // OS auto-repeat of a held button is not a new press
                if self.pressed.iter().all(|p| p.button != *button) {
                    self.pressed.push(PressedButton {
                        button: *button,
                        down_ms: t,
                        at: Point::new(*x, *y),
                    });
                }
            }
            CapturedEventKind::MouseUp { button, x, y } => self.mouse_up(*button, Point::new(*x, *y), t),
            CapturedEventKind::MouseMove { x, y } => self.mouse_move(Point::new(*x, *y), t),
            CapturedEventKind::Wheel { dx, dy } => self.push(t, t, Action::MouseScroll { dx: *dx, dy: *dy }),
        }
    }

    fn key_down(&mut self, key: &str, t: u64) {
        if self.held.iter().any(|h| h.key == key) {
            return;
        }
        self.held.push(HeldKey {
            key: key.to_string(),
            down_ms: t,
            chorded: false,
        });
    }

    fn key_up(&mut self, key: &str, t: u64) {
        let Some(position) = self.held.iter().position(|h| h.key == key) else {
            self.push(t, t, Action::KeyRelease { key: key.to_string() });
            return;
        };
        let released = self.held.remove(position);
        let held_ms = t.saturating_sub(released.down_ms);

        if is_modifier(key) {
            if !released.chorded {
                self.tap_or_hold(released, held_ms, t);
            }
            return;
        }

        let mut modifiers: Vec<&mut HeldKey> = self.held.iter_mut().filter(|h| is_modifier(&h.key)).collect();
        if !modifiers.is_empty() && held_ms < self.config.hold_threshold_ms {
            modifiers.sort_by_key(|h| MODIFIER_KEYS.iter().position(|m| *m == h.key));
            let mut keys: Vec<String> = Vec::with_capacity(modifiers.len() + 1);
            for modifier in modifiers {
                modifier.chorded = true;
                keys.push(modifier.key.clone());
            }
            keys.push(released.key);
            self.push(released.down_ms, t, Action::KeyCombo { keys });
            return;
        }
        self.tap_or_hold(released, held_ms, t);
    }

    fn tap_or_hold(&mut self, released: HeldKey, held_ms: u64, t: u64) {
        let action = if held_ms < self.config.hold_threshold_ms {
            Action::KeyPress { key: released.key }
        } else {
            let precision = self.config.precision;
            Action::KeyHold {
                key: released.key,
                duration: seconds(precision.round(held_ms).max(precision.step_ms())),
            }
        };
        self.push(released.down_ms, t, action);
    }

    fn mouse_up(&mut self, button: MouseButton, to: Point, t: u64) {
        let Some(position) = self.pressed.iter().position(|p| p.button == button) else {
            debug!(?button, "Ignoring release of a button pressed before recording");
            return;
        };
        let press = self.pressed.remove(position);
        let action = if press.at.distance(&to) <= self.config.min_drag_distance {
            Action::MouseClick {
                button,
                x: press.at.x,
                y: press.at.y,
                mode: CoordinateMode::Absolute,
                clicks: 1,
            }
        } else {
            Action::MouseDrag {
                from: press.at,
                to,
                duration: seconds(self.config.precision.round(t.saturating_sub(press.down_ms))),
                button,
            }
        };
        self.push(press.down_ms, t, action);
    }

    fn mouse_move(&mut self, to: Point, t: u64) {
        // Motion while a button is down belongs to the drag
        if !self.config.record_mouse_moves || !self.pressed.is_empty() {
            return;
        }
        if let Some(last) = self.last_move_ms {
            if t.saturating_sub(last) < self.config.mouse_move_throttle_ms {
                return;
            }
        }
        self.last_move_ms = Some(t);
        self.push(
            t,
            t,
            Action::MouseMove {
                x: to.x,
                y: to.y,
                duration: 0.0,
                easing: Easing::Linear,
                mode: CoordinateMode::Absolute,
            },
        );
    }

    fn finish(mut self) -> Vec<Action> {
        for key in self.held.iter().filter(|h| !h.chorded) {
            debug!(key = %key.key, "Dropping key still held when recording stopped");
        }
        // Gestures are completed on release; order them by when they began
        self.steps.sort_by_key(|s| s.start_ms);

        let precision = self.config.precision;
        let mut actions = Vec::with_capacity(self.steps.len() * 2);
        let mut previous_end: Option<u64> = None;
        for step in self.steps {
            if let Some(end) = previous_end {
                if let Some(ms) = precision.quantize(step.start_ms.saturating_sub(end)) {
                    actions.push(Action::delay(seconds(ms)));
                }
            }
            previous_end = Some(previous_end.map_or(step.end_ms, |end| end.max(step.end_ms)));
            actions.push(step.action);
        }
        actions
    }
}

/// Converts captured events into actions. Events may arrive in any order;
/// they are replayed by timestamp.
pub fn convert(events: &[CapturedEvent], config: &RecorderConfig) -> Vec<Action> {
    let mut ordered: Vec<&CapturedEvent> = events.iter().collect();
    ordered.sort_by_key(|e| e.timestamp_ms);

    let mut converter = Converter::new(config);
    for event in ordered {
        converter.feed(event);
    }
    converter.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn down(t: u64, key: &str) -> CapturedEvent {
        CapturedEvent::new(t, CapturedEventKind::key_down(key))
    }

    fn up(t: u64, key: &str) -> CapturedEvent {
        CapturedEvent::new(t, CapturedEventKind::key_up(key))
    }

    fn mouse(t: u64, pressed: bool, x: i32, y: i32) -> CapturedEvent {
        let button = MouseButton::Left;
        let kind = if pressed {
            CapturedEventKind::MouseDown { button, x, y }
        } else {
            CapturedEventKind::MouseUp { button, x, y }
        };
        CapturedEvent::new(t, kind)
    }

    #[test]
    fn test_precision_buckets() {
        assert_eq!(Precision::Medium.quantize(49), None);
        assert_eq!(Precision::Medium.quantize(74), Some(50));
        assert_eq!(Precision::Medium.quantize(75), Some(100));
        assert_eq!(Precision::High.quantize(9), None);
        assert_eq!(Precision::High.quantize(14), Some(10));
        assert_eq!(Precision::Low.quantize(99), None);
        assert_eq!(Precision::Low.quantize(1249), Some(1200));
    }

    #[test]
    fn test_taps_with_quantized_gap() {
        let config = RecorderConfig::default();
        let actions = convert(&[down(0, "w"), up(40, "w"), down(540, "Space"), up(560, "Space")], &config);
        assert_eq!(
            actions,
            vec![Action::key_press("w"), Action::delay(0.5), Action::key_press("space")]
        );
    }

    #[test]
    fn test_jitter_sized_gaps_are_dropped() {
        let config = RecorderConfig::default();
        let actions = convert(&[down(0, "a"), up(10, "a"), down(30, "b"), up(45, "b")], &config);
        assert_eq!(actions, vec![Action::key_press("a"), Action::key_press("b")]);
    }

    #[test]
    fn test_long_press_becomes_hold() {
        let config = RecorderConfig::default();
        let actions = convert(&[down(0, "shift"), up(1020, "shift")], &config);
        assert_eq!(
            actions,
            vec![Action::KeyHold {
                key: "shift".into(),
                duration: 1.0
            }]
        );
    }

    #[test]
    fn test_modifiers_chord_into_combo() {
        let config = RecorderConfig::default();
        let actions = convert(
            &[
                down(0, "Shift"),
                down(5, "Control"),
                down(20, "s"),
                up(60, "s"),
                down(300, "t"),
                up(320, "t"),
                up(400, "control"),
                up(410, "shift"),
            ],
            &config,
        );
        assert_eq!(
            actions,
            vec![
                Action::KeyCombo {
                    keys: vec!["ctrl".into(), "shift".into(), "s".into()]
                },
                Action::delay(0.25),
                Action::KeyCombo {
                    keys: vec!["ctrl".into(), "shift".into(), "t".into()]
                },
            ]
        );
    }

    #[test]
    fn test_orphan_release_and_auto_repeat() {
        let config = RecorderConfig::default();
        let actions = convert(&[up(0, "alt"), down(100, "x"), down(130, "x"), up(150, "x")], &config);
        assert_eq!(
            actions,
            vec![
                Action::KeyRelease { key: "alt".into() },
                Action::delay(0.1),
                Action::key_press("x")
            ]
        );
    }

    #[test]
    fn test_click_versus_drag() {
        let config = RecorderConfig::default();
        let actions = convert(
            &[mouse(0, true, 100, 100), mouse(80, false, 103, 102), mouse(500, true, 10, 10), mouse(900, false, 200, 10)],
            &config,
        );
        assert_eq!(actions.len(), 3);
        assert!(matches!(actions[0], Action::MouseClick { x: 100, y: 100, clicks: 1, .. }));
        assert_eq!(actions[1], Action::delay(0.4));
        assert_eq!(
            actions[2],
            Action::MouseDrag {
                from: Point::new(10, 10),
                to: Point::new(200, 10),
                duration: 0.4,
                button: MouseButton::Left,
            }
        );
    }

    #[test]
    fn test_moves_are_throttled_and_optional() {
        let moves: Vec<_> = (0..10)
            .map(|i| CapturedEvent::new(i * 10, CapturedEventKind::MouseMove { x: i as i32, y: 0 }))
            .collect();
        assert!(convert(&moves, &RecorderConfig::default()).is_empty());

        let config = RecorderConfig {
            record_mouse_moves: true,
            precision: Precision::High,
            ..RecorderConfig::default()
        };
        let actions = convert(&moves, &config);
        let kept: Vec<_> = actions
            .iter()
            .filter_map(|a| match a {
                Action::MouseMove { x, .. } => Some(*x),
                _ => None,
            })
            .collect();
        assert_eq!(kept, vec![0, 5]);
    }

    #[test]
    fn test_wheel_and_disabled_keyboard() {
        let config = RecorderConfig {
            record_keyboard: false,
            ..RecorderConfig::default()
        };
        let actions = convert(
            &[down(0, "a"), up(10, "a"), CapturedEvent::new(20, CapturedEventKind::Wheel { dx: 0, dy: -3 })],
            &config,
        );
        assert_eq!(actions, vec![Action::MouseScroll { dx: 0, dy: -3 }]);
    }

    #[test]
    fn test_out_of_order_events_are_sorted() {
        let config = RecorderConfig::default();
        let actions = convert(&[up(30, "q"), down(0, "q")], &config);
        assert_eq!(actions, vec![Action::key_press("q")]);
    }
}
