//! Low-level input events and the sinks that inject them.
//!
//! Pointer positions travel in device-absolute units (`0..=65535` per axis);
//! wheel ticks follow the desktop convention, positive = up / right.

use serde::Serialize;

use crate::coords::CoordinateSpace;
use crate::error::InjectionError;

/// One wheel notch in OS delta units.
pub const WHEEL_DELTA: i32 = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WheelAxis {
    Vertical,
    Horizontal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum InputEvent {
    MoveAbsolute { x: i32, y: i32 },
    LeftDown,
    LeftUp,
    KeyDown { ch: char },
    KeyUp { ch: char },
    /// `notches` is signed; each notch is one `WHEEL_DELTA`.
    Wheel { axis: WheelAxis, notches: i32 },
}

impl InputEvent {
    pub fn describe(&self) -> String {
        match self {
            Self::MoveAbsolute { x, y } => format!("move({x},{y})"),
            Self::LeftDown => "left-down".to_string(),
            Self::LeftUp => "left-up".to_string(),
            Self::KeyDown { ch } => format!("key-down(U+{:04X})", u32::from(*ch)),
            Self::KeyUp { ch } => format!("key-up(U+{:04X})", u32::from(*ch)),
            Self::Wheel { axis, notches } => format!("wheel({axis:?},{notches})"),
        }
    }
}

/// Hardware-equivalent input injection.
pub trait InputSink {
    /// Injects one batch in order. A batch is the unit the settle delay is
    /// applied to.
    fn send(&mut self, events: &[InputEvent]) -> Result<(), InjectionError>;

    /// Current pointer position in screen pixels, if the backend can tell.
    fn pointer_position(&self) -> Option<(i32, i32)>;
}

/// Key-down/key-up pair for every code point of `text`.
pub fn unicode_key_events(text: &str) -> Vec<InputEvent> {
    text.chars()
        .flat_map(|ch| [InputEvent::KeyDown { ch }, InputEvent::KeyUp { ch }])
        .collect()
}

/// `abs(delta) / 100` notches per axis, vertical first. A delta below 100
/// produces no notches.
pub fn wheel_events(dx: f64, dy: f64) -> Vec<InputEvent> {
    let mut events = Vec::new();
    for (delta, axis) in [(dy, WheelAxis::Vertical), (dx, WheelAxis::Horizontal)] {
        let ticks = (delta.abs() as i64 / 100) as i32;
        if ticks == 0 {
            continue;
        }
        let direction = if delta > 0.0 { 1 } else { -1 };
        events.extend((0..ticks).map(|_| InputEvent::Wheel {
            axis,
            notches: direction,
        }));
    }
    events
}

#[cfg(feature = "native")]
pub use native::EnigoSink;

#[cfg(feature = "native")]
mod native {
    use enigo::{Axis, Button, Coordinate, Direction, Enigo, Key, Keyboard, Mouse, Settings};

    use super::{InputEvent, InputSink, WheelAxis};
    use crate::coords::CoordinateSpace;
    use crate::error::InjectionError;

    /// `enigo` speaks screen pixels, so device-absolute events are mapped
    /// back through the coordinate space the executor used.
    pub struct EnigoSink {
        enigo: Enigo,
        coords: CoordinateSpace,
    }

    impl EnigoSink {
        pub fn new(coords: CoordinateSpace) -> Result<Self, InjectionError> {
            let enigo = Enigo::new(&Settings::default())
                .map_err(|err| InjectionError::Unavailable(err.to_string()))?;
            Ok(Self { enigo, coords })
        }

        fn inject(&mut self, event: &InputEvent) -> Result<(), enigo::InputError> {
            match *event {
                InputEvent::MoveAbsolute { x, y } => {
                    let (px, py) = self.coords.from_device_absolute(x, y);
                    self.enigo.move_mouse(px, py, Coordinate::Abs)
                }
                InputEvent::LeftDown => self.enigo.button(Button::Left, Direction::Press),
                InputEvent::LeftUp => self.enigo.button(Button::Left, Direction::Release),
                InputEvent::KeyDown { ch } => self.enigo.key(Key::Unicode(ch), Direction::Press),
                InputEvent::KeyUp { ch } => self.enigo.key(Key::Unicode(ch), Direction::Release),
                // enigo counts positive vertical as "down".
                InputEvent::Wheel {
                    axis: WheelAxis::Vertical,
                    notches,
                } => self.enigo.scroll(-notches, Axis::Vertical),
                InputEvent::Wheel {
                    axis: WheelAxis::Horizontal,
                    notches,
                } => self.enigo.scroll(notches, Axis::Horizontal),
            }
        }
    }

    impl InputSink for EnigoSink {
        fn send(&mut self, events: &[InputEvent]) -> Result<(), InjectionError> {
            for event in events {
                self.inject(event)
                    .map_err(|err| InjectionError::Rejected {
                        event: event.describe(),
                        message: err.to_string(),
                    })?;
            }
            Ok(())
        }

        fn pointer_position(&self) -> Option<(i32, i32)> {
            self.enigo.location().ok()
        }
    }
}

/// Pointer position in screen pixels, falling back to the screen centre when
/// the sink cannot report one.
pub fn pointer_or_centre(sink: &dyn InputSink, coords: &CoordinateSpace) -> (i32, i32) {
    sink.pointer_position().unwrap_or((
        (coords.screen_w / 2) as i32,
        (coords.screen_h / 2) as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typing_emits_one_pair_per_code_point() {
        let events = unicode_key_events("aé😀");
        assert_eq!(events.len(), 6);
        assert_eq!(events[4], InputEvent::KeyDown { ch: '😀' });
        assert_eq!(events[5], InputEvent::KeyUp { ch: '😀' });
    }

    #[test]
    fn wheel_ticks_use_integer_division() {
        assert_eq!(wheel_events(0.0, -300.0).len(), 3);
        assert_eq!(wheel_events(0.0, 99.0), Vec::new());
        let mixed = wheel_events(250.0, 100.0);
        assert_eq!(
            mixed,
            vec![
                InputEvent::Wheel {
                    axis: WheelAxis::Vertical,
                    notches: 1
                },
                InputEvent::Wheel {
                    axis: WheelAxis::Horizontal,
                    notches: 1
                },
                InputEvent::Wheel {
                    axis: WheelAxis::Horizontal,
                    notches: 1
                },
            ]
        );
        assert!(wheel_events(0.0, -600.0)
            .iter()
            .all(|e| matches!(e, InputEvent::Wheel { notches: -1, .. })));
    }

    #[test]
    fn describe_is_readable() {
        assert_eq!(InputEvent::KeyDown { ch: 'A' }.describe(), "key-down(U+0041)");
        assert_eq!(InputEvent::MoveAbsolute { x: 1, y: 2 }.describe(), "move(1,2)");
    }
}
