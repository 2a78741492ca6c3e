//! Turns validated decisions into input events and overlay feedback.

use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::action::{ActionDescriptor, Decision};
use crate::annotations::{Annotation, AnnotationStore};
use crate::config::TimingConfig;
use crate::coords::{CoordinateSpace, Point, Region};
use crate::error::{AgentError, InjectionError};
use crate::input::{pointer_or_centre, unicode_key_events, wheel_events, InputEvent, InputSink};
use crate::overlay::{OverlayPrimitive, OverlayStyle, OverlaySurface, LINE_THICKNESS};

/// Pointer positions on a drag path, endpoints included.
pub const DRAG_STEPS: usize = 14;
const HIGHLIGHT_THICKNESS: i32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimingPolicy {
    pub input_settle: Duration,
    pub drag_step: Duration,
    pub hover: Duration,
    pub post_action: Duration,
    pub scroll_settle: Duration,
}

impl From<&TimingConfig> for TimingPolicy {
    fn from(cfg: &TimingConfig) -> Self {
        Self {
            input_settle: Duration::from_millis(cfg.input_settle_ms),
            drag_step: Duration::from_millis(cfg.drag_step_ms),
            hover: Duration::from_millis(cfg.hover_ms),
            post_action: Duration::from_millis(cfg.post_action_ms),
            scroll_settle: Duration::from_millis(cfg.scroll_settle_ms),
        }
    }
}

impl Default for TimingPolicy {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

fn pause(duration: Duration) {
    if !duration.is_zero() {
        thread::sleep(duration);
    }
}

/// `DRAG_STEPS` device-absolute positions, `p_k = start + (end - start) * k / 13`.
pub fn drag_path(start: (i32, i32), end: (i32, i32)) -> Vec<(i32, i32)> {
    let last = (DRAG_STEPS - 1) as i64;
    let lerp = |a: i32, b: i32, k: i64| (i64::from(a) + (i64::from(b) - i64::from(a)) * k / last) as i32;
    (0..DRAG_STEPS as i64)
        .map(|k| (lerp(start.0, end.0, k), lerp(start.1, end.1, k)))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionOutcome {
    /// Line for the run log.
    pub log_message: String,
    /// Line the oracle sees in its recent history.
    pub history_message: String,
    pub success: bool,
    #[serde(rename = "post_delay_ms", serialize_with = "duration_ms")]
    pub post_delay: Duration,
    /// Normalized coordinates returned by `recall`.
    pub recalled: Option<(f64, f64)>,
    /// Set when an accepted annotation could not be written to disk.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persist_error: Option<String>,
    #[serde(skip)]
    pub overlay_generation: u64,
}

fn duration_ms<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

/// What the action-path layer shows for one execution.
enum PathViz {
    None,
    Pointer {
        from: (i32, i32),
        to: (i32, i32),
        cross_from: bool,
        cross_to: bool,
    },
    ScrollBorder,
    Marker((i32, i32)),
}

pub struct ActionExecutor {
    coords: CoordinateSpace,
    timing: TimingPolicy,
    sink: Box<dyn InputSink>,
}

impl ActionExecutor {
    pub fn new(coords: CoordinateSpace, timing: TimingPolicy, sink: Box<dyn InputSink>) -> Self {
        Self {
            coords,
            timing,
            sink,
        }
    }

    /// Sends one batch and waits the settle time.
    fn send(&mut self, events: &[InputEvent]) -> Result<(), InjectionError> {
        self.sink.send(events)?;
        pause(self.timing.input_settle);
        Ok(())
    }

    fn pointer_pixels(&self) -> (i32, i32) {
        pointer_or_centre(self.sink.as_ref(), &self.coords)
    }

    fn target(&self, nx: f64, ny: f64) -> ((i32, i32), (i32, i32)) {
        let px = self.coords.to_screen(nx, ny);
        (px, self.coords.to_device_absolute(px.0, px.1))
    }

    /// One more `LeftUp` after a failure with the button down. Returns the
    /// original error.
    fn release_after(&mut self, err: InjectionError) -> InjectionError {
        if let Err(release_err) = self.sink.send(&[InputEvent::LeftUp]) {
            warn!(error = %release_err, "release after failed injection also failed");
        }
        err
    }

    fn click(&mut self, at: (i32, i32)) -> Result<(), InjectionError> {
        self.send(&[InputEvent::MoveAbsolute { x: at.0, y: at.1 }])?;
        self.send(&[InputEvent::LeftDown])?;
        self.send(&[InputEvent::LeftUp])
            .map_err(|err| self.release_after(err))
    }

    fn drag(&mut self, from: (i32, i32), to: (i32, i32)) -> Result<(), InjectionError> {
        self.send(&[InputEvent::MoveAbsolute { x: from.0, y: from.1 }])?;
        self.send(&[InputEvent::LeftDown])?;
        for (x, y) in drag_path(from, to) {
            // Never leave the button held.
            if let Err(err) = self.sink.send(&[InputEvent::MoveAbsolute { x, y }]) {
                return Err(self.release_after(err));
            }
            pause(self.timing.drag_step);
        }
        self.send(&[InputEvent::LeftUp])
            .map_err(|err| self.release_after(err))
    }

    /// Executes `decision` and repaints the overlay so the next capture
    /// shows what happened.
    pub fn execute(
        &mut self,
        decision: &Decision,
        store: &mut AnnotationStore,
        overlay: &mut OverlaySurface,
    ) -> Result<ActionOutcome, AgentError> {
        let action = &decision.action;
        let tool = action.tool();
        let mut hud = hud_line(tool, &decision.justification);
        let mut highlight: Option<String> = None;
        let mut recalled = None;
        let mut persist_error = None;

        let (viz, log_message, history_message, post_delay) = match action {
            ActionDescriptor::Click { x, y } => {
                let from = self.pointer_pixels();
                let (px, dev) = self.target(*x, *y);
                self.click(dev)?;
                (
                    PathViz::Pointer {
                        from,
                        to: px,
                        cross_from: false,
                        cross_to: true,
                    },
                    format!("click norm({},{}) px({},{})", *x as i64, *y as i64, px.0, px.1),
                    format!("click at ({},{})", *x as i64, *y as i64),
                    self.timing.post_action,
                )
            }
            ActionDescriptor::Move { x, y } => {
                let from = self.pointer_pixels();
                let (px, dev) = self.target(*x, *y);
                self.send(&[InputEvent::MoveAbsolute { x: dev.0, y: dev.1 }])?;
                (
                    PathViz::Pointer {
                        from,
                        to: px,
                        cross_from: false,
                        cross_to: false,
                    },
                    format!("move norm({},{}) px({},{})", *x as i64, *y as i64, px.0, px.1),
                    format!("move at ({},{})", *x as i64, *y as i64),
                    self.timing.hover,
                )
            }
            ActionDescriptor::Drag { x1, y1, x2, y2 } => {
                let (p1, d1) = self.target(*x1, *y1);
                let (p2, d2) = self.target(*x2, *y2);
                self.drag(d1, d2)?;
                (
                    PathViz::Pointer {
                        from: p1,
                        to: p2,
                        cross_from: true,
                        cross_to: true,
                    },
                    format!(
                        "drag norm({},{})->({},{})",
                        *x1 as i64, *y1 as i64, *x2 as i64, *y2 as i64
                    ),
                    format!(
                        "Dragged ({},{}) to ({},{})",
                        *x1 as i64, *y1 as i64, *x2 as i64, *y2 as i64
                    ),
                    self.timing.post_action,
                )
            }
            ActionDescriptor::Type { text } => {
                let count = text.chars().count();
                self.send(&unicode_key_events(text))?;
                (
                    PathViz::None,
                    format!("typed {count} chars"),
                    format!("Typed {count} chars"),
                    self.timing.post_action,
                )
            }
            ActionDescriptor::Scroll { dx, dy } => {
                let events = wheel_events(*dx, *dy);
                if events.is_empty() {
                    debug!(dx, dy, "scroll delta below one notch; nothing injected");
                } else {
                    self.send(&events)?;
                }
                (
                    PathViz::ScrollBorder,
                    format!("scrolled dx={dx} dy={dy} ({} notches)", events.len()),
                    format!("Scrolled dx={} dy={}", *dx as i64, *dy as i64),
                    self.timing.scroll_settle,
                )
            }
            ActionDescriptor::Annotate {
                label,
                x,
                y,
                width,
                height,
                description,
                confidence,
            } => {
                persist_error = store.upsert(
                    label,
                    Annotation::new(*x, *y, *width, *height, description.clone())
                        .with_confidence(*confidence),
                )?;
                hud = hud_line(tool, description);
                highlight = Some(label.clone());
                (
                    PathViz::None,
                    format!("annotated {label} norm({},{})", *x as i64, *y as i64),
                    if persist_error.is_some() {
                        format!("Annotated {label} (not saved)")
                    } else {
                        format!("Annotated {label}")
                    },
                    self.timing.post_action,
                )
            }
            ActionDescriptor::Recall { label } => match store.get(label) {
                Some(found) => {
                    let point = (found.x, found.y);
                    recalled = Some(point);
                    highlight = Some(label.clone());
                    hud = hud_line(tool, label);
                    let px = self.coords.to_screen(point.0, point.1);
                    (
                        PathViz::Marker(px),
                        format!("recalled {label} norm({},{})", point.0 as i64, point.1 as i64),
                        format!("Recalled {label} at ({},{})", point.0 as i64, point.1 as i64),
                        self.timing.post_action,
                    )
                }
                None => (
                    PathViz::None,
                    format!("recall {label} failed"),
                    format!("Recall {label} failed"),
                    self.timing.post_action,
                ),
            },
            ActionDescriptor::Done => {
                hud = None;
                (PathViz::None, "done".to_string(), "Done".to_string(), Duration::ZERO)
            }
        };

        let primitives = self.scene(viz, highlight.as_deref(), store, overlay.style());
        let overlay_generation = overlay.present(primitives, hud);
        let success = !matches!(action, ActionDescriptor::Recall { .. }) || recalled.is_some();
        info!(tool, success, "{log_message}");

        Ok(ActionOutcome {
            log_message,
            history_message,
            success,
            post_delay,
            recalled,
            persist_error,
            overlay_generation,
        })
    }

    fn scene(
        &self,
        viz: PathViz,
        highlight: Option<&str>,
        store: &AnnotationStore,
        style: &OverlayStyle,
    ) -> Vec<OverlayPrimitive> {
        let mut primitives = annotation_primitives(store, style);
        if let Some(found) = highlight.and_then(|label| store.get(label)) {
            primitives.push(OverlayPrimitive::Rect {
                region: Region::norm(found.x, found.y, found.width, found.height),
                color: style.highlight,
                thickness: HIGHLIGHT_THICKNESS,
                label: None,
            });
        }
        match viz {
            PathViz::None => {}
            PathViz::Pointer {
                from,
                to,
                cross_from,
                cross_to,
            } => {
                primitives.push(OverlayPrimitive::Arrow {
                    from: Point::px(from.0, from.1),
                    to: Point::px(to.0, to.1),
                    color: style.path,
                    thickness: LINE_THICKNESS,
                    label: None,
                });
                let crosses = [(cross_from, from), (cross_to, to)];
                for (wanted, at) in crosses {
                    if wanted {
                        primitives.push(OverlayPrimitive::Cross {
                            at: Point::px(at.0, at.1),
                            color: style.marker,
                            label: None,
                        });
                    }
                }
            }
            PathViz::ScrollBorder => {
                let (w, h) = (self.coords.screen_w as i32, self.coords.screen_h as i32);
                primitives.push(OverlayPrimitive::Rect {
                    region: Region::px(2, 2, w - 6, h - 6),
                    color: style.marker,
                    thickness: LINE_THICKNESS,
                    label: None,
                });
            }
            PathViz::Marker(at) => primitives.push(OverlayPrimitive::Cross {
                at: Point::px(at.0, at.1),
                color: style.marker,
                label: None,
            }),
        }
        primitives
    }
}

/// Every stored annotation as a labelled box.
pub fn annotation_primitives(store: &AnnotationStore, style: &OverlayStyle) -> Vec<OverlayPrimitive> {
    store
        .iter()
        .map(|(label, ann)| OverlayPrimitive::Rect {
            region: Region::norm(ann.x, ann.y, ann.width, ann.height),
            color: style.annotation,
            thickness: LINE_THICKNESS,
            label: Some(ann.caption(label)),
        })
        .collect()
}

fn hud_line(tool: &str, justification: &str) -> Option<String> {
    let tool = tool.to_ascii_uppercase();
    let just = justification.trim();
    Some(if just.is_empty() {
        tool
    } else {
        format!("{tool}: {just}")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::parse_decision;
    use crate::overlay::HeadlessPresenter;
    use crate::test_support::{FailingSink, RecordingSink};

    const WAIT: Duration = Duration::from_secs(5);

    fn overlay(coords: CoordinateSpace) -> OverlaySurface {
        OverlaySurface::spawn(coords, OverlayStyle::default(), |_, _| {
            Box::new(HeadlessPresenter::new())
        })
        .unwrap()
    }

    fn decision(raw: &str) -> Decision {
        parse_decision(raw).unwrap()
    }

    #[test]
    fn drag_path_has_fixed_monotonic_steps() {
        let coords = CoordinateSpace::new(1920, 1080);
        let (sx, sy) = coords.to_screen(0.0, 0.0);
        let (ex, ey) = coords.to_screen(1000.0, 1000.0);
        let start = coords.to_device_absolute(sx, sy);
        let end = coords.to_device_absolute(ex, ey);
        let path = drag_path(start, end);
        assert_eq!(path.len(), 14);
        assert_eq!(path[0], start);
        assert_eq!(path[13], end);
        assert!(path.windows(2).all(|w| w[0].0 <= w[1].0 && w[0].1 <= w[1].1));
        assert_eq!(end, (65_535, 65_535));
    }

    #[test]
    fn drag_path_handles_reverse_direction() {
        let path = drag_path((65_535, 100), (0, 100));
        assert_eq!(path.first(), Some(&(65_535, 100)));
        assert_eq!(path.last(), Some(&(0, 100)));
        assert!(path.windows(2).all(|w| w[0].0 >= w[1].0));
    }

    #[test]
    fn click_moves_then_presses_and_releases() {
        let coords = CoordinateSpace::new(1000, 500);
        let sink = RecordingSink::new();
        let events = sink.events();
        let mut executor = ActionExecutor::new(coords, TimingPolicy::from(&TimingConfig::immediate()), Box::new(sink));
        let mut store = AnnotationStore::in_memory();
        let mut overlay = overlay(coords);

        let outcome = executor
            .execute(&decision(r#"{"tool":"click","x":500,"y":500,"justification":"ok"}"#), &mut store, &mut overlay)
            .unwrap();
        assert!(outcome.success);
        let (dx, dy) = coords.to_device_absolute(500, 250);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                InputEvent::MoveAbsolute { x: dx, y: dy },
                InputEvent::LeftDown,
                InputEvent::LeftUp
            ]
        );
        assert!(overlay.wait_painted(outcome.overlay_generation, WAIT));
        let buffer = overlay.get_buffer();
        assert_eq!(*buffer.get_pixel(520, 250), overlay.style().marker);
        assert_eq!(buffer.get_pixel(6, 6)[3], 255);
    }

    #[test]
    fn move_draws_arrow_from_previous_pointer() {
        let coords = CoordinateSpace::new(1000, 500);
        let sink = RecordingSink::new().with_pointer((100, 100));
        let mut executor = ActionExecutor::new(coords, TimingPolicy::from(&TimingConfig::immediate()), Box::new(sink));
        let mut store = AnnotationStore::in_memory();
        let mut overlay = overlay(coords);

        let outcome = executor
            .execute(&decision(r#"{"tool":"move","x":500,"y":500}"#), &mut store, &mut overlay)
            .unwrap();
        assert!(overlay.wait_painted(outcome.overlay_generation, WAIT));
        let buffer = overlay.get_buffer();
        assert_eq!(*buffer.get_pixel(300, 175), overlay.style().path);
        assert_eq!(buffer.get_pixel(900, 450)[3], 0);
    }

    #[test]
    fn move_waits_the_hover_time() {
        let coords = CoordinateSpace::new(1000, 500);
        let timing = TimingPolicy {
            hover: Duration::from_millis(750),
            ..TimingPolicy::from(&TimingConfig::immediate())
        };
        let mut executor = ActionExecutor::new(coords, timing, Box::new(RecordingSink::new()));
        let mut store = AnnotationStore::in_memory();
        let mut overlay = overlay(coords);

        let outcome = executor
            .execute(&decision(r#"{"tool":"move","x":10,"y":10}"#), &mut store, &mut overlay)
            .unwrap();
        assert_eq!(outcome.post_delay, Duration::from_millis(750));
    }

    #[test]
    fn click_retries_release_when_it_fails() {
        let coords = CoordinateSpace::new(1000, 500);
        let sink = FailingSink::failing_call(3);
        let events = sink.events();
        let mut executor = ActionExecutor::new(coords, TimingPolicy::from(&TimingConfig::immediate()), Box::new(sink));
        let mut store = AnnotationStore::in_memory();
        let mut overlay = overlay(coords);

        let result = executor.execute(&decision(r#"{"tool":"click","x":10,"y":10}"#), &mut store, &mut overlay);
        assert!(matches!(result, Err(AgentError::Injection(_))));
        let recorded = events.lock().unwrap();
        assert_eq!(recorded.len(), 3);
        assert_eq!(recorded[1], InputEvent::LeftDown);
        assert_eq!(recorded[2], InputEvent::LeftUp);
    }

    #[test]
    fn drag_emits_release_even_when_a_step_fails() {
        let coords = CoordinateSpace::new(800, 600);
        let sink = FailingSink::failing_call(4);
        let events = sink.events();
        let mut executor = ActionExecutor::new(coords, TimingPolicy::from(&TimingConfig::immediate()), Box::new(sink));
        let mut store = AnnotationStore::in_memory();
        let mut overlay = overlay(coords);

        let result = executor.execute(
            &decision(r#"{"tool":"drag","x1":100,"y1":100,"x2":900,"y2":900}"#),
            &mut store,
            &mut overlay,
        );
        assert!(matches!(result, Err(AgentError::Injection(_))));
        let recorded = events.lock().unwrap();
        assert_eq!(recorded.len(), 4);
        assert_eq!(recorded[1], InputEvent::LeftDown);
        assert_eq!(recorded.last(), Some(&InputEvent::LeftUp));
    }

    #[test]
    fn full_drag_sends_fourteen_moves_between_press_and_release() {
        let coords = CoordinateSpace::new(800, 600);
        let sink = RecordingSink::new();
        let events = sink.events();
        let mut executor = ActionExecutor::new(coords, TimingPolicy::from(&TimingConfig::immediate()), Box::new(sink));
        let mut store = AnnotationStore::in_memory();
        let mut overlay = overlay(coords);

        executor
            .execute(&decision(r#"{"tool":"drag","x1":0,"y1":0,"x2":1000,"y2":1000}"#), &mut store, &mut overlay)
            .unwrap();
        let recorded = events.lock().unwrap();
        let down = recorded.iter().position(|e| *e == InputEvent::LeftDown).unwrap();
        let up = recorded.iter().position(|e| *e == InputEvent::LeftUp).unwrap();
        assert_eq!(up - down - 1, 14);
        assert_eq!(recorded[up - 1], InputEvent::MoveAbsolute { x: 65_535, y: 65_535 });
    }

    #[test]
    fn type_and_scroll_emit_expected_events() {
        let coords = CoordinateSpace::new(640, 480);
        let sink = RecordingSink::new();
        let events = sink.events();
        let mut executor = ActionExecutor::new(coords, TimingPolicy::from(&TimingConfig::immediate()), Box::new(sink));
        let mut store = AnnotationStore::in_memory();
        let mut overlay = overlay(coords);

        executor
            .execute(&decision(r#"{"tool":"type","text":"hé"}"#), &mut store, &mut overlay)
            .unwrap();
        assert_eq!(events.lock().unwrap().len(), 4);

        events.lock().unwrap().clear();
        let outcome = executor
            .execute(&decision(r#"{"tool":"scroll","dy":-350}"#), &mut store, &mut overlay)
            .unwrap();
        assert_eq!(events.lock().unwrap().len(), 3);
        assert_eq!(outcome.history_message, "Scrolled dx=0 dy=-350");
    }

    #[test]
    fn annotate_then_recall_round_trips_through_store() {
        let coords = CoordinateSpace::new(1000, 1000);
        let mut executor = ActionExecutor::new(coords, TimingPolicy::from(&TimingConfig::immediate()), Box::new(RecordingSink::new()));
        let mut store = AnnotationStore::in_memory();
        let mut overlay = overlay(coords);

        executor
            .execute(
                &decision(r#"{"tool":"annotate","label":"ok","x":400,"y":300,"width":50,"height":20,"description":"OK button"}"#),
                &mut store,
                &mut overlay,
            )
            .unwrap();
        assert!(store.contains("ok"));

        let outcome = executor
            .execute(&decision(r#"{"tool":"recall","label":"ok"}"#), &mut store, &mut overlay)
            .unwrap();
        assert_eq!(outcome.recalled, Some((400.0, 300.0)));
        assert!(overlay.wait_painted(outcome.overlay_generation, WAIT));
        let buffer = overlay.get_buffer();
        assert_eq!(*buffer.get_pixel(447, 310), overlay.style().highlight);
        assert_eq!(buffer.get_pixel(420, 280)[3], 255);
    }

    #[test]
    fn unsaved_annotation_is_reported_in_outcome() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("labels");
        let mut store = AnnotationStore::load(&dir.join("annotations.json")).unwrap();
        std::fs::write(&dir, "file in the way").unwrap();
        let coords = CoordinateSpace::new(1000, 1000);
        let mut executor = ActionExecutor::new(coords, TimingPolicy::from(&TimingConfig::immediate()), Box::new(RecordingSink::new()));
        let mut overlay = overlay(coords);

        let outcome = executor
            .execute(
                &decision(r#"{"tool":"annotate","label":"ok","x":400,"y":300,"width":50,"height":20}"#),
                &mut store,
                &mut overlay,
            )
            .unwrap();
        assert!(outcome.success);
        assert!(outcome.persist_error.is_some());
        assert_eq!(outcome.history_message, "Annotated ok (not saved)");
        let json = serde_json::to_value(&outcome).unwrap();
        assert!(json["persist_error"].is_string());
    }
}
