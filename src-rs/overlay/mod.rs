//! Always-on-top annotation layer.
//!
//! The overlay runs on its own thread: callers send whole scenes over a
//! channel, the thread repaints from a clean transparent buffer, hands the
//! result to its presenter and publishes it. Readers only ever see completed
//! repaints.

pub mod window;

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Result};
use image::{Rgba, RgbaImage};
use tracing::{debug, warn};

use crate::config::OverlayConfig;
use crate::coords::{CoordinateSpace, Point, Region};
use crate::raster::{
    draw_arrow, draw_bitmap_text, draw_cross, draw_rect_outline, draw_thick_line, fill_rect,
    force_opaque, parse_color, text_extent,
};

pub use window::{platform_presenter, HeadlessPresenter, Presenter};

pub const CROSS_HALF: i32 = 30;
pub const LINE_THICKNESS: i32 = 3;
pub const ARROW_HEAD: f64 = 18.0;
pub const HUD_MIN_WIDTH: i32 = 220;
const LABEL_TILE_HEIGHT: i32 = 20;
const LABEL_TILE_OFFSET: i32 = 22;
const LABEL_MIN_WIDTH: i32 = 140;
const LABEL_MAX_WIDTH: i32 = 520;
const PUMP_INTERVAL: Duration = Duration::from_millis(16);

pub const BLACK: Rgba<u8> = Rgba([0, 0, 0, 255]);
pub const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);

#[derive(Debug, Clone, PartialEq)]
pub enum OverlayPrimitive {
    Rect {
        region: Region,
        color: Rgba<u8>,
        thickness: i32,
        label: Option<String>,
    },
    Line {
        from: Point,
        to: Point,
        color: Rgba<u8>,
        thickness: i32,
        label: Option<String>,
    },
    Arrow {
        from: Point,
        to: Point,
        color: Rgba<u8>,
        thickness: i32,
        label: Option<String>,
    },
    Cross {
        at: Point,
        color: Rgba<u8>,
        label: Option<String>,
    },
    FilledRegion {
        region: Region,
        color: Rgba<u8>,
        label: Option<String>,
    },
    Text {
        at: Point,
        text: String,
        color: Rgba<u8>,
        label: Option<String>,
    },
}

impl OverlayPrimitive {
    pub fn label(&self) -> Option<&str> {
        match self {
            Self::Rect { label, .. }
            | Self::Line { label, .. }
            | Self::Arrow { label, .. }
            | Self::Cross { label, .. }
            | Self::FilledRegion { label, .. }
            | Self::Text { label, .. } => label.as_deref(),
        }
    }
}

/// Everything one repaint draws.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OverlayScene {
    pub primitives: Vec<OverlayPrimitive>,
    pub hud: Option<String>,
}

/// Colors and HUD limits resolved from config.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayStyle {
    pub hud_enabled: bool,
    pub hud_max_chars: usize,
    pub hud_margin: i32,
    pub hud_max_width: i32,
    pub glyph_scale: u32,
    pub label_max_chars: usize,
    pub topmost_pulses: u32,
    pub topmost_pause: Duration,
    pub paint_timeout: Duration,
    pub annotation: Rgba<u8>,
    pub highlight: Rgba<u8>,
    pub path: Rgba<u8>,
    pub marker: Rgba<u8>,
}

impl OverlayStyle {
    pub fn from_config(cfg: &OverlayConfig) -> Result<Self> {
        let color = |name: &str, raw: &str| {
            parse_color(raw).ok_or_else(|| anyhow!("overlay.{name} is not a color: {raw}"))
        };
        Ok(Self {
            hud_enabled: cfg.hud_enabled,
            hud_max_chars: cfg.hud_max_chars,
            hud_margin: cfg.hud_margin,
            hud_max_width: cfg.hud_max_width,
            glyph_scale: cfg.glyph_scale.max(1),
            label_max_chars: cfg.label_max_chars,
            topmost_pulses: cfg.topmost_pulses,
            topmost_pause: Duration::from_millis(cfg.topmost_pause_ms),
            paint_timeout: Duration::from_millis(cfg.paint_timeout_ms),
            annotation: color("annotation_color", &cfg.annotation_color)?,
            highlight: color("highlight_color", &cfg.highlight_color)?,
            path: color("path_color", &cfg.path_color)?,
            marker: color("marker_color", &cfg.marker_color)?,
        })
    }
}

impl Default for OverlayStyle {
    fn default() -> Self {
        Self {
            hud_enabled: true,
            hud_max_chars: 180,
            hud_margin: 6,
            hud_max_width: 960,
            glyph_scale: 1,
            label_max_chars: 120,
            topmost_pulses: 2,
            topmost_pause: Duration::from_millis(30),
            paint_timeout: Duration::from_millis(500),
            annotation: Rgba([255, 255, 0, 255]),
            highlight: Rgba([255, 0, 255, 255]),
            path: Rgba([0, 255, 0, 255]),
            marker: Rgba([255, 0, 0, 255]),
        }
    }
}

/// Collapses whitespace runs and truncates to `max_chars` characters.
pub fn hud_text(raw: &str, max_chars: usize) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect()
}

fn truncate_chars(raw: &str, max_chars: usize) -> String {
    raw.chars().take(max_chars).collect()
}

/// Black tile with light text, forced fully opaque.
fn draw_tile(img: &mut RgbaImage, x: i32, y: i32, w: i32, h: i32, text: &str, scale: u32) {
    fill_rect(img, x, y, x + w, y + h, BLACK);
    let (_, th) = text_extent(text, scale);
    draw_bitmap_text(img, x + 6, y + (h - th) / 2, text, WHITE, scale);
    force_opaque(img, x, y, x + w, y + h);
}

fn draw_label_tile(img: &mut RgbaImage, x: i32, y: i32, label: &str, style: &OverlayStyle) {
    let text = truncate_chars(label, style.label_max_chars);
    if text.is_empty() {
        return;
    }
    let (tw, _) = text_extent(&text, style.glyph_scale);
    let by = (y - LABEL_TILE_OFFSET).max(0);
    let bw = (tw + 12)
        .clamp(LABEL_MIN_WIDTH, LABEL_MAX_WIDTH)
        .min(img.width() as i32 - x);
    if bw <= 0 {
        return;
    }
    draw_tile(img, x, by, bw, LABEL_TILE_HEIGHT, &text, style.glyph_scale);
}

fn draw_hud(img: &mut RgbaImage, text: &str, style: &OverlayStyle) {
    let text = hud_text(text, style.hud_max_chars);
    if text.is_empty() {
        return;
    }
    let margin = style.hud_margin;
    let (tw, th) = text_extent(&text, style.glyph_scale);
    let bw = (img.width() as i32 - 2 * margin).min(style.hud_max_width.min((tw + 16).max(HUD_MIN_WIDTH)));
    let bh = th + 16;
    if bw <= 0 {
        return;
    }
    fill_rect(img, margin, margin, margin + bw, margin + bh, BLACK);
    draw_bitmap_text(img, margin + 8, margin + (bh - th) / 2, &text, WHITE, style.glyph_scale);
    force_opaque(img, margin, margin, margin + bw, margin + bh);
}

fn draw_primitive(
    img: &mut RgbaImage,
    primitive: &OverlayPrimitive,
    coords: &CoordinateSpace,
    style: &OverlayStyle,
) {
    let anchor = match primitive {
        OverlayPrimitive::Rect {
            region,
            color,
            thickness,
            ..
        } => {
            let (x, y, w, h) = region.resolve(coords);
            draw_rect_outline(img, x, y, w, h, *color, *thickness);
            (x, y)
        }
        OverlayPrimitive::FilledRegion { region, color, .. } => {
            let (x, y, w, h) = region.resolve(coords);
            fill_rect(img, x, y, x + w, y + h, *color);
            (x, y)
        }
        OverlayPrimitive::Line {
            from,
            to,
            color,
            thickness,
            ..
        } => {
            let (a, b) = (from.resolve(coords), to.resolve(coords));
            draw_thick_line(img, a, b, *color, f64::from(*thickness));
            (b.0 as i32, b.1 as i32)
        }
        OverlayPrimitive::Arrow {
            from,
            to,
            color,
            thickness,
            ..
        } => {
            let (a, b) = (from.resolve(coords), to.resolve(coords));
            draw_arrow(img, a, b, *color, f64::from(*thickness), ARROW_HEAD);
            (b.0 as i32, b.1 as i32)
        }
        OverlayPrimitive::Cross { at, color, .. } => {
            let p = at.resolve(coords);
            draw_cross(img, p, CROSS_HALF, LINE_THICKNESS, *color);
            (p.0 as i32 - CROSS_HALF, p.1 as i32 - CROSS_HALF)
        }
        OverlayPrimitive::Text {
            at, text, color, ..
        } => {
            let (x, y) = at.resolve(coords);
            draw_bitmap_text(img, x as i32, y as i32, text, *color, style.glyph_scale);
            (x as i32, y as i32)
        }
    };
    if let Some(label) = primitive.label() {
        draw_label_tile(img, anchor.0, anchor.1, label, style);
    }
}

/// Renders a scene into a fresh transparent buffer at native screen size.
pub fn render_scene(scene: &OverlayScene, coords: &CoordinateSpace, style: &OverlayStyle) -> RgbaImage {
    let mut img = RgbaImage::from_pixel(coords.screen_w, coords.screen_h, Rgba([0, 0, 0, 0]));
    for primitive in &scene.primitives {
        draw_primitive(&mut img, primitive, coords, style);
    }
    if style.hud_enabled {
        if let Some(hud) = scene.hud.as_deref() {
            draw_hud(&mut img, hud, style);
        }
    }
    img
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverlayState {
    Hidden,
    VisibleTransparent,
    Repainting,
}

enum OverlayCommand {
    Show,
    Paint { scene: OverlayScene, generation: u64 },
    Raise { pulses: u32, pause: Duration },
    Shutdown,
}

struct Published {
    generation: u64,
    buffer: Arc<RgbaImage>,
}

struct Handoff {
    slot: Mutex<Published>,
    painted: Condvar,
    state: Mutex<OverlayState>,
}

impl Handoff {
    fn set_state(&self, state: OverlayState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    fn publish(&self, generation: u64, buffer: RgbaImage) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.generation = generation;
        slot.buffer = Arc::new(buffer);
        self.painted.notify_all();
    }
}

pub struct OverlaySurface {
    tx: Sender<OverlayCommand>,
    handoff: Arc<Handoff>,
    scene: OverlayScene,
    next_generation: u64,
    coords: CoordinateSpace,
    style: OverlayStyle,
    thread: Option<JoinHandle<()>>,
}

impl OverlaySurface {
    /// Starts the overlay thread. `make_presenter` runs on that thread so the
    /// window belongs to it.
    pub fn spawn<F>(coords: CoordinateSpace, style: OverlayStyle, make_presenter: F) -> Result<Self>
    where
        F: FnOnce(u32, u32) -> Box<dyn Presenter> + Send + 'static,
    {
        let (tx, rx) = channel::<OverlayCommand>();
        let handoff = Arc::new(Handoff {
            slot: Mutex::new(Published {
                generation: 0,
                buffer: Arc::new(RgbaImage::from_pixel(
                    coords.screen_w,
                    coords.screen_h,
                    Rgba([0, 0, 0, 0]),
                )),
            }),
            painted: Condvar::new(),
            state: Mutex::new(OverlayState::Hidden),
        });

        let thread_handoff = Arc::clone(&handoff);
        let thread_style = style.clone();
        let thread = thread::Builder::new()
            .name("overlay".to_string())
            .spawn(move || {
                let handoff = thread_handoff;
                let mut presenter = make_presenter(coords.screen_w, coords.screen_h);
                let mut visible = false;
                loop {
                    presenter.pump();
                    match rx.recv_timeout(PUMP_INTERVAL) {
                        Ok(OverlayCommand::Show) => {
                            presenter.show();
                            visible = true;
                            handoff.set_state(OverlayState::VisibleTransparent);
                        }
                        Ok(OverlayCommand::Paint { scene, generation }) => {
                            if visible {
                                handoff.set_state(OverlayState::Repainting);
                            }
                            let buffer = render_scene(&scene, &coords, &thread_style);
                            presenter.present(&buffer);
                            if visible {
                                handoff.set_state(OverlayState::VisibleTransparent);
                            }
                            handoff.publish(generation, buffer);
                            debug!(generation, primitives = scene.primitives.len(), "overlay repainted");
                        }
                        Ok(OverlayCommand::Raise { pulses, pause }) => {
                            for pulse in 0..pulses {
                                presenter.raise();
                                if pulse + 1 < pulses && !pause.is_zero() {
                                    thread::sleep(pause);
                                }
                            }
                        }
                        Ok(OverlayCommand::Shutdown)
                        | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => continue,
                    }
                }
                presenter.close();
                handoff.set_state(OverlayState::Hidden);
            })
            .map_err(|err| anyhow!("failed to spawn overlay thread: {err}"))?;

        Ok(Self {
            tx,
            handoff,
            scene: OverlayScene::default(),
            next_generation: 1,
            coords,
            style,
            thread: Some(thread),
        })
    }

    pub fn coords(&self) -> CoordinateSpace {
        self.coords
    }

    pub fn style(&self) -> &OverlayStyle {
        &self.style
    }

    fn post(&self, command: OverlayCommand) {
        if self.tx.send(command).is_err() {
            warn!("overlay thread is gone; command dropped");
        }
    }

    fn request_paint(&mut self) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.post(OverlayCommand::Paint {
            scene: self.scene.clone(),
            generation,
        });
        generation
    }

    pub fn show(&self) {
        self.post(OverlayCommand::Show);
    }

    /// Replaces the full primitive set. Returns the repaint generation.
    pub fn set_primitives(&mut self, primitives: Vec<OverlayPrimitive>) -> u64 {
        self.scene.primitives = primitives;
        self.request_paint()
    }

    /// Replaces the HUD line. Returns the repaint generation.
    pub fn render_hud(&mut self, text: &str) -> u64 {
        self.scene.hud = Some(text.to_string());
        self.request_paint()
    }

    /// Primitives and HUD in a single repaint.
    pub fn present(&mut self, primitives: Vec<OverlayPrimitive>, hud: Option<String>) -> u64 {
        self.scene = OverlayScene { primitives, hud };
        self.request_paint()
    }

    /// Most recently completed repaint.
    pub fn get_buffer(&self) -> Arc<RgbaImage> {
        let slot = self.handoff.slot.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&slot.buffer)
    }

    /// Blocks until repaint `generation` (or a later one) is published.
    pub fn wait_painted(&self, generation: u64, timeout: Duration) -> bool {
        let slot = self.handoff.slot.lock().unwrap_or_else(PoisonError::into_inner);
        let (slot, _) = self
            .handoff
            .painted
            .wait_timeout_while(slot, timeout, |p| p.generation < generation)
            .unwrap_or_else(PoisonError::into_inner);
        slot.generation >= generation
    }

    /// Waits for the latest requested repaint using the configured timeout.
    pub fn wait_latest(&self) -> bool {
        let latest = self.next_generation - 1;
        let done = self.wait_painted(latest, self.style.paint_timeout);
        if !done {
            warn!(generation = latest, "overlay repaint did not complete in time");
        }
        done
    }

    pub fn assert_topmost(&self) {
        self.post(OverlayCommand::Raise {
            pulses: self.style.topmost_pulses,
            pause: self.style.topmost_pause,
        });
    }

    pub fn state(&self) -> OverlayState {
        *self
            .handoff
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        self.post(OverlayCommand::Shutdown);
        if thread.join().is_err() {
            warn!("overlay thread panicked");
        }
    }
}

impl Drop for OverlaySurface {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::CountingPresenter;

    const WAIT: Duration = Duration::from_secs(5);

    fn surface(w: u32, h: u32) -> OverlaySurface {
        OverlaySurface::spawn(CoordinateSpace::new(w, h), OverlayStyle::default(), |_, _| {
            Box::new(HeadlessPresenter::new())
        })
        .unwrap()
    }

    fn red_rect(region: Region) -> OverlayPrimitive {
        OverlayPrimitive::Rect {
            region,
            color: Rgba([255, 0, 0, 255]),
            thickness: 3,
            label: None,
        }
    }

    #[test]
    fn hud_text_collapses_whitespace_and_truncates() {
        assert_eq!(hud_text("CLICK:  open\n\tthe   menu ", 180), "CLICK: open the menu");
        let long = "x".repeat(500);
        assert_eq!(hud_text(&long, 180).chars().count(), 180);
        assert_eq!(hud_text("ééééé", 3), "ééé");
    }

    #[test]
    fn hud_tile_is_opaque_at_top_left() {
        let coords = CoordinateSpace::new(400, 200);
        let scene = OverlayScene {
            primitives: Vec::new(),
            hud: Some("CLICK: submit".to_string()),
        };
        let img = render_scene(&scene, &coords, &OverlayStyle::default());
        assert_eq!(img.get_pixel(6, 6)[3], 255);
        assert_eq!(img.get_pixel(6 + 219, 6 + 23)[3], 255);
        assert_eq!(img.get_pixel(6 + 220, 6)[3], 0);
        assert_eq!(img.get_pixel(5, 5)[3], 0);
        assert_eq!(img.get_pixel(6, 6 + 24)[3], 0);
    }

    #[test]
    fn hud_width_is_capped_by_screen() {
        let coords = CoordinateSpace::new(100, 60);
        let scene = OverlayScene {
            primitives: Vec::new(),
            hud: Some("TYPE: hello".to_string()),
        };
        let img = render_scene(&scene, &coords, &OverlayStyle::default());
        assert_eq!(img.get_pixel(93, 10)[3], 255);
        assert_eq!(img.get_pixel(94, 10)[3], 0);
    }

    #[test]
    fn labels_get_a_tile_above_the_box() {
        let coords = CoordinateSpace::new(400, 300);
        let scene = OverlayScene {
            primitives: vec![OverlayPrimitive::Rect {
                region: Region::px(50, 100, 80, 40),
                color: Rgba([255, 255, 0, 255]),
                thickness: 3,
                label: Some("save: Save button".to_string()),
            }],
            hud: None,
        };
        let img = render_scene(&scene, &coords, &OverlayStyle::default());
        assert_eq!(*img.get_pixel(50, 78), BLACK);
        assert_eq!(*img.get_pixel(50, 100), Rgba([255, 255, 0, 255]));
        assert_eq!(img.get_pixel(50 + 148, 80)[3], 0);
    }

    #[test]
    fn repaint_replaces_previous_primitives() {
        let mut overlay = surface(200, 100);
        overlay.show();
        let first = overlay.set_primitives(vec![red_rect(Region::px(10, 10, 20, 20))]);
        assert!(overlay.wait_painted(first, WAIT));
        assert_eq!(overlay.get_buffer().get_pixel(10, 10)[3], 255);

        let second = overlay.set_primitives(vec![red_rect(Region::px(120, 50, 20, 20))]);
        assert!(overlay.wait_painted(second, WAIT));
        let buffer = overlay.get_buffer();
        assert_eq!(buffer.get_pixel(10, 10)[3], 0);
        assert_eq!(buffer.get_pixel(120, 50)[3], 255);
        assert_eq!(buffer.dimensions(), (200, 100));
    }

    #[test]
    fn assert_topmost_raises_once_per_pulse() {
        let presenter = CountingPresenter::new();
        let counter = presenter.clone();
        let style = OverlayStyle {
            topmost_pulses: 3,
            topmost_pause: Duration::ZERO,
            ..OverlayStyle::default()
        };
        let mut overlay = OverlaySurface::spawn(CoordinateSpace::new(32, 32), style, move |_, _| {
            Box::new(presenter)
        })
        .unwrap();

        overlay.assert_topmost();
        let generation = overlay.render_hud("CLICK");
        assert!(overlay.wait_painted(generation, WAIT));
        assert_eq!(counter.raises(), 3);

        overlay.assert_topmost();
        let generation = overlay.render_hud("MOVE");
        assert!(overlay.wait_painted(generation, WAIT));
        assert_eq!(counter.raises(), 6);
    }

    #[test]
    fn wait_latest_reports_a_repaint_that_never_lands() {
        let style = OverlayStyle {
            paint_timeout: Duration::from_millis(50),
            ..OverlayStyle::default()
        };
        let mut overlay = OverlaySurface::spawn(CoordinateSpace::new(32, 32), style, |_, _| {
            Box::new(HeadlessPresenter::new())
        })
        .unwrap();
        overlay.render_hud("CLICK");
        assert!(overlay.wait_latest());

        overlay.shutdown();
        overlay.render_hud("MOVE");
        assert!(!overlay.wait_latest());
    }

    #[test]
    fn state_follows_show_and_shutdown() {
        let mut overlay = surface(32, 32);
        assert_eq!(overlay.state(), OverlayState::Hidden);
        overlay.show();
        let generation = overlay.render_hud("MOVE: hover");
        assert!(overlay.wait_painted(generation, WAIT));
        assert_eq!(overlay.state(), OverlayState::VisibleTransparent);
        overlay.shutdown();
        assert_eq!(overlay.state(), OverlayState::Hidden);
    }

    #[test]
    fn normalized_primitives_resolve_against_screen() {
        let coords = CoordinateSpace::new(1000, 500);
        let scene = OverlayScene {
            primitives: vec![OverlayPrimitive::FilledRegion {
                region: Region::norm(500.0, 500.0, 10.0, 10.0),
                color: Rgba([0, 0, 255, 128]),
                label: None,
            }],
            hud: None,
        };
        let img = render_scene(&scene, &coords, &OverlayStyle::default());
        assert_eq!(*img.get_pixel(502, 251), Rgba([0, 0, 255, 128]));
        assert_eq!(img.get_pixel(499, 250)[3], 0);
    }
}
