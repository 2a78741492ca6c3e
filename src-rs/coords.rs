//! Normalized, screen-pixel and device-absolute coordinate systems.
//!
//! Normalized coordinates are resolution independent and span `[0, 1000]` on
//! each axis. Device-absolute coordinates are the fixed `0..=65535` range used
//! by absolute pointer injection.

use serde::{Deserialize, Serialize};

pub const NORM_MAX: f64 = 1000.0;
pub const DEVICE_ABS_MAX: i32 = 65_535;

pub fn in_normalized_range(value: f64) -> bool {
    value.is_finite() && (0.0..=NORM_MAX).contains(&value)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinateSpace {
    pub screen_w: u32,
    pub screen_h: u32,
}

impl CoordinateSpace {
    pub fn new(screen_w: u32, screen_h: u32) -> Self {
        Self {
            screen_w: screen_w.max(1),
            screen_h: screen_h.max(1),
        }
    }

    /// Normalized → screen pixel. Clamping here only guards against callers
    /// that skipped validation.
    pub fn to_screen(&self, nx: f64, ny: f64) -> (i32, i32) {
        (
            norm_axis_to_pixel(nx, self.screen_w),
            norm_axis_to_pixel(ny, self.screen_h),
        )
    }

    pub fn to_normalized(&self, px: i32, py: i32) -> (f64, f64) {
        (
            f64::from(px) * NORM_MAX / f64::from(self.screen_w),
            f64::from(py) * NORM_MAX / f64::from(self.screen_h),
        )
    }

    /// Normalized length → pixel length (no clamping to the last pixel).
    pub fn extent_to_pixels(&self, nw: f64, nh: f64) -> (i32, i32) {
        (
            (nw * f64::from(self.screen_w) / NORM_MAX).round() as i32,
            (nh * f64::from(self.screen_h) / NORM_MAX).round() as i32,
        )
    }

    pub fn to_device_absolute(&self, px: i32, py: i32) -> (i32, i32) {
        (
            pixel_axis_to_device(px, self.screen_w),
            pixel_axis_to_device(py, self.screen_h),
        )
    }

    pub fn from_device_absolute(&self, dx: i32, dy: i32) -> (i32, i32) {
        (
            device_axis_to_pixel(dx, self.screen_w),
            device_axis_to_pixel(dy, self.screen_h),
        )
    }

    /// Size of one screen pixel expressed in normalized units, per axis.
    pub fn rounding_unit(&self) -> (f64, f64) {
        (
            NORM_MAX / f64::from(self.screen_w),
            NORM_MAX / f64::from(self.screen_h),
        )
    }
}

fn norm_axis_to_pixel(n: f64, span: u32) -> i32 {
    let last = span.saturating_sub(1) as i32;
    if !n.is_finite() {
        return 0;
    }
    let px = (n * f64::from(span) / NORM_MAX).floor() as i64;
    px.clamp(0, i64::from(last)) as i32
}

fn pixel_axis_to_device(p: i32, span: u32) -> i32 {
    let denom = f64::from(span.saturating_sub(1).max(1));
    let v = (f64::from(p) * f64::from(DEVICE_ABS_MAX) / denom).round() as i64;
    v.clamp(0, i64::from(DEVICE_ABS_MAX)) as i32
}

fn device_axis_to_pixel(d: i32, span: u32) -> i32 {
    let last = span.saturating_sub(1);
    let v = (f64::from(d) * f64::from(last) / f64::from(DEVICE_ABS_MAX)).round() as i64;
    v.clamp(0, i64::from(last)) as i32
}

/// Which coordinate system a primitive's numbers are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Space {
    Normalized,
    Pixel,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
    pub space: Space,
}

impl Point {
    pub fn norm(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            space: Space::Normalized,
        }
    }

    pub fn px(x: i32, y: i32) -> Self {
        Self {
            x: f64::from(x),
            y: f64::from(y),
            space: Space::Pixel,
        }
    }

    pub fn resolve(&self, coords: &CoordinateSpace) -> (f64, f64) {
        match self.space {
            Space::Pixel => (self.x, self.y),
            Space::Normalized => {
                let (x, y) = coords.to_screen(self.x, self.y);
                (f64::from(x), f64::from(y))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub space: Space,
}

impl Region {
    pub fn norm(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
            space: Space::Normalized,
        }
    }

    pub fn px(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x: f64::from(x),
            y: f64::from(y),
            width: f64::from(width),
            height: f64::from(height),
            space: Space::Pixel,
        }
    }

    /// Resolves to `(x, y, w, h)` in screen pixels.
    pub fn resolve(&self, coords: &CoordinateSpace) -> (i32, i32, i32, i32) {
        match self.space {
            Space::Pixel => (
                self.x.round() as i32,
                self.y.round() as i32,
                self.width.round() as i32,
                self.height.round() as i32,
            ),
            Space::Normalized => {
                let (x, y) = coords.to_screen(self.x, self.y);
                let (w, h) = coords.extent_to_pixels(self.width, self.height);
                (x, y, w.max(1), h.max(1))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_round_trip_within_one_pixel_unit() {
        for (w, h) in [(1, 1), (7, 3), (1024, 576), (1920, 1080), (3840, 2160)] {
            let coords = CoordinateSpace::new(w, h);
            let (ux, uy) = coords.rounding_unit();
            for step in 0..=200 {
                let n = f64::from(step) * 5.0;
                let (px, py) = coords.to_screen(n, n);
                let (bx, by) = coords.to_normalized(px, py);
                assert!((n - bx).abs() <= ux + 1e-9, "{w}x{h} x: {n} -> {px} -> {bx}");
                assert!((n - by).abs() <= uy + 1e-9, "{w}x{h} y: {n} -> {py} -> {by}");
            }
        }
    }

    #[test]
    fn to_screen_clamps_to_last_pixel() {
        let coords = CoordinateSpace::new(1920, 1080);
        assert_eq!(coords.to_screen(0.0, 0.0), (0, 0));
        assert_eq!(coords.to_screen(1000.0, 1000.0), (1919, 1079));
        assert_eq!(coords.to_screen(500.0, 500.0), (960, 540));
        assert_eq!(coords.to_screen(-5.0, f64::NAN), (0, 0));
    }

    #[test]
    fn device_absolute_inverts_exactly() {
        let coords = CoordinateSpace::new(1366, 768);
        for px in [0, 1, 2, 500, 683, 1365] {
            let (dx, dy) = coords.to_device_absolute(px, px.min(767));
            assert_eq!(coords.from_device_absolute(dx, dy), (px, px.min(767)));
        }
        assert_eq!(coords.to_device_absolute(1365, 767), (65_535, 65_535));
        assert_eq!(coords.to_device_absolute(0, 0), (0, 0));
    }

    #[test]
    fn range_check_rejects_non_finite() {
        assert!(in_normalized_range(0.0));
        assert!(in_normalized_range(1000.0));
        assert!(!in_normalized_range(1000.5));
        assert!(!in_normalized_range(-0.1));
        assert!(!in_normalized_range(f64::INFINITY));
    }
}
