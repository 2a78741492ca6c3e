//! Software rasterization into RGBA buffers.
//!
//! All routines clip to the image and composite with straight-alpha
//! source-over, so they are safe on both opaque captures and the transparent
//! overlay buffer.

use std::f64::consts::PI;

use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{Rgba, RgbaImage};

pub const GLYPH_PX: u32 = 8;

pub fn parse_color(raw: &str) -> Option<Rgba<u8>> {
    let s = raw.trim();
    let hex = s.strip_prefix('#')?;
    let channel = |i: usize| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok();
    match hex.len() {
        6 => Some(Rgba([channel(0)?, channel(2)?, channel(4)?, 255])),
        8 => Some(Rgba([channel(0)?, channel(2)?, channel(4)?, channel(6)?])),
        _ => None,
    }
}

pub fn blend_over(dst: Rgba<u8>, src: Rgba<u8>) -> Rgba<u8> {
    let sa = f64::from(src[3]) / 255.0;
    if sa <= 0.0 {
        return dst;
    }
    if src[3] == 255 {
        return src;
    }
    let da = f64::from(dst[3]) / 255.0;
    let out_a = sa + da * (1.0 - sa);
    let channel = |i: usize| {
        ((f64::from(src[i]) * sa + f64::from(dst[i]) * da * (1.0 - sa)) / out_a)
            .round()
            .clamp(0.0, 255.0) as u8
    };
    Rgba([
        channel(0),
        channel(1),
        channel(2),
        (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}

fn plot(img: &mut RgbaImage, x: i32, y: i32, color: Rgba<u8>) {
    if x < 0 || y < 0 || x >= img.width() as i32 || y >= img.height() as i32 {
        return;
    }
    let dst = *img.get_pixel(x as u32, y as u32);
    img.put_pixel(x as u32, y as u32, blend_over(dst, color));
}

fn clamp_span(lo: i32, hi: i32, len: u32) -> Option<(i32, i32)> {
    if len == 0 {
        return None;
    }
    let lo = lo.max(0);
    let hi = hi.min(len as i32 - 1);
    (lo <= hi).then_some((lo, hi))
}

/// Fills the half-open rectangle `[x0, x1) × [y0, y1)`.
pub fn fill_rect(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32, color: Rgba<u8>) {
    let Some((min_x, max_x)) = clamp_span(x0.min(x1), x0.max(x1) - 1, img.width()) else {
        return;
    };
    let Some((min_y, max_y)) = clamp_span(y0.min(y1), y0.max(y1) - 1, img.height()) else {
        return;
    };
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            plot(img, x, y, color);
        }
    }
}

/// Sets alpha to 255 inside `[x0, x1) × [y0, y1)` without touching RGB.
pub fn force_opaque(img: &mut RgbaImage, x0: i32, y0: i32, x1: i32, y1: i32) {
    let Some((min_x, max_x)) = clamp_span(x0.min(x1), x0.max(x1) - 1, img.width()) else {
        return;
    };
    let Some((min_y, max_y)) = clamp_span(y0.min(y1), y0.max(y1) - 1, img.height()) else {
        return;
    };
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            img.get_pixel_mut(x as u32, y as u32).0[3] = 255;
        }
    }
}

/// Outline whose stroke grows inward from `(x, y, w, h)` by `thickness`.
pub fn draw_rect_outline(
    img: &mut RgbaImage,
    x: i32,
    y: i32,
    w: i32,
    h: i32,
    color: Rgba<u8>,
    thickness: i32,
) {
    if w <= 0 || h <= 0 {
        return;
    }
    let t = thickness.max(1).min(w.min(h));
    let (x1, y1) = (x + w, y + h);
    fill_rect(img, x, y, x1, y + t, color);
    fill_rect(img, x, y1 - t, x1, y1, color);
    fill_rect(img, x, y + t, x + t, y1 - t, color);
    fill_rect(img, x1 - t, y + t, x1, y1 - t, color);
}

pub fn draw_disc(img: &mut RgbaImage, cx: f64, cy: f64, radius: f64, color: Rgba<u8>) {
    if radius <= 0.1 {
        plot(img, cx.round() as i32, cy.round() as i32, color);
        return;
    }
    let Some((min_x, max_x)) = clamp_span(
        (cx - radius).floor() as i32,
        (cx + radius).ceil() as i32,
        img.width(),
    ) else {
        return;
    };
    let Some((min_y, max_y)) = clamp_span(
        (cy - radius).floor() as i32,
        (cy + radius).ceil() as i32,
        img.height(),
    ) else {
        return;
    };
    let r2 = radius * radius;
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let dx = f64::from(x) - cx;
            let dy = f64::from(y) - cy;
            if dx * dx + dy * dy <= r2 {
                let dst = *img.get_pixel(x as u32, y as u32);
                // Overlapping discs along a stroke must not accumulate alpha.
                if dst != color {
                    img.put_pixel(x as u32, y as u32, blend_over(dst, color));
                }
            }
        }
    }
}

pub fn draw_thick_line(
    img: &mut RgbaImage,
    from: (f64, f64),
    to: (f64, f64),
    color: Rgba<u8>,
    width: f64,
) {
    let dx = to.0 - from.0;
    let dy = to.1 - from.1;
    let distance = (dx * dx + dy * dy).sqrt();
    let steps = distance.max(1.0).ceil() as i32;
    let radius = (width.max(1.0) / 2.0).max(0.6);
    for step in 0..=steps {
        let t = f64::from(step) / f64::from(steps.max(1));
        draw_disc(img, from.0 + dx * t, from.1 + dy * t, radius, color);
    }
}

fn triangle_area(a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> f64 {
    ((a.0 * (b.1 - c.1) + b.0 * (c.1 - a.1) + c.0 * (a.1 - b.1)).abs()) / 2.0
}

fn point_in_triangle(p: (f64, f64), a: (f64, f64), b: (f64, f64), c: (f64, f64)) -> bool {
    let total = triangle_area(a, b, c);
    if total <= f64::EPSILON {
        return false;
    }
    let sum = triangle_area(p, b, c) + triangle_area(a, p, c) + triangle_area(a, b, p);
    (sum - total).abs() <= 0.8
}

pub fn fill_triangle(
    img: &mut RgbaImage,
    a: (f64, f64),
    b: (f64, f64),
    c: (f64, f64),
    color: Rgba<u8>,
) {
    let Some((min_x, max_x)) = clamp_span(
        a.0.min(b.0).min(c.0).floor() as i32,
        a.0.max(b.0).max(c.0).ceil() as i32,
        img.width(),
    ) else {
        return;
    };
    let Some((min_y, max_y)) = clamp_span(
        a.1.min(b.1).min(c.1).floor() as i32,
        a.1.max(b.1).max(c.1).ceil() as i32,
        img.height(),
    ) else {
        return;
    };
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            let p = (f64::from(x) + 0.5, f64::from(y) + 0.5);
            if point_in_triangle(p, a, b, c) {
                plot(img, x, y, color);
            }
        }
    }
}

/// Shaft plus filled head ending exactly at `to`.
pub fn draw_arrow(
    img: &mut RgbaImage,
    from: (f64, f64),
    to: (f64, f64),
    color: Rgba<u8>,
    width: f64,
    head_len: f64,
) {
    let head_width = head_len * 0.9;
    let angle = (to.1 - from.1).atan2(to.0 - from.0);
    let back = (to.0 - head_len * angle.cos(), to.1 - head_len * angle.sin());
    let shaft_len = ((to.0 - from.0).powi(2) + (to.1 - from.1).powi(2)).sqrt();
    if shaft_len > head_len {
        draw_thick_line(img, from, back, color, width);
    }
    let left = angle + PI / 2.0;
    let right = angle - PI / 2.0;
    fill_triangle(
        img,
        to,
        (
            back.0 + (head_width / 2.0) * left.cos(),
            back.1 + (head_width / 2.0) * left.sin(),
        ),
        (
            back.0 + (head_width / 2.0) * right.cos(),
            back.1 + (head_width / 2.0) * right.sin(),
        ),
        color,
    );
}

pub fn draw_cross(img: &mut RgbaImage, at: (f64, f64), half: i32, thickness: i32, color: Rgba<u8>) {
    let (cx, cy) = (at.0.round() as i32, at.1.round() as i32);
    let t = thickness.max(1);
    let lo = -(t / 2);
    let hi = lo + t;
    fill_rect(img, cx - half, cy + lo, cx + half + 1, cy + hi, color);
    fill_rect(img, cx + lo, cy - half, cx + hi, cy + half + 1, color);
}

pub fn draw_bitmap_text(img: &mut RgbaImage, x: i32, y: i32, text: &str, color: Rgba<u8>, scale: u32) {
    let scale_i = scale.max(1) as i32;
    let advance = GLYPH_PX as i32 * scale_i;
    let mut cursor_x = x;
    let mut cursor_y = y;
    for ch in text.chars() {
        if ch == '\n' {
            cursor_x = x;
            cursor_y += advance;
            continue;
        }
        let Some(glyph) = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?')) else {
            cursor_x += advance;
            continue;
        };
        for (row_idx, row) in glyph.iter().enumerate() {
            for col_idx in 0..8 {
                if (*row >> col_idx) & 1 == 0 {
                    continue;
                }
                let px = cursor_x + col_idx * scale_i;
                let py = cursor_y + row_idx as i32 * scale_i;
                fill_rect(img, px, py, px + scale_i, py + scale_i, color);
            }
        }
        cursor_x += advance;
    }
}

/// Width and height in pixels of single-line `text` at `scale`.
pub fn text_extent(text: &str, scale: u32) -> (i32, i32) {
    let advance = (GLYPH_PX * scale.max(1)) as i32;
    (text.chars().count() as i32 * advance, advance)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);

    fn transparent(w: u32, h: u32) -> RgbaImage {
        RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 0]))
    }

    #[test]
    fn parses_hex_colors() {
        assert_eq!(parse_color("#FF3B30"), Some(Rgba([255, 59, 48, 255])));
        assert_eq!(parse_color("#00ff0080"), Some(Rgba([0, 255, 0, 128])));
        assert_eq!(parse_color("red"), None);
        assert_eq!(parse_color("#12345"), None);
    }

    #[test]
    fn blend_over_transparent_keeps_source() {
        let src = Rgba([10, 20, 30, 128]);
        assert_eq!(blend_over(Rgba([0, 0, 0, 0]), src), src);
        assert_eq!(blend_over(Rgba([1, 2, 3, 255]), RED), RED);
        assert_eq!(blend_over(RED, Rgba([9, 9, 9, 0])), RED);
    }

    #[test]
    fn fill_rect_clips_to_image() {
        let mut img = transparent(10, 10);
        fill_rect(&mut img, -5, -5, 3, 3, RED);
        assert_eq!(*img.get_pixel(0, 0), RED);
        assert_eq!(*img.get_pixel(2, 2), RED);
        assert_eq!(img.get_pixel(3, 3).0[3], 0);
    }

    #[test]
    fn rect_outline_leaves_interior_clear() {
        let mut img = transparent(20, 20);
        draw_rect_outline(&mut img, 2, 2, 10, 10, RED, 2);
        assert_eq!(*img.get_pixel(2, 2), RED);
        assert_eq!(*img.get_pixel(11, 11), RED);
        assert_eq!(img.get_pixel(6, 6).0[3], 0);
        assert_eq!(img.get_pixel(12, 12).0[3], 0);
    }

    #[test]
    fn cross_marks_center_and_arms() {
        let mut img = transparent(40, 40);
        draw_cross(&mut img, (20.0, 20.0), 10, 3, RED);
        assert_eq!(*img.get_pixel(20, 20), RED);
        assert_eq!(*img.get_pixel(10, 20), RED);
        assert_eq!(*img.get_pixel(20, 30), RED);
        assert_eq!(img.get_pixel(12, 12).0[3], 0);
    }

    #[test]
    fn arrow_reaches_its_tip() {
        let mut img = transparent(60, 20);
        draw_arrow(&mut img, (2.0, 10.0), (50.0, 10.0), RED, 3.0, 12.0);
        assert_eq!(img.get_pixel(10, 10).0[3], 255);
        assert_eq!(img.get_pixel(48, 10).0[3], 255);
        assert_eq!(img.get_pixel(58, 10).0[3], 0);
    }

    #[test]
    fn bitmap_text_draws_something_within_extent() {
        let mut img = transparent(64, 16);
        draw_bitmap_text(&mut img, 0, 0, "HI", RED, 1);
        let (w, h) = text_extent("HI", 1);
        assert_eq!((w, h), (16, 8));
        let lit = img.pixels().filter(|p| p.0[3] > 0).count();
        assert!(lit > 0);
        assert!(img
            .enumerate_pixels()
            .all(|(x, y, p)| p.0[3] == 0 || (x < 16 && y < 8)));
    }
}
