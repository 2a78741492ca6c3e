//! Frames plus the scale / blend / encode stages of the ground-truth pipeline.

use std::io::Cursor;

use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};

use crate::error::CompositionError;

/// A 4-channel pixel buffer stamped with its capture time.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub image: RgbaImage,
    pub captured_at: DateTime<Utc>,
}

impl Frame {
    pub fn new(image: RgbaImage) -> Self {
        Self {
            image,
            captured_at: Utc::now(),
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Nearest-neighbor resample. Source pixel for `(x, y)` is
/// `(x * sw / dw, y * sh / dh)`; X and Y ratios are independent.
pub fn scale_nearest(src: &RgbaImage, dw: u32, dh: u32) -> RgbaImage {
    let (sw, sh) = src.dimensions();
    if (sw, sh) == (dw, dh) {
        return src.clone();
    }
    if sw == 0 || sh == 0 || dw == 0 || dh == 0 {
        return RgbaImage::new(dw, dh);
    }
    let x_map: Vec<u32> = (0..dw)
        .map(|x| (u64::from(x) * u64::from(sw) / u64::from(dw)) as u32)
        .collect();
    let mut out = RgbaImage::new(dw, dh);
    for y in 0..dh {
        let sy = (u64::from(y) * u64::from(sh) / u64::from(dh)) as u32;
        for (x, sx) in x_map.iter().enumerate() {
            out.put_pixel(x as u32, y, *src.get_pixel(*sx, sy));
        }
    }
    out
}

fn blend_channel(overlay: u8, desktop: u8, alpha: u8) -> u8 {
    let a = u32::from(alpha);
    ((u32::from(overlay) * a + u32::from(desktop) * (255 - a) + 127) / 255) as u8
}

/// `out = overlay.rgb * a + desktop.rgb * (1 - a)`; the desktop's alpha is kept.
pub fn compose(desktop: &Frame, overlay: &RgbaImage) -> Result<Frame, CompositionError> {
    if desktop.dimensions() != overlay.dimensions() {
        return Err(CompositionError::ShapeMismatch {
            desktop: desktop.dimensions(),
            overlay: overlay.dimensions(),
        });
    }
    let mut out = desktop.image.clone();
    for (dst, src) in out.pixels_mut().zip(overlay.pixels()) {
        let a = src[3];
        if a == 0 {
            continue;
        }
        *dst = Rgba([
            blend_channel(src[0], dst[0], a),
            blend_channel(src[1], dst[1], a),
            blend_channel(src[2], dst[2], a),
            dst[3],
        ]);
    }
    Ok(Frame {
        image: out,
        captured_at: desktop.captured_at,
    })
}

/// PNG bytes with alpha dropped.
pub fn encode_png(frame: &Frame) -> Result<Vec<u8>, CompositionError> {
    let rgb = DynamicImage::ImageRgba8(frame.image.clone()).to_rgb8();
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(rgb)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| CompositionError::Encode(err.to_string()))?;
    Ok(bytes)
}
