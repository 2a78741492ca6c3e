//! Desktop capture.
//!
//! A capture is one buffer: desktop content plus the pointer, stamped in
//! right after the grab so the two layers cannot tear.

use image::{Rgba, RgbaImage};

use crate::error::CaptureError;
use crate::frame::Frame;
use crate::raster::fill_triangle;

pub trait DesktopSource {
    /// Native-resolution frame of the primary display, cursor included.
    fn capture(&mut self) -> Result<Frame, CaptureError>;

    fn screen_size(&self) -> Result<(u32, u32), CaptureError>;
}

const CURSOR_HEIGHT: f64 = 19.0;
const CURSOR_WIDTH: f64 = 12.0;

/// Software arrow cursor with its tip at `at`.
pub fn stamp_cursor(img: &mut RgbaImage, at: (i32, i32)) {
    let (x, y) = (f64::from(at.0), f64::from(at.1));
    let black = Rgba([0, 0, 0, 255]);
    let white = Rgba([255, 255, 255, 255]);
    fill_triangle(
        img,
        (x - 1.0, y - 2.0),
        (x - 1.0, y + CURSOR_HEIGHT + 1.5),
        (x + CURSOR_WIDTH + 1.5, y + CURSOR_HEIGHT * 0.72 + 0.5),
        black,
    );
    fill_triangle(
        img,
        (x, y),
        (x, y + CURSOR_HEIGHT - 1.0),
        (x + CURSOR_WIDTH - 1.0, y + CURSOR_HEIGHT * 0.72 - 0.5),
        white,
    );
}

pub fn ensure_non_empty(img: &RgbaImage) -> Result<(), CaptureError> {
    if img.width() == 0 || img.height() == 0 {
        return Err(CaptureError::Empty {
            width: img.width(),
            height: img.height(),
        });
    }
    Ok(())
}

#[cfg(feature = "native")]
pub use native::XcapDesktop;

#[cfg(feature = "native")]
mod native {
    use enigo::{Enigo, Mouse, Settings};
    use tracing::{debug, warn};
    use xcap::Monitor;

    use super::{ensure_non_empty, stamp_cursor, DesktopSource};
    use crate::error::CaptureError;
    use crate::frame::Frame;

    /// Primary monitor via `xcap`; pointer position via `enigo`.
    pub struct XcapDesktop {
        pointer: Option<Enigo>,
    }

    impl XcapDesktop {
        pub fn new() -> Self {
            let pointer = match Enigo::new(&Settings::default()) {
                Ok(enigo) => Some(enigo),
                Err(err) => {
                    warn!(error = %err, "pointer query unavailable; frames will not show the cursor");
                    None
                }
            };
            Self { pointer }
        }

        fn primary() -> Result<Monitor, CaptureError> {
            let monitors =
                Monitor::all().map_err(|err| CaptureError::Unavailable(err.to_string()))?;
            let mut fallback = None;
            for monitor in monitors {
                if monitor.is_primary() {
                    return Ok(monitor);
                }
                fallback.get_or_insert(monitor);
            }
            fallback.ok_or(CaptureError::NoMonitor)
        }
    }

    impl Default for XcapDesktop {
        fn default() -> Self {
            Self::new()
        }
    }

    impl DesktopSource for XcapDesktop {
        fn capture(&mut self) -> Result<Frame, CaptureError> {
            let monitor = Self::primary()?;
            let mut image = monitor
                .capture_image()
                .map_err(|err| CaptureError::Unavailable(err.to_string()))?;
            ensure_non_empty(&image)?;
            if let Some(enigo) = self.pointer.as_ref() {
                match enigo.location() {
                    Ok((x, y)) => {
                        let (mx, my) = (monitor.x(), monitor.y());
                        stamp_cursor(&mut image, (x - mx, y - my));
                    }
                    Err(err) => debug!(error = %err, "pointer location unavailable"),
                }
            }
            Ok(Frame::new(image))
        }

        fn screen_size(&self) -> Result<(u32, u32), CaptureError> {
            let monitor = Self::primary()?;
            Ok((monitor.width(), monitor.height()))
        }
    }
}
