//! Builds the ground-truth frame: what the user sees, at the oracle's size.

use tracing::debug;

use crate::capture::DesktopSource;
use crate::error::AgentError;
use crate::frame::{compose, encode_png, scale_nearest, Frame};
use crate::overlay::OverlaySurface;

/// Composed frame plus its PNG encoding.
#[derive(Debug, Clone)]
pub struct GroundTruth {
    pub frame: Frame,
    pub png: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCompositor {
    target: (u32, u32),
}

impl FrameCompositor {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            target: (width.max(1), height.max(1)),
        }
    }

    /// Captures the desktop, scales it and the latest completed overlay
    /// buffer to the target size, blends and encodes.
    pub fn capture(
        &self,
        desktop: &mut dyn DesktopSource,
        overlay: &OverlaySurface,
    ) -> Result<GroundTruth, AgentError> {
        let raw = desktop.capture()?;
        let (tw, th) = self.target;
        let scaled = Frame {
            image: scale_nearest(&raw.image, tw, th),
            captured_at: raw.captured_at,
        };
        let layer = overlay.get_buffer();
        let layer = scale_nearest(&layer, tw, th);
        let frame = compose(&scaled, &layer)?;
        let png = encode_png(&frame)?;
        debug!(
            native_w = raw.width(),
            native_h = raw.height(),
            bytes = png.len(),
            "ground-truth frame composed"
        );
        Ok(GroundTruth { frame, png })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use image::Rgba;

    use super::*;
    use crate::coords::{CoordinateSpace, Region};
    use crate::overlay::{HeadlessPresenter, OverlayPrimitive, OverlayStyle};
    use crate::test_support::SyntheticDesktop;

    #[test]
    fn overlay_pixels_land_in_the_scaled_frame() {
        let coords = CoordinateSpace::new(200, 100);
        let mut overlay = OverlaySurface::spawn(coords, OverlayStyle::default(), |_, _| {
            Box::new(HeadlessPresenter::new())
        })
        .unwrap();
        let red = Rgba([255, 0, 0, 255]);
        let generation = overlay.set_primitives(vec![OverlayPrimitive::FilledRegion {
            region: Region::px(100, 50, 100, 50),
            color: red,
            label: None,
        }]);
        assert!(overlay.wait_painted(generation, Duration::from_secs(5)));

        let mut desktop = SyntheticDesktop::solid(200, 100, Rgba([0, 0, 255, 255]));
        let truth = FrameCompositor::new(100, 50).capture(&mut desktop, &overlay).unwrap();
        assert_eq!(truth.frame.dimensions(), (100, 50));
        assert_eq!(*truth.frame.image.get_pixel(75, 40), red);
        assert_eq!(*truth.frame.image.get_pixel(10, 10), Rgba([0, 0, 255, 255]));
        assert_eq!(&truth.png[1..4], b"PNG");
    }

    #[test]
    fn capture_failure_propagates() {
        let coords = CoordinateSpace::new(64, 64);
        let overlay = OverlaySurface::spawn(coords, OverlayStyle::default(), |_, _| {
            Box::new(HeadlessPresenter::new())
        })
        .unwrap();
        let mut desktop = SyntheticDesktop::failing();
        let err = FrameCompositor::new(32, 32)
            .capture(&mut desktop, &overlay)
            .unwrap_err();
        assert_eq!(err.kind(), "capture");
    }
}
