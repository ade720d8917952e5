//! Coordinate conversions between the view container, the letterboxed image
//! display area and native source pixels.
//!
//! The live frame is drawn centered inside the container, preserving its
//! aspect ratio. Calibration points are edited in container coordinates and
//! only converted to source pixels when a correction is committed.

/// Fallback container size when layout has not produced a usable size yet.
pub const FALLBACK_WIDTH: f64 = 800.0;
pub const FALLBACK_HEIGHT: f64 = 600.0;

/// The rectangle at which the frame is displayed inside the container.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DisplayRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl DisplayRect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Compute the letterboxed rectangle for an image of the given aspect ratio
/// centered in a `container_width` x `container_height` area.
///
/// `aspect_ratio` is width/height of the source image; `None` means no image
/// is loaded and the full container is returned. The larger image dimension
/// is constrained and the rectangle is centered on the other axis.
pub fn image_display_rect(
    container_width: f64,
    container_height: f64,
    aspect_ratio: Option<f64>,
) -> DisplayRect {
    let (area_width, area_height) = sanitize_container(container_width, container_height);

    let aspect = match aspect_ratio {
        Some(a) if a.is_finite() && a > 0.0 => a,
        _ => return DisplayRect::new(0.0, 0.0, area_width, area_height),
    };

    let area_aspect = area_width / area_height;

    let (width, height) = if aspect > area_aspect {
        // Width constrained
        (area_width, area_width / aspect)
    } else {
        // Height constrained
        (area_height * aspect, area_height)
    };

    let x = (area_width - width) / 2.0;
    let y = (area_height - height) / 2.0;

    DisplayRect::new(x, y, width, height)
}

/// Convert a container-space point to source-pixel coordinates given the
/// display rectangle the frame occupies.
///
/// The result is clamped to `[0, source_width-1] x [0, source_height-1]`.
pub fn container_to_source(
    x: f64,
    y: f64,
    rect: &DisplayRect,
    source_width: u32,
    source_height: u32,
) -> (f64, f64) {
    let source_width = source_width.max(1) as f64;
    let source_height = source_height.max(1) as f64;

    // A zero-size rect cannot happen with a sanitized container, but guard
    // the division anyway.
    let rect_width = if rect.width > 0.0 {
        rect.width
    } else {
        FALLBACK_WIDTH
    };
    let rect_height = if rect.height > 0.0 {
        rect.height
    } else {
        FALLBACK_HEIGHT
    };

    let sx = (x - rect.x) * source_width / rect_width;
    let sy = (y - rect.y) * source_height / rect_height;

    (
        sx.clamp(0.0, source_width - 1.0),
        sy.clamp(0.0, source_height - 1.0),
    )
}

/// Replace a degenerate container size with the fallback.
pub fn sanitize_container(width: f64, height: f64) -> (f64, f64) {
    if width > 0.0 && height > 0.0 && width.is_finite() && height.is_finite() {
        (width, height)
    } else {
        (FALLBACK_WIDTH, FALLBACK_HEIGHT)
    }
}
