//! Pan/zoom state for the live view, with ink stroke-width compensation.
//!
//! The viewport owns the current zoom factor and pan offset and applies
//! wheel and touch-gesture input. Zooming keeps the pivot point visually
//! stationary. Every mutation pushes the resulting scale+translate to the
//! render sink, and the zoom-compensated pen width to the ink engine, so
//! strokes drawn at any zoom level appear the same thickness on screen.

use tracing::debug;

use crate::ink::InkEngine;

pub const MIN_ZOOM: f64 = 0.1;
pub const MAX_ZOOM: f64 = 10.0;

pub const MIN_STROKE_WIDTH: f64 = 1.0;
pub const MAX_STROKE_WIDTH: f64 = 50.0;
pub const DEFAULT_STROKE_WIDTH: f64 = 2.0;

/// Zoom factor applied per wheel notch.
pub const WHEEL_ZOOM_IN: f64 = 1.1;
pub const WHEEL_ZOOM_OUT: f64 = 0.9;

/// Scale and translation applied to the live view.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ViewState {
    pub zoom: f64,
    pub pan_x: f64,
    pub pan_y: f64,
}

impl ViewState {
    pub fn identity() -> Self {
        Self {
            zoom: 1.0,
            pan_x: 0.0,
            pan_y: 0.0,
        }
    }
}

impl Default for ViewState {
    fn default() -> Self {
        Self::identity()
    }
}

/// One wheel notch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoomDirection {
    In,
    Out,
}

/// Rendering collaborator receiving the scale+translate description.
pub trait RenderSink {
    fn apply_view(&mut self, state: ViewState);
}

/// Pan/zoom controller for one live-view session.
///
/// Lives as long as the live view is shown; the host calls [`Viewport::reset`]
/// when switching between live and photo-review modes.
pub struct Viewport {
    state: ViewState,
    base_stroke_width: f64,
    enabled: bool,
    render: Box<dyn RenderSink>,
    ink: Box<dyn InkEngine>,
}

impl Viewport {
    pub fn new(base_stroke_width: f64, render: Box<dyn RenderSink>, ink: Box<dyn InkEngine>) -> Self {
        let base_stroke_width = if base_stroke_width > 0.0 {
            base_stroke_width
        } else {
            DEFAULT_STROKE_WIDTH
        };
        let mut viewport = Self {
            state: ViewState::identity(),
            base_stroke_width,
            enabled: true,
            render,
            ink,
        };
        viewport.push_view();
        viewport.push_stroke_width();
        viewport
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    pub fn zoom_factor(&self) -> f64 {
        self.state.zoom
    }

    pub fn base_stroke_width(&self) -> f64 {
        self.base_stroke_width
    }

    /// A disabled viewport ignores pan/zoom input (the host gates by tool
    /// mode). Reset still works.
    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    /// The pen width that, drawn at the current zoom, appears as thick as
    /// `base_stroke_width` at 1.0x.
    pub fn compensated_stroke_width(&self) -> f64 {
        (self.base_stroke_width / self.state.zoom).clamp(MIN_STROKE_WIDTH, MAX_STROKE_WIDTH)
    }

    /// Multiply the zoom by `factor`, keeping `pivot` (in container
    /// coordinates) visually stationary. The factor is clamped so zoom stays
    /// within [`MIN_ZOOM`, `MAX_ZOOM`]; nothing is rejected.
    pub fn zoom(&mut self, factor: f64, pivot: (f64, f64)) {
        if !self.enabled {
            return;
        }
        self.zoom_at(factor, pivot);
        self.push_view();
        self.push_stroke_width();
    }

    /// One wheel notch at the cursor position.
    pub fn zoom_step(&mut self, direction: ZoomDirection, pivot: (f64, f64)) {
        let factor = match direction {
            ZoomDirection::In => WHEEL_ZOOM_IN,
            ZoomDirection::Out => WHEEL_ZOOM_OUT,
        };
        self.zoom(factor, pivot);
    }

    /// Translate the view. Panning past the image bounds is allowed.
    pub fn pan(&mut self, delta_x: f64, delta_y: f64) {
        if !self.enabled {
            return;
        }
        self.state.pan_x += delta_x;
        self.state.pan_y += delta_y;
        self.push_view();
    }

    /// One pinch-gesture tick: scale about `origin`, then translate, as a
    /// single atomic update. The translation applies in the post-zoom frame.
    pub fn combined_gesture(&mut self, scale_factor: f64, translation: (f64, f64), origin: (f64, f64)) {
        if !self.enabled {
            return;
        }
        self.zoom_at(scale_factor, origin);
        self.state.pan_x += translation.0;
        self.state.pan_y += translation.1;
        self.push_view();
        self.push_stroke_width();
    }

    /// Back to 1.0x with no pan, recomputing the stroke width.
    pub fn reset(&mut self) {
        self.state = ViewState::identity();
        self.push_view();
        self.push_stroke_width();
    }

    /// Update the user-selected pen width and recompute compensation.
    pub fn set_base_stroke_width(&mut self, width: f64) {
        if width <= 0.0 || !width.is_finite() {
            debug!("ignoring non-positive base stroke width {}", width);
            return;
        }
        self.base_stroke_width = width;
        self.push_stroke_width();
    }

    /// Center-preserving zoom: the image point under the pivot before the
    /// change is the image point under it afterwards.
    fn zoom_at(&mut self, factor: f64, pivot: (f64, f64)) {
        let factor = if factor.is_finite() && factor > 0.0 {
            factor
        } else {
            1.0
        };
        let new_zoom = (self.state.zoom * factor).clamp(MIN_ZOOM, MAX_ZOOM);

        let relative_x = (pivot.0 - self.state.pan_x) / self.state.zoom;
        let relative_y = (pivot.1 - self.state.pan_y) / self.state.zoom;

        self.state.zoom = new_zoom;
        self.state.pan_x = pivot.0 - relative_x * new_zoom;
        self.state.pan_y = pivot.1 - relative_y * new_zoom;
    }

    fn push_view(&mut self) {
        self.render.apply_view(self.state);
    }

    fn push_stroke_width(&mut self) {
        let width = self.compensated_stroke_width();
        debug!(
            "stroke compensation: zoom={:.2} width={:.2}",
            self.state.zoom, width
        );
        self.ink.set_stroke_width(width);
        self.ink.update_pen_attributes();
    }
}
