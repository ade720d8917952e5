//! deskview - view transform and keystone calibration for document-camera
//! annotation
//!
//! A document camera shows a live feed the user draws ink over. This crate
//! owns the geometry around that: the pannable/zoomable view with
//! constant-thickness strokes, the interactive 4-point keystone-calibration
//! session, the perspective transform it produces, and the per-camera
//! persistence of corrections and image adjustments. The ink engine and the
//! capture pipeline stay on the host side of the [`ink::InkEngine`] and
//! [`camera::CameraPipeline`] traits.

pub mod camera;
pub mod ink;
pub mod mapping;
pub mod session;
pub mod store;
pub mod transform;
pub mod viewport;

pub use camera::{apply_stored_calibration, clear_camera_correction, CameraPipeline};
pub use ink::InkEngine;
pub use mapping::{container_to_source, image_display_rect, DisplayRect};
pub use session::{
    CalibrationSession, OverlayPoint, SessionContext, SessionError, SessionEvent, SessionEventSink,
};
pub use store::{CalibrationStore, CameraCalibration, CorrectionPoint, ImageAdjustments};
pub use transform::{GeometryError, PerspectiveTransform};
pub use viewport::{RenderSink, ViewState, Viewport, ZoomDirection};
