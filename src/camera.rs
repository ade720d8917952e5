//! Camera-pipeline collaborator interface and startup re-application of
//! persisted per-camera settings.
//!
//! Capture, decoding and device switching belong to the host pipeline; the
//! calibration subsystem needs an owned frame copy, pause/resume around a
//! session, and a place to install the perspective filter.

use image::RgbImage;
use tracing::{debug, info, warn};

use crate::store::{CalibrationStore, ImageAdjustments};
use crate::transform::PerspectiveTransform;

/// Surface of the external camera pipeline consumed by calibration.
pub trait CameraPipeline {
    /// Owned copy of the most recent frame, `None` when no camera is active.
    fn current_frame(&self) -> Option<RgbImage>;

    /// Stop feeding new frames to the view (the session calibrates against a
    /// frozen frame).
    fn pause(&mut self);

    /// Resume the live feed.
    fn resume(&mut self);

    /// Install the keystone-correction filter applied to every subsequent
    /// frame.
    fn set_perspective_filter(&mut self, filter: PerspectiveTransform);

    /// Remove any installed keystone-correction filter.
    fn clear_perspective_filter(&mut self);

    /// Apply brightness/contrast/orientation/flip adjustments.
    fn set_adjustments(&mut self, adjustments: &ImageAdjustments);

    /// Identity of the active physical camera.
    fn camera_index(&self) -> i32;
    fn camera_name(&self) -> String;
}

/// Re-apply the persisted calibration and adjustments for the pipeline's
/// current camera, typically once at startup.
///
/// Returns whether a perspective filter was installed. Stored geometry that
/// no longer builds is logged and skipped; startup never fails here.
pub fn apply_stored_calibration(
    pipeline: &mut dyn CameraPipeline,
    store: &CalibrationStore,
) -> bool {
    let index = pipeline.camera_index();

    let Some(record) = store.get(index) else {
        debug!("no stored configuration for camera {}", index);
        return false;
    };

    pipeline.set_adjustments(&record.adjustments);

    if !record.has_correction {
        return false;
    }

    let Some(corners) = record.correction_corners() else {
        warn!(
            "camera {} is marked corrected but has no usable points",
            index
        );
        return false;
    };

    match PerspectiveTransform::from_quad(corners, record.source_width, record.source_height) {
        Ok(filter) => {
            pipeline.set_perspective_filter(filter);
            info!(
                "restored keystone correction for camera {} ({})",
                index, record.camera_name
            );
            true
        }
        Err(e) => {
            warn!("stored correction for camera {} is unusable: {}", index, e);
            false
        }
    }
}

/// Drop the stored correction for the pipeline's current camera and remove
/// the installed filter. Adjustments are kept. Returns whether a record
/// existed.
pub fn clear_camera_correction(
    pipeline: &mut dyn CameraPipeline,
    store: &mut CalibrationStore,
) -> bool {
    let index = pipeline.camera_index();
    let existed = store.clear_correction(index);
    if existed {
        if let Err(e) = store.save() {
            warn!("failed to persist cleared correction: {:#}", e);
        }
        info!("cleared keystone correction for camera {}", index);
    }
    pipeline.clear_perspective_filter();
    existed
}
