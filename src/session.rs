//! Interactive keystone-calibration session.
//!
//! A session freezes one camera frame, lets the user drag four corner
//! markers over the displayed image, and on apply converts them to source
//! pixels, builds the perspective filter, persists it for the camera and
//! installs it on the pipeline.
//!
//! The `Idle -> Active` state machine is the only re-entrancy guard: a
//! second enter while active is logged and ignored, and apply is impossible
//! unless a session is active. The frozen frame is owned by the active
//! state, so every exit path releases it.

use image::RgbImage;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::camera::CameraPipeline;
use crate::mapping;
use crate::store::{CalibrationStore, CorrectionPoint};
use crate::transform::{GeometryError, PerspectiveTransform};

/// Clicks within this distance of a marker grab it.
pub const HIT_TEST_RADIUS: f64 = 10.0;
/// Markers cannot be dragged closer than this to the container edge.
/// Equal to the hit radius by coincidence, not by dependency.
pub const DRAG_MARGIN: f64 = 10.0;
/// Initial marker inset from each container edge, as a fraction.
pub const DEFAULT_POINT_INSET: f64 = 0.15;

/// Errors reported to the user. Re-entrant enters are not errors; they are
/// logged and ignored.
#[derive(Debug, Error, PartialEq)]
pub enum SessionError {
    #[error("no camera frame available for calibration")]
    NoCameraAvailable,
    #[error(transparent)]
    Geometry(#[from] GeometryError),
}

/// Host-injected context for the session (corner labels come from the
/// host's localization, not from a global registry).
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub corner_labels: [String; 4],
}

impl Default for SessionContext {
    fn default() -> Self {
        Self {
            corner_labels: [
                "Top Left".to_string(),
                "Top Right".to_string(),
                "Bottom Right".to_string(),
                "Bottom Left".to_string(),
            ],
        }
    }
}

/// A labeled marker for the host's overlay.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayPoint {
    pub label: String,
    pub x: f64,
    pub y: f64,
}

/// Typed notifications the host subscribes to.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Entered { points: [(f64, f64); 4] },
    PointMoved { index: usize, x: f64, y: f64 },
    PointsReset { points: [(f64, f64); 4] },
    Applied { camera_index: i32 },
    Cancelled,
}

/// Observer interface for [`SessionEvent`]s.
pub trait SessionEventSink {
    fn publish(&mut self, event: SessionEvent);
}

/// Everything owned by an active session, released together on exit.
struct ActiveCalibration {
    /// Frozen frame captured at entry.
    frame: RgbImage,
    /// Markers in container coordinates, ordered top-left, top-right,
    /// bottom-right, bottom-left.
    points: [(f64, f64); 4],
    container_width: f64,
    container_height: f64,
    dragging: Option<usize>,
}

enum Mode {
    Idle,
    Active(Box<ActiveCalibration>),
}

/// The calibration state machine.
pub struct CalibrationSession {
    mode: Mode,
    context: SessionContext,
    events: Box<dyn SessionEventSink>,
}

impl CalibrationSession {
    pub fn new(context: SessionContext, events: Box<dyn SessionEventSink>) -> Self {
        Self {
            mode: Mode::Idle,
            context,
            events,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.mode, Mode::Active(_))
    }

    /// Begin a session over the current frame.
    ///
    /// Fails with [`SessionError::NoCameraAvailable`] when the pipeline has
    /// no frame, leaving the state untouched. A call while already active is
    /// ignored.
    pub fn enter(
        &mut self,
        pipeline: &mut dyn CameraPipeline,
        container_width: f64,
        container_height: f64,
    ) -> Result<(), SessionError> {
        if self.is_active() {
            warn!("calibration already active, ignoring re-entrant enter");
            return Ok(());
        }

        let frame = pipeline
            .current_frame()
            .ok_or(SessionError::NoCameraAvailable)?;

        let (width, height) = mapping::sanitize_container(container_width, container_height);
        let points = default_points(width, height);

        pipeline.pause();
        self.mode = Mode::Active(Box::new(ActiveCalibration {
            frame,
            points,
            container_width: width,
            container_height: height,
            dragging: None,
        }));

        info!(
            "entered calibration for camera {} over a {}x{} container",
            pipeline.camera_index(),
            width,
            height
        );
        self.events.publish(SessionEvent::Entered { points });
        Ok(())
    }

    /// The current markers with their labels, for the host overlay.
    pub fn overlay_points(&self) -> Option<[OverlayPoint; 4]> {
        let Mode::Active(active) = &self.mode else {
            return None;
        };
        let mut index = 0;
        Some(active.points.map(|(x, y)| {
            let point = OverlayPoint {
                label: self.context.corner_labels[index].clone(),
                x,
                y,
            };
            index += 1;
            point
        }))
    }

    /// Grab the nearest marker within [`HIT_TEST_RADIUS`] of the press.
    /// Returns whether one was selected.
    pub fn drag_start(&mut self, x: f64, y: f64) -> bool {
        let Mode::Active(active) = &mut self.mode else {
            return false;
        };

        let mut nearest: Option<(usize, f64)> = None;
        for (index, &(px, py)) in active.points.iter().enumerate() {
            let distance = (x - px).hypot(y - py);
            if distance <= HIT_TEST_RADIUS && nearest.map_or(true, |(_, d)| distance < d) {
                nearest = Some((index, distance));
            }
        }

        active.dragging = nearest.map(|(index, _)| index);
        active.dragging.is_some()
    }

    /// Move the grabbed marker, clamped to the container minus the margin.
    pub fn drag_move(&mut self, x: f64, y: f64) {
        let event = {
            let Mode::Active(active) = &mut self.mode else {
                return;
            };
            let Some(index) = active.dragging else {
                return;
            };

            let x = x.clamp(DRAG_MARGIN, active.container_width - DRAG_MARGIN);
            let y = y.clamp(DRAG_MARGIN, active.container_height - DRAG_MARGIN);
            active.points[index] = (x, y);
            SessionEvent::PointMoved { index, x, y }
        };
        self.events.publish(event);
    }

    /// Release the grabbed marker. No-op when nothing was grabbed.
    pub fn drag_end(&mut self) {
        if let Mode::Active(active) = &mut self.mode {
            active.dragging = None;
        }
    }

    /// Put the markers back on the default rectangle without leaving the
    /// session.
    pub fn reset_points(&mut self) {
        let event = {
            let Mode::Active(active) = &mut self.mode else {
                return;
            };
            active.points = default_points(active.container_width, active.container_height);
            active.dragging = None;
            SessionEvent::PointsReset {
                points: active.points,
            }
        };
        self.events.publish(event);
    }

    /// Commit the calibration: convert the markers to source pixels, build
    /// the perspective filter, persist it for the current camera and install
    /// it on the pipeline.
    ///
    /// A degenerate quadrilateral keeps the session active (frame and
    /// markers retained) so the user can adjust and retry. A failed store
    /// write is logged; the in-memory record and the installed filter stay
    /// valid.
    pub fn apply(
        &mut self,
        pipeline: &mut dyn CameraPipeline,
        store: &mut CalibrationStore,
    ) -> Result<(), SessionError> {
        let (corners, source_width, source_height) = {
            let Mode::Active(active) = &self.mode else {
                warn!("apply called outside an active calibration, ignoring");
                return Ok(());
            };

            let (source_width, source_height) = active.frame.dimensions();
            let aspect = source_width as f64 / source_height as f64;
            let rect = mapping::image_display_rect(
                active.container_width,
                active.container_height,
                Some(aspect),
            );

            let corners = active.points.map(|(x, y)| {
                let (sx, sy) =
                    mapping::container_to_source(x, y, &rect, source_width, source_height);
                CorrectionPoint {
                    x: sx.round() as i32,
                    y: sy.round() as i32,
                }
            });
            (corners, source_width, source_height)
        };

        let quad = corners.map(|p| (p.x as f64, p.y as f64));
        let filter = PerspectiveTransform::from_quad(quad, source_width, source_height)?;

        let camera_index = pipeline.camera_index();
        let record = store.entry(camera_index, &pipeline.camera_name());
        record.source_width = source_width;
        record.source_height = source_height;
        record.set_correction_points(corners);
        if let Err(e) = store.save() {
            warn!("failed to persist calibration, keeping it in memory: {:#}", e);
        }

        pipeline.set_perspective_filter(filter);
        pipeline.resume();
        self.mode = Mode::Idle;

        info!("applied keystone correction for camera {}", camera_index);
        self.events.publish(SessionEvent::Applied { camera_index });
        Ok(())
    }

    /// Discard the session without persisting anything.
    pub fn cancel(&mut self, pipeline: &mut dyn CameraPipeline) {
        if !self.is_active() {
            debug!("cancel called outside an active calibration");
            return;
        }
        self.mode = Mode::Idle;
        pipeline.resume();
        info!("calibration cancelled");
        self.events.publish(SessionEvent::Cancelled);
    }

    /// Unconditional teardown for error paths: release the frame, resume the
    /// feed and return to idle no matter what state the session is in.
    pub fn force_exit(&mut self, pipeline: &mut dyn CameraPipeline) {
        if self.is_active() {
            warn!("force-exiting active calibration");
            self.mode = Mode::Idle;
            pipeline.resume();
            self.events.publish(SessionEvent::Cancelled);
        } else {
            self.mode = Mode::Idle;
        }
    }
}

/// The default marker rectangle: centered, covering 70% of the container on
/// each axis.
fn default_points(width: f64, height: f64) -> [(f64, f64); 4] {
    let margin_x = width * DEFAULT_POINT_INSET;
    let margin_y = height * DEFAULT_POINT_INSET;
    [
        (margin_x, margin_y),
        (width - margin_x, margin_y),
        (width - margin_x, height - margin_y),
        (margin_x, height - margin_y),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ImageAdjustments;
    use std::cell::RefCell;
    use std::rc::Rc;

    struct MockPipeline {
        frame: Option<RgbImage>,
        paused: usize,
        resumed: usize,
        filter: Option<PerspectiveTransform>,
    }

    impl MockPipeline {
        fn with_frame(width: u32, height: u32) -> Self {
            Self {
                frame: Some(RgbImage::new(width, height)),
                paused: 0,
                resumed: 0,
                filter: None,
            }
        }

        fn without_frame() -> Self {
            Self {
                frame: None,
                paused: 0,
                resumed: 0,
                filter: None,
            }
        }
    }

    impl CameraPipeline for MockPipeline {
        fn current_frame(&self) -> Option<RgbImage> {
            self.frame.clone()
        }
        fn pause(&mut self) {
            self.paused += 1;
        }
        fn resume(&mut self) {
            self.resumed += 1;
        }
        fn set_perspective_filter(&mut self, filter: PerspectiveTransform) {
            self.filter = Some(filter);
        }
        fn clear_perspective_filter(&mut self) {
            self.filter = None;
        }
        fn set_adjustments(&mut self, _adjustments: &ImageAdjustments) {}
        fn camera_index(&self) -> i32 {
            3
        }
        fn camera_name(&self) -> String {
            "Desk Camera".to_string()
        }
    }

    #[derive(Clone, Default)]
    struct EventRecorder(Rc<RefCell<Vec<SessionEvent>>>);

    impl SessionEventSink for EventRecorder {
        fn publish(&mut self, event: SessionEvent) {
            self.0.borrow_mut().push(event);
        }
    }

    fn session() -> (CalibrationSession, EventRecorder) {
        let events = EventRecorder::default();
        let session = CalibrationSession::new(SessionContext::default(), Box::new(events.clone()));
        (session, events)
    }

    #[test]
    fn test_enter_without_camera_fails_and_stays_idle() {
        let (mut session, events) = session();
        let mut pipeline = MockPipeline::without_frame();

        let result = session.enter(&mut pipeline, 800.0, 600.0);
        assert_eq!(result, Err(SessionError::NoCameraAvailable));
        assert!(!session.is_active());
        assert_eq!(pipeline.paused, 0);
        assert!(events.0.borrow().is_empty());
    }

    #[test]
    fn test_enter_initializes_default_rectangle() {
        let (mut session, events) = session();
        let mut pipeline = MockPipeline::with_frame(1280, 960);

        session.enter(&mut pipeline, 800.0, 600.0).unwrap();
        assert!(session.is_active());
        assert_eq!(pipeline.paused, 1);

        let expected = [
            (120.0, 90.0),
            (680.0, 90.0),
            (680.0, 510.0),
            (120.0, 510.0),
        ];
        assert_eq!(
            events.0.borrow()[0],
            SessionEvent::Entered { points: expected }
        );

        let overlay = session.overlay_points().unwrap();
        assert_eq!(overlay[0].label, "Top Left");
        assert_eq!((overlay[2].x, overlay[2].y), (680.0, 510.0));
    }

    #[test]
    fn test_reentrant_enter_is_ignored() {
        let (mut session, events) = session();
        let mut pipeline = MockPipeline::with_frame(640, 480);

        session.enter(&mut pipeline, 800.0, 600.0).unwrap();
        session.enter(&mut pipeline, 800.0, 600.0).unwrap();

        assert_eq!(pipeline.paused, 1);
        assert_eq!(events.0.borrow().len(), 1);
    }

    #[test]
    fn test_degenerate_container_uses_fallback() {
        let (mut session, events) = session();
        let mut pipeline = MockPipeline::with_frame(640, 480);

        session.enter(&mut pipeline, 0.0, 0.0).unwrap();
        // 15% margins of the 800x600 fallback
        assert_eq!(
            events.0.borrow()[0],
            SessionEvent::Entered {
                points: [
                    (120.0, 90.0),
                    (680.0, 90.0),
                    (680.0, 510.0),
                    (120.0, 510.0),
                ]
            }
        );
    }

    #[test]
    fn test_drag_clamps_to_margins() {
        let (mut session, events) = session();
        let mut pipeline = MockPipeline::with_frame(640, 480);
        session.enter(&mut pipeline, 800.0, 600.0).unwrap();

        assert!(session.drag_start(121.0, 92.0));
        session.drag_move(-500.0, 10_000.0);
        session.drag_end();

        assert_eq!(
            events.0.borrow().last(),
            Some(&SessionEvent::PointMoved {
                index: 0,
                x: DRAG_MARGIN,
                y: 600.0 - DRAG_MARGIN,
            })
        );
    }

    #[test]
    fn test_drag_start_misses_outside_radius() {
        let (mut session, events) = session();
        let mut pipeline = MockPipeline::with_frame(640, 480);
        session.enter(&mut pipeline, 800.0, 600.0).unwrap();

        assert!(!session.drag_start(400.0, 300.0));
        let before = events.0.borrow().len();
        session.drag_move(50.0, 50.0);
        assert_eq!(events.0.borrow().len(), before);
    }

    #[test]
    fn test_drag_start_selects_nearest_marker() {
        let (mut session, _) = session();
        let mut pipeline = MockPipeline::with_frame(640, 480);
        session.enter(&mut pipeline, 800.0, 600.0).unwrap();

        // Park the top-right marker near the top-left one
        assert!(session.drag_start(680.0, 90.0));
        session.drag_move(135.0, 90.0);
        session.drag_end();

        // Both markers are in radius; the closer one (top-right) wins
        assert!(session.drag_start(129.0, 90.0));
        session.drag_move(300.0, 300.0);
        session.drag_end();

        let overlay = session.overlay_points().unwrap();
        assert_eq!((overlay[0].x, overlay[0].y), (120.0, 90.0));
        assert_eq!((overlay[1].x, overlay[1].y), (300.0, 300.0));
    }

    #[test]
    fn test_apply_persists_and_installs_filter() {
        let (mut session, events) = session();
        let mut pipeline = MockPipeline::with_frame(1280, 960);
        let mut store = CalibrationStore::in_memory();

        session.enter(&mut pipeline, 800.0, 600.0).unwrap();
        session.apply(&mut pipeline, &mut store).unwrap();

        assert!(!session.is_active());
        assert_eq!(pipeline.resumed, 1);
        assert!(pipeline.filter.is_some());
        assert_eq!(
            events.0.borrow().last(),
            Some(&SessionEvent::Applied { camera_index: 3 })
        );

        // 4:3 frame in a 4:3 container: the display rect is the container,
        // so markers scale straight into source pixels
        let record = store.get(3).unwrap();
        assert!(record.has_correction);
        assert_eq!(record.camera_name, "Desk Camera");
        assert_eq!(record.source_width, 1280);
        assert_eq!(record.source_height, 960);
        assert_eq!(record.correction_points[0], CorrectionPoint { x: 192, y: 144 });
        assert_eq!(record.correction_points[2], CorrectionPoint { x: 1088, y: 816 });
    }

    #[test]
    fn test_apply_with_degenerate_quad_stays_active() {
        let (mut session, _) = session();
        let mut pipeline = MockPipeline::with_frame(1280, 960);
        let mut store = CalibrationStore::in_memory();

        session.enter(&mut pipeline, 800.0, 600.0).unwrap();

        // Collapse all four markers onto one spot
        let corners = [
            (120.0, 90.0),
            (680.0, 90.0),
            (680.0, 510.0),
            (120.0, 510.0),
        ];
        for (x, y) in corners {
            assert!(session.drag_start(x, y));
            session.drag_move(50.0, 50.0);
            session.drag_end();
        }

        let result = session.apply(&mut pipeline, &mut store);
        assert_eq!(
            result,
            Err(SessionError::Geometry(GeometryError::InvalidGeometry))
        );

        // Session is still active with the frame held, nothing persisted
        assert!(session.is_active());
        assert_eq!(pipeline.resumed, 0);
        assert!(pipeline.filter.is_none());
        assert!(store.is_empty());

        // The user can fix the markers and retry
        session.reset_points();
        session.apply(&mut pipeline, &mut store).unwrap();
        assert!(!session.is_active());
        assert!(store.get(3).unwrap().has_correction);
    }

    #[test]
    fn test_cancel_discards_without_persisting() {
        let (mut session, events) = session();
        let mut pipeline = MockPipeline::with_frame(640, 480);
        let mut store = CalibrationStore::in_memory();

        session.enter(&mut pipeline, 800.0, 600.0).unwrap();
        session.cancel(&mut pipeline);

        assert!(!session.is_active());
        assert_eq!(pipeline.resumed, 1);
        assert!(store.is_empty());
        assert_eq!(events.0.borrow().last(), Some(&SessionEvent::Cancelled));

        // Cancel when idle is a no-op
        session.cancel(&mut pipeline);
        assert_eq!(pipeline.resumed, 1);
    }

    #[test]
    fn test_reset_points_restores_defaults_while_active() {
        let (mut session, events) = session();
        let mut pipeline = MockPipeline::with_frame(640, 480);
        session.enter(&mut pipeline, 800.0, 600.0).unwrap();

        assert!(session.drag_start(120.0, 90.0));
        session.drag_move(400.0, 400.0);
        session.drag_end();

        session.reset_points();
        assert!(session.is_active());
        assert_eq!(
            events.0.borrow().last(),
            Some(&SessionEvent::PointsReset {
                points: [
                    (120.0, 90.0),
                    (680.0, 90.0),
                    (680.0, 510.0),
                    (120.0, 510.0),
                ]
            })
        );
    }

    #[test]
    fn test_force_exit_always_returns_to_idle() {
        let (mut session, _) = session();
        let mut pipeline = MockPipeline::with_frame(640, 480);

        session.force_exit(&mut pipeline);
        assert!(!session.is_active());
        assert_eq!(pipeline.resumed, 0);

        session.enter(&mut pipeline, 800.0, 600.0).unwrap();
        session.force_exit(&mut pipeline);
        assert!(!session.is_active());
        assert_eq!(pipeline.resumed, 1);

        // A new session can start afterwards
        session.enter(&mut pipeline, 800.0, 600.0).unwrap();
        assert!(session.is_active());
    }

    #[test]
    fn test_apply_outside_active_session_is_ignored() {
        let (mut session, events) = session();
        let mut pipeline = MockPipeline::with_frame(640, 480);
        let mut store = CalibrationStore::in_memory();

        session.apply(&mut pipeline, &mut store).unwrap();
        assert!(store.is_empty());
        assert!(pipeline.filter.is_none());
        assert!(events.0.borrow().is_empty());
    }
}
