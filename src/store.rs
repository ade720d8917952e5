//! Per-camera calibration persistence.
//!
//! One record per physical camera identity, holding the committed keystone
//! correction and the user's image adjustments. The store file is a single
//! JSON document rewritten whole on every save. Older installations kept a
//! loosely-typed per-camera map under `"CameraCorrections"`; those records
//! are migrated field-by-field on load.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Key the legacy schema stored its per-camera map under.
const LEGACY_KEY: &str = "CameraCorrections";

/// One keystone-correction corner in source pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorrectionPoint {
    pub x: i32,
    pub y: i32,
}

/// Brightness/contrast are encoded 0-200 with 100 as neutral.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAdjustments {
    #[serde(default = "default_level")]
    pub brightness: i32,
    #[serde(default = "default_level")]
    pub contrast: i32,
    /// Rotation in degrees
    #[serde(default)]
    pub orientation: i32,
    #[serde(default)]
    pub flip_horizontal: bool,
}

fn default_level() -> i32 {
    100
}

impl Default for ImageAdjustments {
    fn default() -> Self {
        Self {
            brightness: 100,
            contrast: 100,
            orientation: 0,
            flip_horizontal: false,
        }
    }
}

/// Persisted calibration and adjustments for one physical camera.
///
/// Invariant: when `has_correction` is set there are exactly 4 correction
/// points and both source dimensions are non-zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraCalibration {
    pub camera_index: i32,
    pub camera_name: String,
    #[serde(default)]
    pub source_width: u32,
    #[serde(default)]
    pub source_height: u32,
    /// Ordered top-left, top-right, bottom-right, bottom-left
    #[serde(default)]
    pub correction_points: Vec<CorrectionPoint>,
    #[serde(default)]
    pub has_correction: bool,
    #[serde(default)]
    pub adjustments: ImageAdjustments,
}

impl CameraCalibration {
    pub fn new(camera_index: i32, camera_name: &str) -> Self {
        Self {
            camera_index,
            camera_name: camera_name.to_string(),
            source_width: 0,
            source_height: 0,
            correction_points: Vec::new(),
            has_correction: false,
            adjustments: ImageAdjustments::default(),
        }
    }

    /// Install a committed set of corners and mark the record corrected.
    pub fn set_correction_points(&mut self, points: [CorrectionPoint; 4]) {
        self.correction_points = points.to_vec();
        self.has_correction = true;
    }

    /// Drop the correction, keeping the adjustments.
    pub fn clear_correction(&mut self) {
        self.has_correction = false;
        self.correction_points.clear();
    }

    /// The stored corners as float pairs, `None` unless exactly 4 are held.
    pub fn correction_corners(&self) -> Option<[(f64, f64); 4]> {
        if self.correction_points.len() != 4 {
            return None;
        }
        let p = &self.correction_points;
        Some([
            (p[0].x as f64, p[0].y as f64),
            (p[1].x as f64, p[1].y as f64),
            (p[2].x as f64, p[2].y as f64),
            (p[3].x as f64, p[3].y as f64),
        ])
    }

    /// Enforce the correction invariant, returning whether the record had to
    /// be repaired.
    fn sanitize(&mut self) -> bool {
        if self.has_correction
            && (self.correction_points.len() != 4
                || self.source_width == 0
                || self.source_height == 0)
        {
            self.has_correction = false;
            self.correction_points.clear();
            return true;
        }
        false
    }
}

/// Current on-disk schema.
#[derive(Serialize)]
struct StoreFile<'a> {
    cameras: &'a BTreeMap<i32, CameraCalibration>,
}

/// Loosely-typed legacy record; every field may be absent or malformed.
#[derive(Debug, Default, Deserialize)]
struct LegacyRecord {
    #[serde(rename = "CameraName", default)]
    camera_name: Option<String>,
    #[serde(rename = "SourceWidth", default)]
    source_width: Option<i64>,
    #[serde(rename = "SourceHeight", default)]
    source_height: Option<i64>,
    #[serde(rename = "OriginalCameraWidth", default)]
    original_camera_width: Option<i64>,
    #[serde(rename = "OriginalCameraHeight", default)]
    original_camera_height: Option<i64>,
    #[serde(rename = "CorrectionPoints", default)]
    correction_points: Option<Vec<LegacyPoint>>,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyPoint {
    #[serde(rename = "X", default)]
    x: Option<f64>,
    #[serde(rename = "Y", default)]
    y: Option<f64>,
}

impl LegacyRecord {
    /// Field-by-field conversion into the current schema. Records without
    /// usable dimensions or a full set of corners migrate uncorrected.
    fn into_calibration(self, camera_index: i32) -> CameraCalibration {
        let mut record = CameraCalibration::new(
            camera_index,
            &self
                .camera_name
                .unwrap_or_else(|| format!("Camera {}", camera_index)),
        );

        let width = self.source_width.or(self.original_camera_width).unwrap_or(0);
        let height = self
            .source_height
            .or(self.original_camera_height)
            .unwrap_or(0);
        if width > 0 && height > 0 {
            record.source_width = width as u32;
            record.source_height = height as u32;
        }

        let points: Vec<CorrectionPoint> = self
            .correction_points
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| {
                Some(CorrectionPoint {
                    x: p.x? as i32,
                    y: p.y? as i32,
                })
            })
            .collect();

        if points.len() == 4 && record.source_width > 0 && record.source_height > 0 {
            record.correction_points = points;
            record.has_correction = true;
        }

        record
    }
}

/// Calibration records keyed by camera index, backed by one JSON file.
pub struct CalibrationStore {
    path: Option<PathBuf>,
    cameras: BTreeMap<i32, CameraCalibration>,
    /// Serializes file writes; at most one save in flight.
    save_lock: Mutex<()>,
}

impl CalibrationStore {
    /// A store without a backing file; `save` is a no-op. Used by hosts that
    /// manage persistence themselves and by tests.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            cameras: BTreeMap::new(),
            save_lock: Mutex::new(()),
        }
    }

    /// Load the store from `path`. A missing or unreadable file yields an
    /// empty store; individual unusable records are skipped. Never fails the
    /// caller.
    pub fn load(path: &Path) -> Self {
        let mut store = Self {
            path: Some(path.to_path_buf()),
            cameras: BTreeMap::new(),
            save_lock: Mutex::new(()),
        };

        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no calibration store at {:?}, starting empty", path);
                return store;
            }
            Err(e) => {
                warn!("failed to read calibration store {:?}: {}", path, e);
                return store;
            }
        };

        let root: serde_json::Value = match serde_json::from_str(&content) {
            Ok(root) => root,
            Err(e) => {
                warn!("calibration store {:?} is not valid JSON: {}", path, e);
                return store;
            }
        };

        if let Some(serde_json::Value::Object(cameras)) = root.get("cameras") {
            for (key, raw) in cameras {
                let Ok(index) = key.parse::<i32>() else {
                    warn!("skipping calibration record with bad key {:?}", key);
                    continue;
                };
                match serde_json::from_value::<CameraCalibration>(raw.clone()) {
                    Ok(mut record) => {
                        record.camera_index = index;
                        if record.sanitize() {
                            warn!("camera {} record violated correction invariant", index);
                        }
                        store.cameras.insert(index, record);
                    }
                    Err(e) => warn!("skipping calibration record for camera {}: {}", key, e),
                }
            }
        }

        if let Some(serde_json::Value::Object(legacy)) = root.get(LEGACY_KEY) {
            store.migrate_legacy(legacy);
        }

        info!(
            "loaded calibration for {} camera(s) from {:?}",
            store.cameras.len(),
            path
        );

        store
    }

    /// Migrate a legacy per-camera map. Already-present records are never
    /// overwritten; records that fail to parse are skipped and logged.
    fn migrate_legacy(&mut self, legacy: &serde_json::Map<String, serde_json::Value>) {
        let mut migrated = 0usize;

        for (key, raw) in legacy {
            let Ok(index) = key.parse::<i32>() else {
                warn!("skipping legacy record with bad key {:?}", key);
                continue;
            };
            if self.cameras.contains_key(&index) {
                continue;
            }
            match serde_json::from_value::<LegacyRecord>(raw.clone()) {
                Ok(old) => {
                    self.cameras.insert(index, old.into_calibration(index));
                    migrated += 1;
                }
                Err(e) => warn!("skipping legacy record for camera {}: {}", key, e),
            }
        }

        if migrated > 0 {
            info!("migrated {} legacy calibration record(s)", migrated);
        }
    }

    /// Write the whole store to disk, atomically replacing the previous file.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _guard = self.save_lock.lock();

        let content = serde_json::to_string_pretty(&StoreFile {
            cameras: &self.cameras,
        })
        .context("failed to serialize calibration store")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create store directory {:?}", parent))?;
            }
        }

        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, content)
            .with_context(|| format!("failed to write calibration store {:?}", tmp))?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("failed to replace calibration store {:?}", path))?;

        info!(
            "saved calibration for {} camera(s) to {:?}",
            self.cameras.len(),
            path
        );
        Ok(())
    }

    pub fn get(&self, camera_index: i32) -> Option<&CameraCalibration> {
        self.cameras.get(&camera_index)
    }

    /// The record for a camera, created lazily with its identity.
    pub fn entry(&mut self, camera_index: i32, camera_name: &str) -> &mut CameraCalibration {
        self.cameras
            .entry(camera_index)
            .or_insert_with(|| CameraCalibration::new(camera_index, camera_name))
    }

    pub fn upsert(&mut self, record: CameraCalibration) {
        self.cameras.insert(record.camera_index, record);
    }

    /// Drop the correction for a camera, keeping its adjustments. Returns
    /// whether a record existed.
    pub fn clear_correction(&mut self, camera_index: i32) -> bool {
        match self.cameras.get_mut(&camera_index) {
            Some(record) => {
                record.clear_correction();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}
