//! Perspective (homography) transform for keystone correction.
//!
//! A calibration commits four source-pixel corners describing where the
//! rectangular document surface appears in the raw frame. The transform maps
//! that quadrilateral onto the full rectangular output, so every subsequent
//! frame is de-skewed before display.

use image::RgbImage;
use thiserror::Error;

/// Quadrilaterals that cannot produce a homography.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GeometryError {
    /// The four corners are collinear or enclose (nearly) zero area.
    #[error("calibration points are collinear or enclose no area")]
    InvalidGeometry,
}

/// Minimum |cross product| for three corners to count as non-collinear,
/// and minimum enclosed quad area, both in squared source pixels.
const DEGENERACY_EPSILON: f64 = 1.0;

/// Perspective transformation (3x3 homography pair)
#[derive(Debug, Clone)]
pub struct PerspectiveTransform {
    /// Maps the source quadrilateral onto the rectangular output, row-major
    matrix: [f64; 9],
    /// Inverse mapping (output rectangle -> source quad), used for warping
    inverse: [f64; 9],
    /// Source frame dimensions; the output has the same dimensions
    width: u32,
    height: u32,
}

impl PerspectiveTransform {
    /// Build the transform from the four user-placed corners, ordered
    /// top-left, top-right, bottom-right, bottom-left, in source pixels.
    ///
    /// Fails when the corners cannot describe a quadrilateral. Nothing is
    /// clamped here; the caller converts and bounds the points beforehand.
    pub fn from_quad(
        corners: [(f64, f64); 4],
        source_width: u32,
        source_height: u32,
    ) -> Result<Self, GeometryError> {
        if quad_is_degenerate(&corners) {
            return Err(GeometryError::InvalidGeometry);
        }

        let rect = frame_corners(source_width, source_height);
        let matrix = compute_homography(corners, rect).ok_or(GeometryError::InvalidGeometry)?;
        let inverse = compute_homography(rect, corners).ok_or(GeometryError::InvalidGeometry)?;

        Ok(Self {
            matrix,
            inverse,
            width: source_width,
            height: source_height,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Map a point from the source quad frame to the de-skewed output.
    #[inline]
    pub fn transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        apply_homography(&self.matrix, x, y)
    }

    /// Map an output point back to its source sampling position.
    #[inline]
    pub fn inverse_transform_point(&self, x: f64, y: f64) -> (f64, f64) {
        apply_homography(&self.inverse, x, y)
    }

    /// De-skew an RGB frame, sampling each output pixel from the position the
    /// output grid maps to in the source, with bilinear interpolation.
    pub fn warp_rgb(&self, src: &RgbImage) -> RgbImage {
        let w = self.width as usize;
        let mut dst = vec![0u8; w * self.height as usize * 3];
        self.warp_image(src.as_raw(), w * 3, &mut dst, w * 3, 3);
        // Buffer length matches dimensions by construction
        RgbImage::from_raw(self.width, self.height, dst)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }

    /// Apply the transform to a raw interleaved buffer.
    pub fn warp_image(
        &self,
        src: &[u8],
        src_stride: usize,
        dst: &mut [u8],
        dst_stride: usize,
        channels: usize,
    ) {
        let w = self.width as usize;
        let h = self.height as usize;

        for dst_y in 0..h {
            for dst_x in 0..w {
                let (src_x, src_y) = self.inverse_transform_point(dst_x as f64, dst_y as f64);

                let pixel = bilinear_sample(src, src_stride, w, h, channels, src_x, src_y);

                let dst_offset = dst_y * dst_stride + dst_x * channels;
                for c in 0..channels {
                    if dst_offset + c < dst.len() {
                        dst[dst_offset + c] = pixel[c];
                    }
                }
            }
        }
    }
}

/// Corners of the full rectangular frame, in calibration point order.
fn frame_corners(width: u32, height: u32) -> [(f64, f64); 4] {
    [
        (0.0, 0.0),
        (width as f64, 0.0),
        (width as f64, height as f64),
        (0.0, height as f64),
    ]
}

/// True when any three corners are (nearly) collinear or the enclosed area
/// vanishes. Either condition makes the DLT system singular.
fn quad_is_degenerate(corners: &[(f64, f64); 4]) -> bool {
    // Shoelace area of the polygon
    let mut doubled_area = 0.0;
    for i in 0..4 {
        let (x0, y0) = corners[i];
        let (x1, y1) = corners[(i + 1) % 4];
        doubled_area += x0 * y1 - x1 * y0;
    }
    if doubled_area.abs() < 2.0 * DEGENERACY_EPSILON {
        return true;
    }

    // Every triple of corners must span a triangle
    for skip in 0..4 {
        let tri: Vec<(f64, f64)> = (0..4).filter(|&i| i != skip).map(|i| corners[i]).collect();
        let cross = (tri[1].0 - tri[0].0) * (tri[2].1 - tri[0].1)
            - (tri[1].1 - tri[0].1) * (tri[2].0 - tri[0].0);
        if cross.abs() < DEGENERACY_EPSILON {
            return true;
        }
    }

    false
}

/// Compute a 3x3 homography matrix from 4 point correspondences using the
/// Direct Linear Transform (DLT) algorithm. `None` when the system is
/// singular.
fn compute_homography(src: [(f64, f64); 4], dst: [(f64, f64); 4]) -> Option<[f64; 9]> {
    // For each correspondence (x,y) -> (x',y'):
    //  x*h1 + y*h2 + h3 - x'*x*h7 - x'*y*h8 = x'
    //  x*h4 + y*h5 + h6 - y'*x*h7 - y'*y*h8 = y'
    let mut a = [[0.0f64; 8]; 8];
    let mut b = [0.0f64; 8];

    for i in 0..4 {
        let (x, y) = src[i];
        let (xp, yp) = dst[i];

        let row1 = i * 2;
        let row2 = i * 2 + 1;

        a[row1][0] = x;
        a[row1][1] = y;
        a[row1][2] = 1.0;
        a[row1][6] = -xp * x;
        a[row1][7] = -xp * y;
        b[row1] = xp;

        a[row2][3] = x;
        a[row2][4] = y;
        a[row2][5] = 1.0;
        a[row2][6] = -yp * x;
        a[row2][7] = -yp * y;
        b[row2] = yp;
    }

    let h = solve_linear_system(&mut a, &mut b)?;

    Some([h[0], h[1], h[2], h[3], h[4], h[5], h[6], h[7], 1.0])
}

/// Solve an 8x8 linear system using Gaussian elimination with partial
/// pivoting. `None` when a pivot vanishes (singular system).
fn solve_linear_system(a: &mut [[f64; 8]; 8], b: &mut [f64; 8]) -> Option<[f64; 8]> {
    let n = 8;

    for col in 0..n {
        // Find pivot
        let mut max_row = col;
        let mut max_val = a[col][col].abs();
        for row in (col + 1)..n {
            if a[row][col].abs() > max_val {
                max_val = a[row][col].abs();
                max_row = row;
            }
        }

        if max_row != col {
            a.swap(col, max_row);
            b.swap(col, max_row);
        }

        let pivot = a[col][col];
        if pivot.abs() < 1e-10 {
            return None;
        }

        for row in (col + 1)..n {
            let factor = a[row][col] / pivot;
            for j in col..n {
                a[row][j] -= factor * a[col][j];
            }
            b[row] -= factor * b[col];
        }
    }

    // Back substitution
    let mut x = [0.0f64; 8];
    for i in (0..n).rev() {
        let mut sum = b[i];
        for j in (i + 1)..n {
            sum -= a[i][j] * x[j];
        }
        x[i] = sum / a[i][i];
    }

    Some(x)
}

/// Apply a homography matrix to a point
#[inline]
fn apply_homography(h: &[f64; 9], x: f64, y: f64) -> (f64, f64) {
    let w = h[6] * x + h[7] * y + h[8];
    if w.abs() < 1e-10 {
        return (x, y); // Avoid division by zero
    }
    let xp = (h[0] * x + h[1] * y + h[2]) / w;
    let yp = (h[3] * x + h[4] * y + h[5]) / w;
    (xp, yp)
}

/// Bilinear interpolation sampling
#[inline]
fn bilinear_sample(
    src: &[u8],
    stride: usize,
    width: usize,
    height: usize,
    channels: usize,
    x: f64,
    y: f64,
) -> [u8; 4] {
    let x = x.max(0.0).min((width - 1) as f64);
    let y = y.max(0.0).min((height - 1) as f64);

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(width - 1);
    let y1 = (y0 + 1).min(height - 1);

    let fx = x - x0 as f64;
    let fy = y - y0 as f64;

    let mut result = [0u8; 4];

    for c in 0..channels.min(4) {
        let p00 = src.get(y0 * stride + x0 * channels + c).copied().unwrap_or(0) as f64;
        let p10 = src.get(y0 * stride + x1 * channels + c).copied().unwrap_or(0) as f64;
        let p01 = src.get(y1 * stride + x0 * channels + c).copied().unwrap_or(0) as f64;
        let p11 = src.get(y1 * stride + x1 * channels + c).copied().unwrap_or(0) as f64;

        let value = p00 * (1.0 - fx) * (1.0 - fy)
            + p10 * fx * (1.0 - fy)
            + p01 * (1.0 - fx) * fy
            + p11 * fx * fy;

        result[c] = value.round().clamp(0.0, 255.0) as u8;
    }

    result
}
