//! Face embedding computation.
//!
//! The encoder crops the selected face region, resizes it to a fixed patch,
//! and computes a gradient-orientation descriptor: 4x4 spatial cells, 8
//! orientation bins per cell, 128 values total, L2-normalized. The descriptor
//! is a pure function of the input pixels.

use image::{imageops::FilterType, DynamicImage};

use crate::face::detect::{detect_faces, FaceRegion, FaceSelection};

/// Embedding dimensionality. Constant for the lifetime of an index.
pub const EMBEDDING_DIM: usize = 128;

/// Identifies the descriptor algorithm. Persisted index files record a hash
/// of this string so an index built by a different encoder is never served.
pub const ENCODER_ID: &str = "grid-gradient-v1";

/// Side length of the normalized face patch the descriptor is computed on.
const PATCH_SIZE: u32 = 64;

/// Spatial grid of the descriptor (GRID x GRID cells).
const GRID: u32 = 4;

/// Orientation bins per cell.
const BINS: usize = 8;

/// Errors from embedding extraction.
///
/// `NoFace` is an expected, recoverable outcome. Batch jobs treat it as
/// "skip this record", not as a failure of the batch.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("No face found in image")]
    NoFace,
}

/// Face embedding extractor.
///
/// The multi-face tie-break is an explicit constructor parameter rather than
/// an implicit default, since it is behavior callers need to pin down.
pub struct FaceEncoder {
    selection: FaceSelection,
}

impl FaceEncoder {
    pub fn new(selection: FaceSelection) -> Self {
        Self { selection }
    }

    /// Detect a face and compute its embedding.
    ///
    /// Zero detected regions fail with `NoFace`. Multiple regions are
    /// resolved by the configured `FaceSelection`.
    pub fn extract(&self, img: &DynamicImage) -> Result<Vec<f32>, ExtractError> {
        let regions = detect_faces(img);
        let region = self.selection.select(&regions).ok_or(ExtractError::NoFace)?;
        Ok(encode_region(img, region))
    }

    /// Detect a face and return both its embedding and bounding box.
    pub fn extract_with_region(
        &self,
        img: &DynamicImage,
    ) -> Result<(Vec<f32>, FaceRegion), ExtractError> {
        let regions = detect_faces(img);
        let region = *self.selection.select(&regions).ok_or(ExtractError::NoFace)?;
        Ok((encode_region(img, &region), region))
    }
}

/// Compute the descriptor for one face region.
///
/// Always produces exactly `EMBEDDING_DIM` components.
pub fn encode_region(img: &DynamicImage, region: &FaceRegion) -> Vec<f32> {
    let patch = img
        .crop_imm(region.x, region.y, region.width, region.height)
        .resize_exact(PATCH_SIZE, PATCH_SIZE, FilterType::Triangle)
        .to_luma8();

    let mut descriptor = vec![0f32; EMBEDDING_DIM];
    let cell_size = PATCH_SIZE / GRID;

    // Central-difference gradients over the patch interior.
    for y in 1..PATCH_SIZE - 1 {
        for x in 1..PATCH_SIZE - 1 {
            let dx = patch.get_pixel(x + 1, y).0[0] as f32 - patch.get_pixel(x - 1, y).0[0] as f32;
            let dy = patch.get_pixel(x, y + 1).0[0] as f32 - patch.get_pixel(x, y - 1).0[0] as f32;

            let magnitude = (dx * dx + dy * dy).sqrt();
            if magnitude == 0.0 {
                continue;
            }

            // Orientation in [0, 2*pi), quantized into BINS.
            let angle = dy.atan2(dx) + std::f32::consts::PI;
            let mut bin = (angle / (2.0 * std::f32::consts::PI) * BINS as f32) as usize;
            if bin >= BINS {
                bin = BINS - 1;
            }

            let cell_x = (x / cell_size).min(GRID - 1) as usize;
            let cell_y = (y / cell_size).min(GRID - 1) as usize;
            let cell = cell_y * GRID as usize + cell_x;

            descriptor[cell * BINS + bin] += magnitude;
        }
    }

    // L2-normalize. A flat patch yields the zero vector, which is a valid
    // (if degenerate) embedding.
    let norm: f32 = descriptor.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in &mut descriptor {
            *v /= norm;
        }
    }

    descriptor
}
