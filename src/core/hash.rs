use image::{imageops, imageops::FilterType, DynamicImage, GrayImage};
use std::f32::consts::PI;
use std::path::Path;
use thiserror::Error;

/// Side of the low-frequency block kept from the DCT.
pub const HASH_SIZE: usize = 8;
pub const HIGH_FREQ_FACTOR: usize = 4;
/// Side of the grayscale image the DCT runs over.
pub const DCT_SIZE: usize = HASH_SIZE * HIGH_FREQ_FACTOR;

const COEFFICIENTS: usize = HASH_SIZE * HASH_SIZE;

#[derive(Debug, Error)]
pub enum HashError {
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Hash computation failed: {message}")]
    ComputationFailed { message: String },
}

/// Cosine basis for the 8 lowest frequencies over a 32-sample axis,
/// already scaled by the orthonormal DCT-II factor.
struct DctTable {
    basis: [[f32; DCT_SIZE]; HASH_SIZE],
}

impl DctTable {
    fn new() -> Self {
        let n = DCT_SIZE as f32;
        let mut basis = [[0.0f32; DCT_SIZE]; HASH_SIZE];
        for (u, row) in basis.iter_mut().enumerate() {
            let alpha = if u == 0 {
                (1.0 / n).sqrt()
            } else {
                (2.0 / n).sqrt()
            };
            for (x, value) in row.iter_mut().enumerate() {
                *value = alpha * ((2 * x + 1) as f32 * u as f32 * PI / (2.0 * n)).cos();
            }
        }
        Self { basis }
    }
}

/// Computes 64-bit DCT perceptual hashes.
///
/// Stateless apart from the precomputed cosine table, so a single instance
/// can be shared across threads and used from rayon workers.
pub struct HashService {
    table: DctTable,
}

impl HashService {
    pub fn new() -> Self {
        Self {
            table: DctTable::new(),
        }
    }

    /// Hash the image at `path`.
    ///
    /// Any failure yields `0`. Zero is also a valid hash for degenerate
    /// images, so callers cannot tell the two apart from the value alone.
    pub fn hash(&self, path: &Path) -> u64 {
        match self.try_hash(path) {
            Ok(hash) => hash,
            Err(e) => {
                log::warn!("Failed to hash {}: {}", path.display(), e);
                0
            }
        }
    }

    pub fn try_hash(&self, path: &Path) -> Result<u64, HashError> {
        let img = image::open(path)?;
        self.hash_image(&img)
    }

    pub fn hash_image(&self, img: &DynamicImage) -> Result<u64, HashError> {
        if img.width() == 0 || img.height() == 0 {
            return Err(HashError::ComputationFailed {
                message: format!("empty image {}x{}", img.width(), img.height()),
            });
        }

        let gray = img.to_luma8();
        let small = imageops::resize(&gray, DCT_SIZE as u32, DCT_SIZE as u32, FilterType::Triangle);
        let coefficients = self.low_frequency_dct(&small);

        let mut sorted = coefficients;
        sorted.sort_by(|a, b| a.total_cmp(b));
        let median = (sorted[COEFFICIENTS / 2 - 1] + sorted[COEFFICIENTS / 2]) / 2.0;

        let mut hash = 0u64;
        for (i, coefficient) in coefficients.iter().enumerate() {
            if *coefficient > median {
                hash |= 1 << i;
            }
        }
        Ok(hash)
    }

    /// Top-left 8x8 block of the 2-D DCT-II of a 32x32 image, row-major by
    /// vertical frequency. Separable: rows first, then columns.
    fn low_frequency_dct(&self, pixels: &GrayImage) -> [f32; COEFFICIENTS] {
        let basis = &self.table.basis;

        let mut rows = [[0.0f32; HASH_SIZE]; DCT_SIZE];
        for (y, row) in rows.iter_mut().enumerate() {
            for (u, out) in row.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                for x in 0..DCT_SIZE {
                    sum += pixels.get_pixel(x as u32, y as u32)[0] as f32 * basis[u][x];
                }
                *out = sum;
            }
        }

        let mut coefficients = [0.0f32; COEFFICIENTS];
        for v in 0..HASH_SIZE {
            for u in 0..HASH_SIZE {
                let mut sum = 0.0f32;
                for (y, row) in rows.iter().enumerate() {
                    sum += row[u] * basis[v][y];
                }
                coefficients[v * HASH_SIZE + u] = sum;
            }
        }
        coefficients
    }
}

impl Default for HashService {
    fn default() -> Self {
        Self::new()
    }
}
