use image::{imageops::FilterType, DynamicImage, GenericImageView};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ThumbnailError {
    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },
}

/// Decodes and downscales images, keeping the results in a byte-capped
/// LRU cache keyed by path.
pub struct ThumbnailService {
    thumbnail_size: u32,
    cache: Cache<PathBuf, Arc<DynamicImage>>,
}

impl ThumbnailService {
    pub fn new(thumbnail_size: u32, capacity_bytes: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity_bytes)
            .weigher(|_path: &PathBuf, image: &Arc<DynamicImage>| {
                image.as_bytes().len().try_into().unwrap_or(u32::MAX)
            })
            .eviction_policy(EvictionPolicy::lru())
            .build();

        Self {
            thumbnail_size,
            cache,
        }
    }

    /// Return the cached thumbnail for `original_path`, decoding it on a miss.
    pub fn load_thumbnail(&self, original_path: &Path) -> Result<Arc<DynamicImage>, ThumbnailError> {
        if let Some(cached) = self.cache.get(original_path) {
            return Ok(cached);
        }

        if !original_path.exists() {
            return Err(ThumbnailError::InvalidPath {
                path: original_path.to_string_lossy().to_string(),
            });
        }

        let img = self.load_image(original_path)?;
        let thumbnail = Arc::new(self.resize_image(img, self.thumbnail_size));
        self.cache
            .insert(original_path.to_path_buf(), thumbnail.clone());
        Ok(thumbnail)
    }

    /// Drop every cached thumbnail.
    pub fn clear(&self) {
        self.cache.invalidate_all();
        self.cache.run_pending_tasks();
    }

    fn load_image(&self, path: &Path) -> Result<DynamicImage, ThumbnailError> {
        image::open(path).map_err(|e| match e {
            image::ImageError::Unsupported(_) => ThumbnailError::UnsupportedFormat {
                format: path
                    .extension()
                    .map(|ext| ext.to_string_lossy().to_string())
                    .unwrap_or_default(),
            },
            other => ThumbnailError::Image(other),
        })
    }

    fn resize_image(&self, img: DynamicImage, target_size: u32) -> DynamicImage {
        let (width, height) = img.dimensions();
        if width <= target_size && height <= target_size {
            return img;
        }

        let (new_width, new_height) = if width > height {
            let ratio = target_size as f32 / width as f32;
            (target_size, ((height as f32 * ratio) as u32).max(1))
        } else {
            let ratio = target_size as f32 / height as f32;
            (((width as f32 * ratio) as u32).max(1), target_size)
        };

        img.resize_exact(new_width, new_height, FilterType::Triangle)
    }
}

#[cfg(test)]
impl ThumbnailService {
    pub(crate) fn cached(&self, original_path: &Path) -> Option<Arc<DynamicImage>> {
        self.cache.get(original_path)
    }

    pub(crate) fn cached_count(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.entry_count()
    }

    pub(crate) fn cached_bytes(&self) -> u64 {
        self.cache.run_pending_tasks();
        self.cache.weighted_size()
    }
}
