// src/imaging/mod.rs
//! Target image loading
//!
//! The driver consumes a target image once at setup and again on every
//! reset or parameter change, always as RGBA8 at the current grid size.

use crate::utils::errors::{DriverError, Result};
use image::imageops::FilterType;
use std::path::PathBuf;
use tracing::debug;

/// Supplies target images as row-major RGBA8
pub trait ImageSource: Send + Sync {
    /// Load `source` scaled to `width × height`; returns `width × height × 4` bytes
    fn load_target_image(&self, source: &str, width: u32, height: u32) -> Result<Vec<u8>>;
}

/// Decodes images from disk with the `image` crate
#[derive(Debug, Clone, Default)]
pub struct FileImageSource {
    /// Directory relative sources are resolved against
    base_dir: Option<PathBuf>,
}

impl FileImageSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: Some(base_dir.into()),
        }
    }

    fn resolve(&self, source: &str) -> PathBuf {
        match &self.base_dir {
            Some(base) => base.join(source),
            None => PathBuf::from(source),
        }
    }
}

impl ImageSource for FileImageSource {
    fn load_target_image(&self, source: &str, width: u32, height: u32) -> Result<Vec<u8>> {
        let path = self.resolve(source);
        debug!("Loading target image {:?} at {}x{}", path, width, height);

        let img = image::open(&path)
            .map_err(|e| DriverError::ImageLoadFailed(format!("{}: {}", path.display(), e)))?;

        // smooth downscale, like drawing onto a canvas of the grid size
        let rgba = img.resize_exact(width, height, FilterType::Triangle).to_rgba8();
        let data = rgba.into_raw();

        let expected = width as usize * height as usize * 4;
        if data.len() != expected {
            return Err(DriverError::ImageLoadFailed(format!(
                "decoded {} bytes, expected {}",
                data.len(),
                expected
            )));
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_and_resize_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("target.png");
        image::RgbaImage::from_pixel(100, 80, image::Rgba([200, 10, 20, 255]))
            .save(&path)
            .unwrap();

        let source = FileImageSource::with_base_dir(dir.path());
        let data = source.load_target_image("target.png", 32, 32).unwrap();

        assert_eq!(data.len(), 32 * 32 * 4);
        assert_eq!(&data[..4], &[200, 10, 20, 255]);
    }

    #[test]
    fn test_missing_file() {
        let source = FileImageSource::new();
        let result = source.load_target_image("/definitely/not/here.png", 32, 32);
        assert!(matches!(result, Err(DriverError::ImageLoadFailed(_))));
    }
}
