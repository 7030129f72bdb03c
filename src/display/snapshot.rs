//! PNG dumps of the detector input, for checking crop and orientation

use std::path::{Path, PathBuf};

use image::ExtendedColorType;
use thiserror::Error;
use tracing::info;

use crate::pipeline::PreprocessedImage;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to create snapshot directory: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] image::ImageError),
    #[error("image holds {actual} bytes, expected {expected}")]
    Size { expected: usize, actual: usize },
}

/// Write `image` as `frame-<sequence>.png` under `dir`, creating it if needed.
pub fn save_snapshot(image: &PreprocessedImage, dir: &Path) -> Result<PathBuf, SnapshotError> {
    let expected = image.size as usize * image.size as usize * 3;
    if image.pixels.len() != expected {
        return Err(SnapshotError::Size {
            expected,
            actual: image.pixels.len(),
        });
    }
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("frame-{:06}.png", image.sequence));
    image::save_buffer(
        &path,
        &image.pixels,
        image.size,
        image.size,
        ExtendedColorType::Rgb8,
    )?;
    info!("Saved snapshot to {}", path.display());
    Ok(path)
}
