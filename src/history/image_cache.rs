//! Image decoding, content checksums and the side-file cache

use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbaImage};
use sha2::{Digest, Sha256};
use tracing::debug;

use super::HistoryError;

/// Directory name of the image cache under the data directory
pub const IMAGES_DIR: &str = "images";

/// Content-addressed store of PNG side files
#[derive(Debug, Clone)]
pub struct ImageCache {
    dir: PathBuf,
}

impl ImageCache {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join(IMAGES_DIR),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, checksum: &str) -> PathBuf {
        self.dir.join(format!("{}.png", checksum))
    }

    /// Whether `path` names a side file directly inside the cache
    pub fn contains(&self, path: &Path) -> bool {
        path.parent() == Some(self.dir.as_path())
            && path.extension().is_some_and(|ext| ext == "png")
    }

    /// The existing side file for `checksum`, if any
    pub fn cached(&self, checksum: &str) -> Option<PathBuf> {
        if checksum.is_empty() || !checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let path = self.path_for(checksum);
        path.is_file().then_some(path)
    }

    /// Write the side file for `checksum` unless it already exists
    ///
    /// Files are only ever created whole: the PNG is written next to its
    /// final name and renamed into place, so racing writers of the same
    /// checksum leave identical content behind.
    pub fn store(&self, checksum: &str, pixels: &RgbaImage) -> Result<PathBuf, HistoryError> {
        let path = self.path_for(checksum);
        if path.exists() {
            debug!("Reusing image side file {:?}", path);
            return Ok(path);
        }

        std::fs::create_dir_all(&self.dir)?;
        let png = encode_png(pixels)?;
        let tmp = self
            .dir
            .join(format!(".{}.{}.tmp", checksum, uuid::Uuid::new_v4().simple()));
        std::fs::write(&tmp, png)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(path)
    }
}

/// Decode any supported encoded image into RGBA pixels
pub fn decode(bytes: &[u8]) -> Result<RgbaImage, HistoryError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgba8())
        .map_err(|e| HistoryError::InvalidArgument(format!("undecodable image: {}", e)))
}

/// Load the pixels of a side file
pub fn load(path: &Path) -> Result<RgbaImage, HistoryError> {
    let bytes = std::fs::read(path)?;
    decode(&bytes)
}

/// Width and height of a side file without decoding the pixels
pub fn dimensions(path: &Path) -> Option<(u32, u32)> {
    image::image_dimensions(path).ok()
}

pub fn encode_png(pixels: &RgbaImage) -> Result<Vec<u8>, HistoryError> {
    let mut buf = Cursor::new(Vec::new());
    pixels
        .write_to(&mut buf, ImageFormat::Png)
        .map_err(|e| HistoryError::Unavailable(format!("PNG encoding failed: {}", e)))?;
    Ok(buf.into_inner())
}

/// SHA-256 of the decoded pixels, hex encoded
///
/// Dimensions are hashed too so that two buffers with the same bytes but a
/// different shape do not collide.
pub fn checksum(pixels: &RgbaImage) -> String {
    let mut hasher = Sha256::new();
    hasher.update(pixels.width().to_le_bytes());
    hasher.update(pixels.height().to_le_bytes());
    hasher.update(pixels.as_raw());
    hex::encode(hasher.finalize())
}
