//! On-disk layout of named histories
//!
//! ```text
//! <data-dir>/
//!   <name>/history.xml
//!   images/<checksum>.png
//! ```

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::codec::{self, DecodeOptions, Decoded, EncodeOptions};
use super::image_cache::{ImageCache, IMAGES_DIR};
use super::item::Item;
use super::HistoryError;

pub const HISTORY_FILE: &str = "history.xml";
const CORRUPT_SUFFIX: &str = "corrupt";

/// Check that `name` can be used as a history directory
pub fn validate_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("name cannot be empty".to_string());
    }
    if name == IMAGES_DIR {
        return Err(format!("{:?} is reserved", IMAGES_DIR));
    }
    if name.starts_with('.') {
        return Err("name cannot start with '.'".to_string());
    }
    if name.contains(['/', '\\', '\0']) {
        return Err("name cannot contain path separators".to_string());
    }
    if name.len() > 255 {
        return Err("name is too long".to_string());
    }
    Ok(())
}

fn check_name(name: &str) -> Result<(), HistoryError> {
    validate_name(name)
        .map_err(|e| HistoryError::InvalidArgument(format!("history name {:?}: {}", name, e)))
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SaveOptions {
    /// When false the history file is removed instead of written
    pub enabled: bool,
    pub save_passwords: bool,
}

/// Reads and writes history documents under a data directory
///
/// Writes to the same name are serialized and carry a sequence number; a
/// write older than the last one completed for that name is dropped.
#[derive(Debug)]
pub struct Storage {
    data_dir: PathBuf,
    images: ImageCache,
    written: Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<u64>>>>>,
}

impl Storage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            images: ImageCache::new(&data_dir),
            data_dir,
            written: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn images(&self) -> &ImageCache {
        &self.images
    }

    pub fn history_path(&self, name: &str) -> PathBuf {
        self.data_dir.join(name).join(HISTORY_FILE)
    }

    pub fn exists(&self, name: &str) -> bool {
        self.history_path(name).is_file()
    }

    /// Read a history; a missing file is an empty history
    ///
    /// An unusable document is moved aside to `history.xml.corrupt` and an
    /// empty history is returned in its place.
    pub async fn load(&self, name: &str, max_items: usize) -> Result<Decoded, HistoryError> {
        check_name(name)?;
        let path = self.history_path(name);

        let mut decoded = tokio::task::spawn_blocking(move || {
            let bytes = match std::fs::read(&path) {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    debug!("No history file at {:?}", path);
                    return Ok(Decoded::empty());
                }
                Err(e) => return Err(HistoryError::from(e)),
            };

            let document = String::from_utf8_lossy(&bytes);
            match codec::decode(&document, &DecodeOptions { max_items }) {
                Ok(decoded) => {
                    info!(
                        "Loaded {} items from {:?} ({} skipped)",
                        decoded.items.len(),
                        path,
                        decoded.skipped
                    );
                    Ok(decoded)
                }
                Err(e) => {
                    warn!("History {:?} is unreadable, starting empty: {}", path, e);
                    let aside = path.with_extension(format!("xml.{}", CORRUPT_SUFFIX));
                    if let Err(e) = std::fs::rename(&path, &aside) {
                        warn!("Failed to move {:?} aside: {}", path, e);
                    }
                    Ok(Decoded::empty())
                }
            }
        })
        .await??;

        self.adopt_images(&mut decoded);
        Ok(decoded)
    }

    /// Point images referenced outside the cache at the cached copy
    ///
    /// Without a cached copy the outside path is kept for display but is
    /// never deleted, see [`Storage::remove_side_file`].
    fn adopt_images(&self, decoded: &mut Decoded) {
        for item in decoded.items.iter_mut() {
            let Some(image) = item.image() else { continue };
            if self.images.contains(image.path()) {
                continue;
            }
            let Some(path) = self.images.cached(image.checksum()) else {
                debug!("Image {:?} lies outside the image cache", image.path());
                continue;
            };
            let adopted = Item::image_reference(path, image.checksum().to_string(), image.date())
                .with_uuid(item.uuid());
            *item = adopted;
        }
    }

    /// Write `items` as history `name`
    ///
    /// Returns `false` when the write was skipped because a newer one for the
    /// same name already completed.
    pub async fn save(
        &self,
        name: &str,
        items: Vec<Arc<Item>>,
        seq: u64,
        options: SaveOptions,
    ) -> Result<bool, HistoryError> {
        check_name(name)?;
        let guard = self.write_lock(name);
        let mut last = guard.lock().await;
        if matches!(*last, Some(done) if done >= seq) {
            debug!("Skipping stale write of history {} ({})", name, seq);
            return Ok(false);
        }

        let path = self.history_path(name);
        if options.enabled {
            let encode_options = EncodeOptions {
                save_passwords: options.save_passwords,
            };
            let document = tokio::task::spawn_blocking(move || {
                codec::encode(items.iter().map(AsRef::as_ref), &encode_options)
            })
            .await?;
            write_atomic(&path, document.as_bytes()).await?;
            debug!("Saved history {} to {:?}", name, path);
        } else {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!("Removed history file {:?}", path),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        *last = Some(seq);
        Ok(true)
    }

    /// Remove a history and its directory
    pub async fn delete(&self, name: &str) -> Result<(), HistoryError> {
        check_name(name)?;
        let guard = self.write_lock(name);
        let _held = guard.lock().await;

        match tokio::fs::remove_dir_all(self.data_dir.join(name)).await {
            Ok(()) => {
                info!("Deleted history {}", name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(HistoryError::NotFound(format!("history {}", name)))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Names of all histories with a file on disk, sorted
    pub async fn list(&self) -> Result<Vec<String>, HistoryError> {
        let mut entries = match tokio::fs::read_dir(&self.data_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if validate_name(&name).is_ok() && self.exists(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    /// Best-effort removal of an image side file
    ///
    /// Only files inside the image cache are ever deleted.
    pub async fn remove_side_file(&self, path: &Path) {
        if !self.images.contains(path) {
            debug!("Leaving {:?} in place, it is not in the image cache", path);
            return;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => debug!("Removed image side file {:?}", path),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove image side file {:?}: {}", path, e),
        }
    }

    fn write_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<Option<u64>>> {
        let mut locks = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(name.to_string()).or_default())
    }
}

/// Replace `path` with `contents` so readers see either the old or new file
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), HistoryError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("xml.tmp");

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ON: SaveOptions = SaveOptions {
        enabled: true,
        save_passwords: false,
    };

    fn items(values: &[&str]) -> Vec<Arc<Item>> {
        values.iter().map(|v| Arc::new(Item::new_text(*v))).collect()
    }

    fn values(decoded: &Decoded) -> Vec<&str> {
        decoded.items.iter().map(|i| i.value()).collect()
    }

    #[test]
    fn test_validate_name() {
        assert!(validate_name("history").is_ok());
        assert!(validate_name("work stuff").is_ok());
        for bad in ["", "images", ".", "..", ".hidden", "a/b", "a\\b", "nul\0"] {
            assert!(validate_name(bad).is_err(), "{:?} accepted", bad);
        }
    }

    #[tokio::test]
    async fn test_missing_history_loads_empty() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let decoded = storage.load("history", usize::MAX).await.unwrap();
        assert!(decoded.items.is_empty());
        assert!(!decoded.needs_migration());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        assert!(storage.save("history", items(&["a", "b"]), 1, ON).await.unwrap());
        assert!(dir.path().join("history").join(HISTORY_FILE).is_file());

        let decoded = storage.load("history", usize::MAX).await.unwrap();
        assert_eq!(values(&decoded), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_stale_write_is_dropped() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        assert!(storage.save("history", items(&["new"]), 5, ON).await.unwrap());
        assert!(!storage.save("history", items(&["old"]), 4, ON).await.unwrap());

        let decoded = storage.load("history", usize::MAX).await.unwrap();
        assert_eq!(values(&decoded), vec!["new"]);
    }

    #[tokio::test]
    async fn test_disabled_save_removes_file() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        storage.save("history", items(&["a"]), 1, ON).await.unwrap();
        storage
            .save("history", items(&["a"]), 2, SaveOptions::default())
            .await
            .unwrap();
        assert!(!storage.exists("history"));
    }

    #[tokio::test]
    async fn test_corrupt_file_is_moved_aside() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        let path = storage.history_path("history");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"\x00\x01 not xml at all").unwrap();

        let decoded = storage.load("history", usize::MAX).await.unwrap();
        assert!(decoded.items.is_empty());
        assert!(!path.exists());
        assert!(path.with_extension("xml.corrupt").exists());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());

        storage.save("work", items(&["w"]), 1, ON).await.unwrap();
        storage.save("history", items(&["h"]), 2, ON).await.unwrap();
        std::fs::create_dir_all(dir.path().join("images")).unwrap();
        std::fs::create_dir_all(dir.path().join("empty-dir")).unwrap();

        assert_eq!(storage.list().await.unwrap(), vec!["history", "work"]);

        storage.delete("work").await.unwrap();
        assert_eq!(storage.list().await.unwrap(), vec!["history"]);
        assert!(matches!(
            storage.delete("work").await,
            Err(HistoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::new(dir.path());
        assert!(matches!(
            storage.load("../escape", 10).await,
            Err(HistoryError::InvalidArgument(_))
        ));
        assert!(matches!(
            storage.save("images", Vec::new(), 1, ON).await,
            Err(HistoryError::InvalidArgument(_))
        ));
    }
}
