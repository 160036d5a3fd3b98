//! Clipboard history entries

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Local, Utc};
use image::RgbaImage;
use tracing::warn;
use uuid::Uuid;

use super::image_cache::{self, ImageCache};
use super::secret::SecretString;
use super::HistoryError;

/// The four kinds of entry a history holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemKind {
    Text,
    Uris,
    Image,
    Password,
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            ItemKind::Text => "Text",
            ItemKind::Uris => "Uris",
            ItemKind::Image => "Image",
            ItemKind::Password => "Password",
        };
        f.write_str(tag)
    }
}

impl FromStr for ItemKind {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Text" => Ok(ItemKind::Text),
            "Uris" => Ok(ItemKind::Uris),
            "Image" => Ok(ItemKind::Image),
            "Password" => Ok(ItemKind::Password),
            other => Err(HistoryError::InvalidArgument(format!(
                "unknown item kind: {}",
                other
            ))),
        }
    }
}

/// A rich clipboard format carried next to the primary value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecialValue {
    pub mime: String,
    pub data: Vec<u8>,
}

/// Image payload: the side file plus a droppable pixel cache
#[derive(Debug, Clone)]
pub struct ImageData {
    path: PathBuf,
    checksum: String,
    date: DateTime<Utc>,
    width: u32,
    height: u32,
    stored: bool,
    pixels: Arc<Mutex<Option<Arc<RgbaImage>>>>,
}

impl ImageData {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn checksum(&self) -> &str {
        &self.checksum
    }

    pub fn date(&self) -> DateTime<Utc> {
        self.date
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Whether the side file was written successfully
    pub fn is_stored(&self) -> bool {
        self.stored
    }

    /// Whether decoded pixels are currently held in memory
    pub fn is_loaded(&self) -> bool {
        self.pixels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Decoded pixels, reloading them from the side file if they were evicted
    ///
    /// The returned `Arc` keeps the buffer alive even if
    /// [`ImageData::evict_cache`] runs while the caller is still reading.
    pub fn pixels(&self) -> Result<Arc<RgbaImage>, HistoryError> {
        let mut cache = self.pixels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pixels) = cache.as_ref() {
            return Ok(Arc::clone(pixels));
        }
        let pixels = Arc::new(image_cache::load(&self.path)?);
        *cache = Some(Arc::clone(&pixels));
        Ok(pixels)
    }

    /// Drop the decoded pixels; they are re-read on the next access
    pub fn evict_cache(&self) {
        self.pixels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    fn pixel_bytes(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height) * 4
    }
}

#[derive(Debug, Clone)]
enum Payload {
    Text(String),
    Uris(String),
    Image(ImageData),
    Password { name: String, secret: SecretString },
}

/// One clipboard history entry
#[derive(Debug, Clone)]
pub struct Item {
    uuid: Uuid,
    payload: Payload,
    display: Option<String>,
    specials: Vec<SpecialValue>,
    size: u64,
}

impl Item {
    fn build(payload: Payload, display: Option<String>) -> Self {
        let mut item = Self {
            uuid: Uuid::new_v4(),
            payload,
            display,
            specials: Vec::new(),
            size: 0,
        };
        item.recompute_size();
        item
    }

    pub fn new_text(value: impl Into<String>) -> Self {
        Self::build(Payload::Text(value.into()), None)
    }

    /// `value` is a newline-separated URI list
    pub fn new_uris(value: impl Into<String>) -> Self {
        let value = value.into();
        let display = uris_display(&value);
        Self::build(Payload::Uris(value), Some(display))
    }

    pub fn new_password(name: impl Into<String>, value: String) -> Self {
        let name = name.into();
        let display = password_display(&name);
        Self::build(
            Payload::Password {
                name,
                secret: SecretString::new(value),
            },
            Some(display),
        )
    }

    /// Build an image entry from encoded image bytes
    ///
    /// The pixels are decoded, hashed and written to `<cache>/<checksum>.png`.
    /// A failed side-file write is logged and the item is still returned;
    /// such an item is never persisted.
    pub fn new_image(bytes: &[u8], cache: &ImageCache) -> Result<Self, HistoryError> {
        let pixels = image_cache::decode(bytes)?;
        let checksum = image_cache::checksum(&pixels);
        let path = cache.path_for(&checksum);
        let stored = match cache.store(&checksum, &pixels) {
            Ok(_) => true,
            Err(e) => {
                warn!("Failed to write image side file {:?}: {}", path, e);
                false
            }
        };

        let date = Utc::now();
        let (width, height) = pixels.dimensions();
        let data = ImageData {
            path,
            checksum,
            date,
            width,
            height,
            stored,
            pixels: Arc::new(Mutex::new(Some(Arc::new(pixels)))),
        };
        let display = image_display(&data);
        Ok(Self::build(Payload::Image(data), Some(display)))
    }

    /// Reference an image side file without decoding it
    ///
    /// Used when loading a history; a missing file yields zero dimensions.
    pub fn image_reference(path: PathBuf, checksum: String, date: DateTime<Utc>) -> Self {
        let (width, height) = image_cache::dimensions(&path).unwrap_or((0, 0));
        let data = ImageData {
            path,
            checksum,
            date,
            width,
            height,
            stored: true,
            pixels: Arc::new(Mutex::new(None)),
        };
        let display = image_display(&data);
        Self::build(Payload::Image(data), Some(display))
    }

    /// Same entry under a given identity
    pub fn with_uuid(mut self, uuid: Uuid) -> Self {
        self.uuid = uuid;
        self
    }

    /// Turn a text entry into a password entry, keeping its identity
    pub fn into_password(self, name: impl Into<String>) -> Result<Self, HistoryError> {
        let kind = self.kind();
        let uuid = self.uuid;
        match self.payload {
            Payload::Text(value) => Ok(Self::new_password(name, value).with_uuid(uuid)),
            _ => Err(HistoryError::InvalidArgument(format!(
                "only text items can become passwords, got {}",
                kind
            ))),
        }
    }

    /// Same password under a new name
    pub fn renamed_password(&self, name: impl Into<String>) -> Result<Self, HistoryError> {
        match &self.payload {
            Payload::Password { secret, .. } => {
                Ok(Self::new_password(name, secret.expose().to_string()).with_uuid(self.uuid))
            }
            _ => Err(HistoryError::InvalidArgument(format!(
                "{} item is not a password",
                self.uuid
            ))),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn kind(&self) -> ItemKind {
        match self.payload {
            Payload::Text(_) => ItemKind::Text,
            Payload::Uris(_) => ItemKind::Uris,
            Payload::Image(_) => ItemKind::Image,
            Payload::Password { .. } => ItemKind::Password,
        }
    }

    /// Primary value; passwords yield their redacted placeholder
    pub fn value(&self) -> &str {
        match &self.payload {
            Payload::Text(v) | Payload::Uris(v) => v,
            Payload::Image(data) => data.path.to_str().unwrap_or_default(),
            Payload::Password { .. } => self.display.as_deref().unwrap_or_default(),
        }
    }

    /// The value pushed to the clipboard, including password secrets
    pub fn real_value(&self) -> &str {
        match &self.payload {
            Payload::Password { secret, .. } => secret.expose(),
            _ => self.value(),
        }
    }

    pub fn display_value(&self) -> &str {
        self.display.as_deref().unwrap_or_else(|| self.value())
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn special_values(&self) -> &[SpecialValue] {
        &self.specials
    }

    pub fn image(&self) -> Option<&ImageData> {
        match &self.payload {
            Payload::Image(data) => Some(data),
            _ => None,
        }
    }

    pub fn password_name(&self) -> Option<&str> {
        match &self.payload {
            Payload::Password { name, .. } => Some(name),
            _ => None,
        }
    }

    /// URIs of a `Uris` entry, one per line
    pub fn uris(&self) -> Vec<&str> {
        match &self.payload {
            Payload::Uris(v) => v.lines().filter(|l| !l.is_empty()).collect(),
            _ => Vec::new(),
        }
    }

    /// Attach a rich format; a second value for the same mime replaces the first
    pub fn add_special_value(
        &mut self,
        mime: impl Into<String>,
        data: Vec<u8>,
    ) -> Result<(), HistoryError> {
        if !matches!(self.payload, Payload::Text(_) | Payload::Uris(_)) {
            return Err(HistoryError::InvalidArgument(format!(
                "{} items do not carry special values",
                self.kind()
            )));
        }
        let mime = mime.into();
        match self.specials.iter_mut().find(|s| s.mime == mime) {
            Some(existing) => existing.data = data,
            None => self.specials.push(SpecialValue { mime, data }),
        }
        self.recompute_size();
        Ok(())
    }

    /// Content equality used for deduplication
    ///
    /// Images compare by pixel checksum since two side files can hold the
    /// same pixels.
    pub fn equals(&self, other: &Item) -> bool {
        match (&self.payload, &other.payload) {
            (Payload::Text(a), Payload::Text(b)) => a == b,
            (Payload::Uris(a), Payload::Uris(b)) => a == b,
            (Payload::Image(a), Payload::Image(b)) => a.checksum == b.checksum,
            (
                Payload::Password { secret: a, .. },
                Payload::Password { secret: b, .. },
            ) => a == b,
            _ => false,
        }
    }

    fn recompute_size(&mut self) {
        let base = match &self.payload {
            Payload::Text(v) | Payload::Uris(v) => v.len() as u64,
            Payload::Image(data) => {
                data.path.as_os_str().len() as u64 + data.pixel_bytes()
            }
            Payload::Password { name, secret } => (name.len() + secret.len()) as u64,
        };
        let display = self.display.as_ref().map_or(0, |d| d.len() as u64);
        let specials: u64 = self.specials.iter().map(|s| s.data.len() as u64).sum();
        self.size = base + display + specials;
    }
}

fn uris_display(value: &str) -> String {
    let files: Vec<String> = value
        .lines()
        .filter(|l| !l.is_empty())
        .map(|uri| {
            let path = uri.strip_prefix("file://").unwrap_or(uri);
            match dirs::home_dir() {
                Some(home) => shorten_home(path, &home),
                None => path.to_string(),
            }
        })
        .collect();
    format!("[Files] {}", files.join(" "))
}

/// `~/rest` when `path` lies under `home`, compared by path components
fn shorten_home(path: &str, home: &Path) -> String {
    match Path::new(path).strip_prefix(home) {
        Ok(rest) if rest.as_os_str().is_empty() => "~".to_string(),
        Ok(rest) => format!("~/{}", rest.display()),
        Err(_) => path.to_string(),
    }
}

fn password_display(name: &str) -> String {
    format!("[Password] {}", name)
}

fn image_display(data: &ImageData) -> String {
    format!(
        "[Image, {} x {} ({})]",
        data.width,
        data.height,
        data.date.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use tempfile::TempDir;

    fn png(width: u32, height: u32, color: [u8; 4]) -> Vec<u8> {
        image_cache::encode_png(&RgbaImage::from_pixel(width, height, Rgba(color))).unwrap()
    }

    #[test]
    fn test_text_item() {
        let item = Item::new_text("hello");
        assert_eq!(item.kind(), ItemKind::Text);
        assert_eq!(item.value(), "hello");
        assert_eq!(item.display_value(), "hello");
        assert_eq!(item.size(), 5);
    }

    #[test]
    fn test_uuids_are_unique() {
        assert_ne!(Item::new_text("a").uuid(), Item::new_text("a").uuid());
    }

    #[test]
    fn test_equality_is_kind_and_value() {
        let text = Item::new_text("same");
        let uris = Item::new_uris("same");
        assert!(text.equals(&Item::new_text("same")));
        assert!(!text.equals(&uris));
        assert!(!uris.equals(&text));
        assert!(!text.equals(&Item::new_text("different")));
    }

    #[test]
    fn test_special_values_grow_size() {
        let mut item = Item::new_text("plain");
        item.add_special_value("text/html", b"<b>plain</b>".to_vec()).unwrap();
        assert_eq!(item.size(), 5 + 12);

        item.add_special_value("text/html", b"<i>p</i>".to_vec()).unwrap();
        assert_eq!(item.special_values().len(), 1);
        assert_eq!(item.size(), 5 + 8);
    }

    #[test]
    fn test_special_values_rejected_on_passwords() {
        let mut item = Item::new_password("mail", "secret".to_string());
        assert!(item.add_special_value("text/html", vec![1]).is_err());
    }

    #[test]
    fn test_password_is_redacted() {
        let item = Item::new_password("mail", "s3cr3t".to_string());
        assert_eq!(item.kind(), ItemKind::Password);
        assert_eq!(item.value(), "[Password] mail");
        assert_eq!(item.real_value(), "s3cr3t");
        assert_eq!(item.password_name(), Some("mail"));
        assert!(!format!("{:?}", item).contains("s3cr3t"));
    }

    #[test]
    fn test_into_password_keeps_uuid() {
        let text = Item::new_text("token");
        let uuid = text.uuid();
        let password = text.into_password("api").unwrap();
        assert_eq!(password.uuid(), uuid);
        assert_eq!(password.real_value(), "token");
        assert!(Item::new_uris("file:///tmp").into_password("x").is_err());
    }

    #[test]
    fn test_uris_display() {
        let item = Item::new_uris("file:///tmp/a.txt\nfile:///tmp/b.txt");
        assert_eq!(item.display_value(), "[Files] /tmp/a.txt /tmp/b.txt");
        assert_eq!(item.uris(), vec!["file:///tmp/a.txt", "file:///tmp/b.txt"]);
    }

    #[test]
    fn test_home_is_shortened_by_component() {
        let home = Path::new("/home/user");
        assert_eq!(shorten_home("/home/user/notes.txt", home), "~/notes.txt");
        assert_eq!(shorten_home("/home/user", home), "~");
        assert_eq!(shorten_home("/home/user2/x", home), "/home/user2/x");
    }

    #[test]
    fn test_image_item() {
        let dir = TempDir::new().unwrap();
        let cache = ImageCache::new(dir.path());
        let item = Item::new_image(&png(8, 6, [1, 2, 3, 255]), &cache).unwrap();

        let data = item.image().unwrap();
        assert!(data.is_stored());
        assert!(data.path().exists());
        assert_eq!(data.dimensions(), (8, 6));
        assert!(item.display_value().starts_with("[Image, 8 x 6 ("));
        assert!(item.size() >= 8 * 6 * 4);
    }

    #[test]
    fn test_image_equality_by_checksum() {
        let dir = TempDir::new().unwrap();
        let cache = ImageCache::new(dir.path());
        let a = Item::new_image(&png(3, 3, [7, 7, 7, 255]), &cache).unwrap();
        let b = Item::new_image(&png(3, 3, [7, 7, 7, 255]), &cache).unwrap();
        let c = Item::new_image(&png(3, 3, [8, 8, 8, 255]), &cache).unwrap();
        assert!(a.equals(&b));
        assert!(b.equals(&a));
        assert!(!a.equals(&c));
    }

    #[test]
    fn test_image_cache_eviction_and_reload() {
        let dir = TempDir::new().unwrap();
        let cache = ImageCache::new(dir.path());
        let item = Item::new_image(&png(2, 2, [5, 5, 5, 255]), &cache).unwrap();
        let data = item.image().unwrap();
        let size = item.size();

        let held = data.pixels().unwrap();
        data.evict_cache();
        assert!(!data.is_loaded());
        assert_eq!(held.dimensions(), (2, 2));

        let reloaded = data.pixels().unwrap();
        assert_eq!(*reloaded, *held);
        assert!(data.is_loaded());
        assert_eq!(item.size(), size);
    }

    #[test]
    fn test_image_side_file_write_failure_is_not_fatal() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("blocked");
        std::fs::write(&blocker, b"file, not a directory").unwrap();
        let cache = ImageCache::new(&blocker);

        let item = Item::new_image(&png(2, 2, [1, 1, 1, 255]), &cache).unwrap();
        let data = item.image().unwrap();
        assert!(!data.is_stored());
        assert!(item.display_value().starts_with("[Image, 2 x 2"));
    }

    #[test]
    fn test_kind_tags() {
        for kind in [ItemKind::Text, ItemKind::Uris, ItemKind::Image, ItemKind::Password] {
            assert_eq!(kind.to_string().parse::<ItemKind>().unwrap(), kind);
        }
        assert!("Bogus".parse::<ItemKind>().is_err());
    }
}
