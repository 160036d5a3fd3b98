//! Desktop clipboard through `arboard`
//!
//! `arboard` has no change notifications, so a background task polls the
//! selection and compares MD5 fingerprints of its content. Content we
//! wrote ourselves is fingerprinted before the write; a change whose
//! fingerprint matches it is reported as ours.
//!
//! The backend renders content eagerly: the data callback passed to
//! `write_and_own` is not used, and only plain text, URI lists (as text)
//! and images can be read.

use std::borrow::Cow;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arboard::ImageData;
use async_trait::async_trait;
use bytes::Bytes;
use image::RgbaImage;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[cfg(target_os = "linux")]
use arboard::{GetExtLinux, LinuxClipboardKind, SetExtLinux};

use super::{
    looks_like_uri_list, parse_uri_list, ClipboardAdapter, ClipboardError, Content, DataCallback,
    FormatTag, OwnershipChange, Selection, EVENT_CAPACITY,
};
use crate::history::image_cache;

type Fingerprint = md5::Digest;

/// A selection of the desktop clipboard
pub struct SystemSelection {
    selection: Selection,
    clipboard: Arc<Mutex<arboard::Clipboard>>,
    last_written: Arc<Mutex<Option<Fingerprint>>>,
    events: broadcast::Sender<OwnershipChange>,
    poller: JoinHandle<()>,
}

impl SystemSelection {
    /// Connect to the desktop clipboard and start polling `selection`
    ///
    /// Must be called inside a tokio runtime. The primary selection is only
    /// available on Linux.
    pub fn new(selection: Selection, poll_interval: Duration) -> Result<Self, ClipboardError> {
        if selection == Selection::Primary && !cfg!(target_os = "linux") {
            return Err(ClipboardError::UnsupportedType(
                "primary selection is only available on Linux".to_string(),
            ));
        }

        let clipboard = arboard::Clipboard::new().map_err(backend_error)?;
        let clipboard = Arc::new(Mutex::new(clipboard));
        let last_written = Arc::new(Mutex::new(None));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let poller = tokio::spawn(poll_loop(
            Arc::clone(&clipboard),
            selection,
            poll_interval,
            Arc::clone(&last_written),
            events.clone(),
        ));
        info!(
            "Watching the {} selection every {}ms",
            selection,
            poll_interval.as_millis()
        );

        Ok(Self {
            selection,
            clipboard,
            last_written,
            events,
            poller,
        })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, ClipboardError>
    where
        F: FnOnce(&mut arboard::Clipboard, Selection) -> Result<T, arboard::Error>
            + Send
            + 'static,
        T: Send + 'static,
    {
        let clipboard = Arc::clone(&self.clipboard);
        let selection = self.selection;
        tokio::task::spawn_blocking(move || {
            let mut guard = clipboard.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard, selection)
        })
        .await
        .map_err(|e| ClipboardError::Platform(format!("clipboard worker failed: {}", e)))?
        .map_err(backend_error)
    }
}

impl Drop for SystemSelection {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl ClipboardAdapter for SystemSelection {
    fn selection(&self) -> Selection {
        self.selection
    }

    fn name(&self) -> &str {
        "arboard"
    }

    async fn available_formats(&self) -> Result<Vec<FormatTag>, ClipboardError> {
        self.run(|cb, selection| {
            if let Some(text) = get_text(cb, selection)? {
                return Ok(if looks_like_uri_list(&text) {
                    vec![FormatTag::Uris, FormatTag::Text]
                } else {
                    vec![FormatTag::Text]
                });
            }
            if get_image(cb, selection)?.is_some() {
                return Ok(vec![FormatTag::Image]);
            }
            Ok(Vec::new())
        })
        .await
    }

    async fn read_text(&self) -> Result<Option<String>, ClipboardError> {
        self.run(get_text).await
    }

    async fn read_uris(&self) -> Result<Option<Vec<String>>, ClipboardError> {
        let text = self.run(get_text).await?;
        Ok(text
            .filter(|t| looks_like_uri_list(t))
            .map(|t| parse_uri_list(&t)))
    }

    async fn read_image(&self) -> Result<Option<Bytes>, ClipboardError> {
        let Some(image) = self.run(get_image).await? else {
            return Ok(None);
        };
        let (width, height) = (image.width as u32, image.height as u32);
        let Some(pixels) = RgbaImage::from_raw(width, height, image.bytes.into_owned()) else {
            debug!("Clipboard image has inconsistent dimensions");
            return Ok(None);
        };
        let png = image_cache::encode_png(&pixels)
            .map_err(|e| ClipboardError::Platform(e.to_string()))?;
        Ok(Some(Bytes::from(png)))
    }

    async fn read_special(&self, mime: &str) -> Result<Option<Bytes>, ClipboardError> {
        debug!("{} cannot be read from the {} backend", mime, self.name());
        Ok(None)
    }

    async fn write_and_own(
        &self,
        content: Content,
        _on_data_requested: Option<DataCallback>,
    ) -> Result<(), ClipboardError> {
        let payload = match content {
            Content::Text(text) => Payload::Text(text),
            Content::Uris(uris) => Payload::Text(uris.join("\n")),
            Content::Image(bytes) => {
                let pixels = image_cache::decode(&bytes)
                    .map_err(|e| ClipboardError::UnsupportedType(e.to_string()))?;
                Payload::Image(pixels)
            }
        };

        // Recorded first so the poller can never observe the write unmarked
        *self
            .last_written
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(payload.fingerprint());

        self.run(move |cb, selection| match payload {
            Payload::Text(text) => set_text(cb, selection, text),
            Payload::Image(pixels) => {
                let (width, height) = pixels.dimensions();
                let image = ImageData {
                    width: width as usize,
                    height: height as usize,
                    bytes: Cow::Owned(pixels.into_raw()),
                };
                set_image(cb, selection, image)
            }
        })
        .await
    }

    async fn clear(&self) -> Result<(), ClipboardError> {
        self.run(|cb, selection| set_text(cb, selection, String::new()))
            .await
    }

    fn subscribe(&self) -> broadcast::Receiver<OwnershipChange> {
        self.events.subscribe()
    }
}

enum Payload {
    Text(String),
    Image(RgbaImage),
}

impl Payload {
    fn fingerprint(&self) -> Fingerprint {
        match self {
            Payload::Text(text) => fingerprint(b'T', text.as_bytes()),
            Payload::Image(pixels) => fingerprint(b'I', pixels.as_raw()),
        }
    }
}

fn fingerprint(tag: u8, data: &[u8]) -> Fingerprint {
    let mut ctx = md5::Context::new();
    ctx.consume([tag]);
    ctx.consume(data);
    ctx.compute()
}

fn current_fingerprint(
    cb: &mut arboard::Clipboard,
    selection: Selection,
) -> Result<Option<Fingerprint>, arboard::Error> {
    if let Some(text) = get_text(cb, selection)? {
        if !text.is_empty() {
            return Ok(Some(fingerprint(b'T', text.as_bytes())));
        }
    }
    Ok(get_image(cb, selection)?.map(|image| fingerprint(b'I', &image.bytes)))
}

async fn poll_loop(
    clipboard: Arc<Mutex<arboard::Clipboard>>,
    selection: Selection,
    interval: Duration,
    last_written: Arc<Mutex<Option<Fingerprint>>>,
    events: broadcast::Sender<OwnershipChange>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The content present at startup is a baseline, not a change
    let mut last_seen: Option<Option<Fingerprint>> = None;

    loop {
        ticker.tick().await;

        let cb = Arc::clone(&clipboard);
        let current = match tokio::task::spawn_blocking(move || {
            let mut guard = cb.lock().unwrap_or_else(PoisonError::into_inner);
            current_fingerprint(&mut guard, selection)
        })
        .await
        {
            Ok(Ok(current)) => current,
            Ok(Err(e)) => {
                debug!("Polling the {} selection failed: {}", selection, e);
                continue;
            }
            Err(_) => break,
        };

        if last_seen.as_ref() == Some(&current) {
            continue;
        }
        let baseline = last_seen.is_none();
        last_seen = Some(current);
        if baseline {
            continue;
        }

        let ours = is_echo(&last_written, current);
        let _ = events.send(OwnershipChange {
            selection,
            new_owner: current.is_some(),
            ours,
        });
    }
}

/// Whether a change is the echo of our own last write
///
/// The first change seen after a write consumes its fingerprint, so copying
/// the same content again later from another application is recorded.
fn is_echo(last_written: &Mutex<Option<Fingerprint>>, current: Option<Fingerprint>) -> bool {
    let written = last_written
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    current.is_some() && written == current
}

fn absent<T>(result: Result<T, arboard::Error>) -> Result<Option<T>, arboard::Error> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(arboard::Error::ContentNotAvailable) => Ok(None),
        Err(e) => Err(e),
    }
}

fn backend_error(e: arboard::Error) -> ClipboardError {
    match e {
        arboard::Error::ClipboardOccupied | arboard::Error::ClipboardNotSupported => {
            ClipboardError::Unavailable(e.to_string())
        }
        other => ClipboardError::Platform(other.to_string()),
    }
}

#[cfg(target_os = "linux")]
fn kind(selection: Selection) -> LinuxClipboardKind {
    match selection {
        Selection::Clipboard => LinuxClipboardKind::Clipboard,
        Selection::Primary => LinuxClipboardKind::Primary,
    }
}

#[cfg(target_os = "linux")]
fn get_text(cb: &mut arboard::Clipboard, selection: Selection) -> Result<Option<String>, arboard::Error> {
    absent(cb.get().clipboard(kind(selection)).text())
}

#[cfg(not(target_os = "linux"))]
fn get_text(cb: &mut arboard::Clipboard, _selection: Selection) -> Result<Option<String>, arboard::Error> {
    absent(cb.get_text())
}

#[cfg(target_os = "linux")]
fn get_image(
    cb: &mut arboard::Clipboard,
    selection: Selection,
) -> Result<Option<ImageData<'static>>, arboard::Error> {
    absent(cb.get().clipboard(kind(selection)).image())
}

#[cfg(not(target_os = "linux"))]
fn get_image(
    cb: &mut arboard::Clipboard,
    _selection: Selection,
) -> Result<Option<ImageData<'static>>, arboard::Error> {
    absent(cb.get_image())
}

#[cfg(target_os = "linux")]
fn set_text(cb: &mut arboard::Clipboard, selection: Selection, text: String) -> Result<(), arboard::Error> {
    cb.set().clipboard(kind(selection)).text(text)
}

#[cfg(not(target_os = "linux"))]
fn set_text(cb: &mut arboard::Clipboard, _selection: Selection, text: String) -> Result<(), arboard::Error> {
    cb.set_text(text)
}

#[cfg(target_os = "linux")]
fn set_image(
    cb: &mut arboard::Clipboard,
    selection: Selection,
    image: ImageData<'static>,
) -> Result<(), arboard::Error> {
    cb.set().clipboard(kind(selection)).image(image)
}

#[cfg(not(target_os = "linux"))]
fn set_image(
    cb: &mut arboard::Clipboard,
    _selection: Selection,
    image: ImageData<'static>,
) -> Result<(), arboard::Error> {
    cb.set_image(image)
}
