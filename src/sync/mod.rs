//! Clipboard to history synchronization
//!
//! The [`Synchronizer`] reacts to ownership changes on the clipboard and
//! primary selections. It decides what to record into the history, mirrors
//! text between the two selections when asked to, and pushes items the
//! history selects back onto the clipboard.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::future::join_all;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::clipboard::{
    ClipboardAdapter, ClipboardError, Content, DataCallback, FormatTag, OwnershipChange, Selection,
};
use crate::config::{Settings, SettingsHandle};
use crate::history::{HistoryEvent, HistoryStore, Item, ItemKind};

/// Content read from a selection
#[derive(Debug, Clone, PartialEq, Eq)]
enum Captured {
    Text(String),
    Uris(Vec<String>),
    Image(Bytes),
}

impl Captured {
    fn text(&self) -> Option<String> {
        match self {
            Captured::Text(text) => Some(text.clone()),
            Captured::Uris(uris) => Some(uris.join("\n")),
            Captured::Image(_) => None,
        }
    }

    fn content(&self) -> Content {
        match self {
            Captured::Text(text) => Content::Text(text.clone()),
            Captured::Uris(uris) => Content::Uris(uris.clone()),
            Captured::Image(bytes) => Content::Image(bytes.clone()),
        }
    }
}

pub struct Synchronizer {
    store: Arc<HistoryStore>,
    settings: SettingsHandle,
    clipboard: Arc<dyn ClipboardAdapter>,
    primary: Option<Arc<dyn ClipboardAdapter>>,
    /// Last text seen on or written to each selection
    known: Mutex<HashMap<Selection, String>>,
}

impl Synchronizer {
    pub fn new(
        store: Arc<HistoryStore>,
        clipboard: Arc<dyn ClipboardAdapter>,
        primary: Option<Arc<dyn ClipboardAdapter>>,
    ) -> Self {
        Self {
            settings: store.settings().clone(),
            store,
            clipboard,
            primary,
            known: Mutex::new(HashMap::new()),
        }
    }

    /// Process selection and history events until a source closes
    pub async fn run(&self) {
        let mut clipboard_rx = self.clipboard.subscribe();
        let mut primary_rx = self.primary.as_ref().map(|p| p.subscribe());
        let mut history_rx = self.store.subscribe();
        info!(
            "Synchronizer started on {} ({})",
            self.clipboard.name(),
            if self.primary.is_some() {
                "clipboard and primary"
            } else {
                "clipboard only"
            }
        );

        loop {
            tokio::select! {
                change = clipboard_rx.recv() => match change {
                    Ok(change) => {
                        self.handle_ownership_change(change).await;
                    }
                    Err(RecvError::Lagged(n)) => warn!("Missed {} clipboard changes", n),
                    Err(RecvError::Closed) => break,
                },
                change = recv_optional(&mut primary_rx) => match change {
                    Ok(change) => {
                        self.handle_ownership_change(change).await;
                    }
                    Err(RecvError::Lagged(n)) => warn!("Missed {} primary selection changes", n),
                    Err(RecvError::Closed) => break,
                },
                event = history_rx.recv() => match event {
                    Ok(HistoryEvent::Selected { item }) => {
                        if let Err(e) = self.push_selected(&item).await {
                            warn!("Failed to put item {} on the clipboard: {}", item.uuid(), e);
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(n)) => warn!("Missed {} history events", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        info!("Synchronizer stopped");
    }

    /// React to one ownership change
    ///
    /// Returns the history entry holding the new content when it was recorded.
    pub async fn handle_ownership_change(&self, change: OwnershipChange) -> Option<Arc<Item>> {
        if change.ours {
            debug!("Ignoring our own write to the {} selection", change.selection);
            return None;
        }
        let adapter = self.adapter(change.selection)?;
        if !change.new_owner {
            debug!("The {} selection was cleared", change.selection);
            self.forget(change.selection);
            return None;
        }

        let settings = self.settings.get();
        let captured = match capture(adapter.as_ref(), &settings).await {
            Ok(Some(captured)) => captured,
            Ok(None) => {
                debug!("Nothing usable on the {} selection", change.selection);
                self.forget(change.selection);
                return None;
            }
            Err(e) => {
                warn!("Failed to read the {} selection: {}", change.selection, e);
                return None;
            }
        };

        if let Some(text) = captured.text() {
            self.remember(change.selection, text);
        }
        let captured = filter(captured, &settings)?;

        if settings.synchronize_clipboards {
            self.mirror(change.selection, &captured).await;
        }

        if !should_record(change.selection, &settings) {
            return None;
        }
        let item = self.record(&captured).await?;

        if settings.rich_text_support
            && matches!(item.kind(), ItemKind::Text | ItemKind::Uris)
            && !settings.special_mimes.is_empty()
        {
            self.fetch_specials(Arc::clone(&adapter), item.uuid(), settings.special_mimes.clone());
        }
        Some(item)
    }

    /// Put a history item on the clipboard, and on the primary selection
    /// when the two are synchronized
    pub async fn push_selected(&self, item: &Item) -> Result<(), ClipboardError> {
        let content = match item.kind() {
            ItemKind::Text | ItemKind::Password => Content::Text(item.real_value().to_string()),
            ItemKind::Uris => Content::Uris(item.uris().into_iter().map(str::to_string).collect()),
            ItemKind::Image => {
                let Some(image) = item.image() else {
                    return Ok(());
                };
                Content::Image(Bytes::from(tokio::fs::read(image.path()).await?))
            }
        };
        let callback = specials_callback(item);

        self.clipboard
            .write_and_own(content.clone(), callback.clone())
            .await?;
        if let Some(text) = content.as_text() {
            self.remember(Selection::Clipboard, text);
        }
        debug!("Item {} is now on the clipboard", item.uuid());

        if self.settings.get().synchronize_clipboards {
            if let (Some(primary), Some(text)) = (&self.primary, content.as_text()) {
                primary.write_and_own(content, callback).await?;
                self.remember(Selection::Primary, text);
            }
        }
        Ok(())
    }

    fn adapter(&self, selection: Selection) -> Option<Arc<dyn ClipboardAdapter>> {
        match selection {
            Selection::Clipboard => Some(Arc::clone(&self.clipboard)),
            Selection::Primary => self.primary.clone(),
        }
    }

    fn remember(&self, selection: Selection, text: String) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(selection, text);
    }

    fn forget(&self, selection: Selection) {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&selection);
    }

    fn known(&self, selection: Selection) -> Option<String> {
        self.known
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&selection)
            .cloned()
    }

    /// Copy text to the other selection unless it already holds it
    async fn mirror(&self, from: Selection, captured: &Captured) {
        let Some(text) = captured.text() else { return };
        let to = from.other();
        let Some(target) = self.adapter(to) else { return };
        if self.known(to).as_deref() == Some(text.as_str()) {
            debug!("The {} selection already holds this text", to);
            return;
        }

        match target.write_and_own(captured.content(), None).await {
            Ok(()) => {
                debug!("Mirrored the {} selection to {}", from, to);
                self.remember(to, text);
            }
            Err(e) => warn!("Failed to mirror to the {} selection: {}", to, e),
        }
    }

    async fn record(&self, captured: &Captured) -> Option<Arc<Item>> {
        let item = match captured {
            Captured::Text(text) => Item::new_text(text.clone()),
            Captured::Uris(uris) => Item::new_uris(uris.join("\n")),
            Captured::Image(bytes) => {
                let bytes = bytes.clone();
                let cache = self.store.storage().images().clone();
                match tokio::task::spawn_blocking(move || Item::new_image(&bytes, &cache)).await {
                    Ok(Ok(item)) => item,
                    Ok(Err(e)) => {
                        warn!("Ignoring clipboard image: {}", e);
                        return None;
                    }
                    Err(e) => {
                        warn!("Image worker failed: {}", e);
                        return None;
                    }
                }
            }
        };

        match self.store.add(item).await {
            Ok(item) => Some(item),
            Err(e) => {
                warn!("Failed to record clipboard content: {}", e);
                None
            }
        }
    }

    /// Fetch rich formats in the background and attach them to `uuid`
    fn fetch_specials(&self, adapter: Arc<dyn ClipboardAdapter>, uuid: uuid::Uuid, mimes: Vec<String>) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let reads = mimes.iter().map(|mime| adapter.read_special(mime));
            let results = join_all(reads).await;

            for (mime, result) in mimes.iter().zip(results) {
                let data = match result {
                    Ok(Some(data)) if !data.is_empty() => data,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!("Failed to read {}: {}", mime, e);
                        continue;
                    }
                };
                match store.attach_special(uuid, mime, data.to_vec()).await {
                    Ok(true) => debug!("Attached {} to {}", mime, uuid),
                    Ok(false) => break,
                    Err(e) => warn!("Failed to attach {} to {}: {}", mime, uuid, e),
                }
            }
        });
    }
}

/// Record only with tracking on, and only primary changes when the
/// primary selection feeds the history or is synchronized with the clipboard
fn should_record(selection: Selection, settings: &Settings) -> bool {
    settings.track_changes
        && (selection == Selection::Clipboard
            || settings.primary_to_history
            || settings.synchronize_clipboards)
}

/// Read the preferred format: URIs, then text, then images
async fn capture(
    adapter: &dyn ClipboardAdapter,
    settings: &Settings,
) -> Result<Option<Captured>, ClipboardError> {
    let formats = adapter.available_formats().await?;
    let has_uris = formats.contains(&FormatTag::Uris);
    let has_text = formats.contains(&FormatTag::Text);

    if has_uris {
        if let Some(uris) = adapter.read_uris().await? {
            return Ok(Some(Captured::Uris(uris)));
        }
    }
    if has_text || has_uris {
        return Ok(adapter.read_text().await?.map(Captured::Text));
    }
    if formats.contains(&FormatTag::Image) {
        if !settings.images_support {
            return Ok(None);
        }
        return Ok(adapter.read_image().await?.map(Captured::Image));
    }

    // Some owners advertise nothing useful but still answer a text request
    Ok(adapter.read_text().await?.map(Captured::Text))
}

/// Apply trimming and the length bounds; text is measured in characters
fn filter(captured: Captured, settings: &Settings) -> Option<Captured> {
    let captured = match captured {
        Captured::Text(text) if settings.trim_items => Captured::Text(text.trim().to_string()),
        other => other,
    };

    let Some(text) = captured.text() else {
        return Some(captured);
    };
    if text.trim().is_empty() {
        debug!("Ignoring empty selection content");
        return None;
    }
    let length = text.chars().count();
    if length < settings.min_text_item_size || length > settings.max_text_item_size {
        debug!(
            "Ignoring text of {} characters (bounds {}..={})",
            length, settings.min_text_item_size, settings.max_text_item_size
        );
        return None;
    }
    Some(captured)
}

fn specials_callback(item: &Item) -> Option<DataCallback> {
    if item.special_values().is_empty() {
        return None;
    }
    let specials = item.special_values().to_vec();
    Some(Arc::new(move |format: &FormatTag| match format {
        FormatTag::Special(mime) => specials
            .iter()
            .find(|s| &s.mime == mime)
            .map(|s| Bytes::from(s.data.clone())),
        _ => None,
    }))
}

async fn recv_optional<T: Clone>(
    rx: &mut Option<broadcast::Receiver<T>>,
) -> Result<T, RecvError> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings::default()
    }

    #[test]
    fn test_record_condition_keeps_or_semantics() {
        let mut s = settings();
        assert!(should_record(Selection::Clipboard, &s));
        assert!(!should_record(Selection::Primary, &s));

        s.primary_to_history = true;
        assert!(should_record(Selection::Primary, &s));

        s.primary_to_history = false;
        s.synchronize_clipboards = true;
        assert!(should_record(Selection::Primary, &s));

        s.track_changes = false;
        assert!(!should_record(Selection::Clipboard, &s));
        assert!(!should_record(Selection::Primary, &s));
    }

    #[test]
    fn test_filter_trims_and_bounds() {
        let mut s = settings();
        s.trim_items = true;
        s.min_text_item_size = 3;
        s.max_text_item_size = 5;

        assert_eq!(
            filter(Captured::Text("  abcd \n".into()), &s),
            Some(Captured::Text("abcd".into()))
        );
        assert_eq!(filter(Captured::Text("   ".into()), &s), None);
        assert_eq!(filter(Captured::Text(" ab ".into()), &s), None);
        assert_eq!(filter(Captured::Text("abcdef".into()), &s), None);
        // Characters, not bytes
        assert!(filter(Captured::Text("ééé".into()), &s).is_some());
    }

    #[test]
    fn test_filter_leaves_untrimmed_text_alone() {
        let s = settings();
        assert_eq!(
            filter(Captured::Text(" padded ".into()), &s),
            Some(Captured::Text(" padded ".into()))
        );
        let image = Captured::Image(Bytes::from_static(b"png"));
        assert_eq!(filter(image.clone(), &s), Some(image));
    }

    #[test]
    fn test_specials_callback_serves_known_mimes() {
        let mut item = Item::new_text("x");
        item.add_special_value("text/html", b"<i>x</i>".to_vec()).unwrap();

        let callback = specials_callback(&item).unwrap();
        assert_eq!(
            callback(&FormatTag::Special("text/html".into())),
            Some(Bytes::from_static(b"<i>x</i>"))
        );
        assert_eq!(callback(&FormatTag::Special("text/rtf".into())), None);
        assert_eq!(callback(&FormatTag::Text), None);
        assert!(specials_callback(&Item::new_text("plain")).is_none());
    }
}
