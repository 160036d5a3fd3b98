//! In-process selection
//!
//! Holds its content in memory and lets a caller act as "another
//! application" that copies or pastes. Used when no desktop clipboard is
//! reachable and by tests.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::debug;

use super::{
    looks_like_uri_list, parse_uri_list, ClipboardAdapter, ClipboardError, Content, DataCallback,
    FormatTag, OwnershipChange, Selection, EVENT_CAPACITY,
};

enum Owner {
    Nobody,
    External(HashMap<FormatTag, Bytes>),
    Ours {
        content: Content,
        callback: Option<DataCallback>,
    },
}

struct State {
    owner: Owner,
    available: bool,
    writes: usize,
}

pub struct MemorySelection {
    selection: Selection,
    state: Mutex<State>,
    events: broadcast::Sender<OwnershipChange>,
}

impl MemorySelection {
    pub fn new(selection: Selection) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            selection,
            state: Mutex::new(State {
                owner: Owner::Nobody,
                available: true,
                writes: 0,
            }),
            events,
        }
    }

    /// Another application copies plain text
    pub fn copy_text(&self, text: &str) {
        self.copy_external(vec![(FormatTag::Text, Bytes::copy_from_slice(text.as_bytes()))]);
    }

    /// Another application takes ownership offering `formats`
    pub fn copy_external(&self, formats: Vec<(FormatTag, Bytes)>) {
        self.lock().owner = Owner::External(formats.into_iter().collect());
        self.notify(true, false);
    }

    /// The owning application goes away
    pub fn clear_external(&self) {
        self.lock().owner = Owner::Nobody;
        self.notify(false, false);
    }

    /// Simulate a backend outage: every read and write fails
    pub fn set_available(&self, available: bool) {
        self.lock().available = available;
    }

    /// Another application pastes `format` from us
    pub fn paste(&self, format: &FormatTag) -> Option<Bytes> {
        render(&self.lock().owner, format)
    }

    /// What we last wrote, if we still own the selection
    pub fn owned_content(&self) -> Option<Content> {
        match &self.lock().owner {
            Owner::Ours { content, .. } => Some(content.clone()),
            _ => None,
        }
    }

    /// Number of successful `write_and_own` calls
    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn notify(&self, new_owner: bool, ours: bool) {
        let _ = self.events.send(OwnershipChange {
            selection: self.selection,
            new_owner,
            ours,
        });
    }

    fn check(&self) -> Result<MutexGuard<'_, State>, ClipboardError> {
        let state = self.lock();
        if !state.available {
            return Err(ClipboardError::Unavailable(format!(
                "{} selection is offline",
                self.selection
            )));
        }
        Ok(state)
    }

    fn read_format(&self, format: &FormatTag) -> Result<Option<Bytes>, ClipboardError> {
        Ok(render(&self.check()?.owner, format))
    }
}

fn render(owner: &Owner, format: &FormatTag) -> Option<Bytes> {
    match owner {
        Owner::External(formats) => formats.get(format).cloned(),
        Owner::Ours { content, callback } => match (format, content) {
            (FormatTag::Text, c) => c.as_text().map(Bytes::from),
            (FormatTag::Uris, Content::Uris(uris)) => Some(Bytes::from(uris.join("\n"))),
            (FormatTag::Image, Content::Image(bytes)) => Some(bytes.clone()),
            (FormatTag::Special(_), _) => callback.as_ref().and_then(|cb| cb(format)),
            _ => None,
        },
        Owner::Nobody => None,
    }
}

#[async_trait]
impl ClipboardAdapter for MemorySelection {
    fn selection(&self) -> Selection {
        self.selection
    }

    fn name(&self) -> &str {
        "memory"
    }

    async fn available_formats(&self) -> Result<Vec<FormatTag>, ClipboardError> {
        let state = self.check()?;
        Ok(match &state.owner {
            Owner::External(formats) => formats.keys().cloned().collect(),
            Owner::Ours { content, .. } => vec![content.format()],
            Owner::Nobody => Vec::new(),
        })
    }

    async fn read_text(&self) -> Result<Option<String>, ClipboardError> {
        let text = match self.read_format(&FormatTag::Text)? {
            Some(bytes) => Some(bytes),
            // Owners offering only a URI list still paste as text
            None => self.read_format(&FormatTag::Uris)?,
        };
        Ok(text.map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    async fn read_uris(&self) -> Result<Option<Vec<String>>, ClipboardError> {
        let Some(bytes) = self.read_format(&FormatTag::Uris)? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        if !looks_like_uri_list(&text) {
            debug!("Ignoring malformed uri list on {}", self.selection);
            return Ok(None);
        }
        Ok(Some(parse_uri_list(&text)))
    }

    async fn read_image(&self) -> Result<Option<Bytes>, ClipboardError> {
        self.read_format(&FormatTag::Image)
    }

    async fn read_special(&self, mime: &str) -> Result<Option<Bytes>, ClipboardError> {
        self.read_format(&FormatTag::Special(mime.to_string()))
    }

    async fn write_and_own(
        &self,
        content: Content,
        on_data_requested: Option<DataCallback>,
    ) -> Result<(), ClipboardError> {
        {
            let mut state = self.check()?;
            state.owner = Owner::Ours {
                content,
                callback: on_data_requested,
            };
            state.writes += 1;
        }
        self.notify(true, true);
        Ok(())
    }

    async fn clear(&self) -> Result<(), ClipboardError> {
        self.check()?.owner = Owner::Nobody;
        self.notify(false, true);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<OwnershipChange> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_external_copy_is_not_ours() {
        let selection = MemorySelection::new(Selection::Clipboard);
        let mut events = selection.subscribe();

        selection.copy_text("hello");

        let change = events.recv().await.unwrap();
        assert!(change.new_owner);
        assert!(!change.ours);
        assert_eq!(selection.read_text().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(
            selection.available_formats().await.unwrap(),
            vec![FormatTag::Text]
        );
    }

    #[tokio::test]
    async fn test_own_write_is_flagged() {
        let selection = MemorySelection::new(Selection::Primary);
        let mut events = selection.subscribe();

        selection
            .write_and_own(Content::Text("mine".into()), None)
            .await
            .unwrap();

        let change = events.recv().await.unwrap();
        assert!(change.ours);
        assert_eq!(change.selection, Selection::Primary);
        assert_eq!(selection.writes(), 1);
        assert_eq!(selection.paste(&FormatTag::Text), Some(Bytes::from("mine")));
    }

    #[tokio::test]
    async fn test_specials_render_lazily() {
        let selection = MemorySelection::new(Selection::Clipboard);
        let callback: DataCallback = Arc::new(|format| match format {
            FormatTag::Special(mime) if mime == "text/html" => Some(Bytes::from("<b>x</b>")),
            _ => None,
        });
        selection
            .write_and_own(Content::Text("x".into()), Some(callback))
            .await
            .unwrap();

        let html = FormatTag::Special("text/html".into());
        assert_eq!(selection.paste(&html), Some(Bytes::from("<b>x</b>")));
        assert_eq!(selection.paste(&FormatTag::Special("text/rtf".into())), None);
        assert_eq!(
            selection.read_special("text/html").await.unwrap(),
            Some(Bytes::from("<b>x</b>"))
        );
    }

    #[tokio::test]
    async fn test_uris_read_as_text() {
        let selection = MemorySelection::new(Selection::Clipboard);
        selection.copy_external(vec![(
            FormatTag::Uris,
            Bytes::from("file:///tmp/a\nfile:///tmp/b"),
        )]);

        assert_eq!(
            selection.read_uris().await.unwrap(),
            Some(vec!["file:///tmp/a".to_string(), "file:///tmp/b".to_string()])
        );
        assert_eq!(
            selection.read_text().await.unwrap().as_deref(),
            Some("file:///tmp/a\nfile:///tmp/b")
        );
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let selection = MemorySelection::new(Selection::Clipboard);
        selection.copy_text("x");
        selection.set_available(false);

        assert!(matches!(
            selection.read_text().await,
            Err(ClipboardError::Unavailable(_))
        ));
        assert!(selection
            .write_and_own(Content::Text("y".into()), None)
            .await
            .is_err());
        assert_eq!(selection.writes(), 0);
    }

    #[tokio::test]
    async fn test_clear() {
        let selection = MemorySelection::new(Selection::Clipboard);
        selection.copy_text("x");
        let mut events = selection.subscribe();

        selection.clear_external();
        assert!(!events.recv().await.unwrap().new_owner);
        assert_eq!(selection.read_text().await.unwrap(), None);
        assert!(selection.available_formats().await.unwrap().is_empty());
    }
}
