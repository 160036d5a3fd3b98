//! Clipboard abstraction layer
//!
//! A [`ClipboardAdapter`] wraps one system selection (the clipboard or the
//! primary selection). The core reads what another application offers,
//! takes ownership to publish history items, and listens for ownership
//! changes. Two implementations are provided: [`memory::MemorySelection`],
//! an in-process selection, and [`system::SystemSelection`] backed by the
//! desktop clipboard.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;
pub mod system;

pub use memory::MemorySelection;
pub use system::SystemSelection;

/// Capacity of ownership-change channels
pub const EVENT_CAPACITY: usize = 64;

/// The two selections a desktop offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Selection {
    /// Explicit copy and paste
    Clipboard,
    /// Mouse selection, pasted with a middle click
    Primary,
}

impl Selection {
    pub fn other(self) -> Self {
        match self {
            Selection::Clipboard => Selection::Primary,
            Selection::Primary => Selection::Clipboard,
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Selection::Clipboard => f.write_str("clipboard"),
            Selection::Primary => f.write_str("primary"),
        }
    }
}

/// A format the current owner can provide
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Text,
    Uris,
    Image,
    /// Any other mime type, e.g. `text/html`
    Special(String),
}

impl FormatTag {
    pub fn mime(&self) -> &str {
        match self {
            FormatTag::Text => "text/plain;charset=utf-8",
            FormatTag::Uris => "text/uri-list",
            FormatTag::Image => "image/png",
            FormatTag::Special(mime) => mime,
        }
    }
}

/// Content written to a selection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Text(String),
    Uris(Vec<String>),
    /// Encoded image, PNG when produced by the history
    Image(Bytes),
}

impl Content {
    pub fn format(&self) -> FormatTag {
        match self {
            Content::Text(_) => FormatTag::Text,
            Content::Uris(_) => FormatTag::Uris,
            Content::Image(_) => FormatTag::Image,
        }
    }

    /// Textual form, URI lists joined by newlines
    pub fn as_text(&self) -> Option<String> {
        match self {
            Content::Text(text) => Some(text.clone()),
            Content::Uris(uris) => Some(uris.join("\n")),
            Content::Image(_) => None,
        }
    }
}

/// Renders a format on demand when another application pastes
pub type DataCallback = Arc<dyn Fn(&FormatTag) -> Option<Bytes> + Send + Sync>;

/// A selection changed hands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipChange {
    pub selection: Selection,
    /// False when the selection was cleared and nobody owns it
    pub new_owner: bool,
    /// The change was caused by our own `write_and_own`
    pub ours: bool,
}

/// Clipboard errors
#[derive(Debug, Error)]
pub enum ClipboardError {
    /// Platform-specific error
    #[error("Platform error: {0}")]
    Platform(String),

    /// The backend cannot be reached
    #[error("Clipboard unavailable: {0}")]
    Unavailable(String),

    /// Unsupported content type
    #[error("Unsupported content type: {0}")]
    UnsupportedType(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// One system selection
#[async_trait]
pub trait ClipboardAdapter: Send + Sync {
    fn selection(&self) -> Selection;

    /// Backend name for logs
    fn name(&self) -> &str;

    /// Formats offered by the current owner
    async fn available_formats(&self) -> Result<Vec<FormatTag>, ClipboardError>;

    async fn read_text(&self) -> Result<Option<String>, ClipboardError>;

    async fn read_uris(&self) -> Result<Option<Vec<String>>, ClipboardError>;

    /// Encoded image bytes
    async fn read_image(&self) -> Result<Option<Bytes>, ClipboardError>;

    async fn read_special(&self, mime: &str) -> Result<Option<Bytes>, ClipboardError>;

    /// Become the owner of the selection
    ///
    /// Backends that support lazy rendering call `on_data_requested` when
    /// another application asks for a format instead of copying up front.
    async fn write_and_own(
        &self,
        content: Content,
        on_data_requested: Option<DataCallback>,
    ) -> Result<(), ClipboardError>;

    async fn clear(&self) -> Result<(), ClipboardError>;

    /// Stream of ownership changes
    fn subscribe(&self) -> broadcast::Receiver<OwnershipChange>;
}

/// Split a `text/uri-list` payload, dropping comments and blank lines
pub fn parse_uri_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Whether every line of `text` looks like a URI
pub fn looks_like_uri_list(text: &str) -> bool {
    let uris = parse_uri_list(text);
    !uris.is_empty()
        && uris.iter().all(|uri| {
            uri.split_once("://")
                .is_some_and(|(scheme, _)| {
                    !scheme.is_empty()
                        && scheme
                            .chars()
                            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
                })
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selection_other() {
        assert_eq!(Selection::Clipboard.other(), Selection::Primary);
        assert_eq!(Selection::Primary.other(), Selection::Clipboard);
    }

    #[test]
    fn test_content_text() {
        assert_eq!(Content::Text("a".into()).as_text(), Some("a".to_string()));
        assert_eq!(
            Content::Uris(vec!["file:///a".into(), "file:///b".into()]).as_text(),
            Some("file:///a\nfile:///b".to_string())
        );
        assert_eq!(Content::Image(Bytes::from_static(b"png")).as_text(), None);
        assert_eq!(Content::Image(Bytes::new()).format(), FormatTag::Image);
    }

    #[test]
    fn test_uri_lists() {
        assert_eq!(
            parse_uri_list("# comment\nfile:///tmp/a\r\n\nfile:///tmp/b\n"),
            vec!["file:///tmp/a", "file:///tmp/b"]
        );
        assert!(looks_like_uri_list("file:///tmp/a\nhttps://example.org"));
        assert!(!looks_like_uri_list("just some words"));
        assert!(!looks_like_uri_list("file:///tmp/a\nnot a uri"));
        assert!(!looks_like_uri_list(""));
    }
}
