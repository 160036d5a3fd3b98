//! # ClipStash
//!
//! Clipboard history manager core.
//!
//! ClipStash watches the clipboard and primary selections, records what
//! other applications copy into a bounded, deduplicated history, and
//! publishes selected entries back to the clipboard. Histories persist as
//! versioned XML documents with images kept in a shared side-file cache.

pub mod cli;
pub mod clipboard;
pub mod config;
pub mod history;
pub mod sync;

pub use config::{Settings, SettingsHandle};
pub use history::{HistoryEvent, HistoryStore, Item, ItemKind};
pub use sync::Synchronizer;

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
