//! Clipboard history management and persistence

pub mod codec;
pub mod collection;
pub mod image_cache;
pub mod item;
pub mod secret;
pub mod storage;
pub mod store;

use thiserror::Error;

pub use collection::{AddOutcome, History, Limits};
pub use item::{Item, ItemKind, SpecialValue};
pub use storage::Storage;
pub use store::{HistoryEvent, HistoryStore};

/// Errors reported at the history store boundary
#[derive(Debug, Error)]
pub enum HistoryError {
    /// Unknown index, uuid, history or password name
    #[error("Not found: {0}")]
    NotFound(String),

    /// Request rejected before touching any state
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Disk access failed
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Persisted document could not be understood
    #[error("Corrupt history: {0}")]
    Corrupt(String),

    /// A collaborator (worker thread, image decoder) was not available
    #[error("Unavailable: {0}")]
    Unavailable(String),
}

impl From<codec::CodecError> for HistoryError {
    fn from(err: codec::CodecError) -> Self {
        match err {
            codec::CodecError::Io(e) => HistoryError::IoFailure(e),
            other => HistoryError::Corrupt(other.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for HistoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        HistoryError::Unavailable(format!("worker task failed: {}", err))
    }
}
