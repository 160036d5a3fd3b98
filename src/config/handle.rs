//! Shared, observable settings

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::{ConfigError, Settings};

/// Cheaply clonable handle over the current settings
///
/// Components read a snapshot with [`SettingsHandle::get`] and react to
/// changes through [`SettingsHandle::subscribe`].
#[derive(Clone)]
pub struct SettingsHandle {
    tx: Arc<watch::Sender<Arc<Settings>>>,
}

impl SettingsHandle {
    pub fn new(settings: Settings) -> Self {
        let (tx, _) = watch::channel(Arc::new(settings));
        Self { tx: Arc::new(tx) }
    }

    /// Snapshot of the current settings
    pub fn get(&self) -> Arc<Settings> {
        self.tx.borrow().clone()
    }

    /// Apply a change; invalid results are rejected and nothing is published
    ///
    /// `f` runs while the settings are locked, so concurrent updates never
    /// overwrite each other. It must not call back into this handle.
    pub fn update<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Settings),
    {
        let mut result = Ok(());
        self.tx.send_if_modified(|current| {
            let mut next = (**current).clone();
            f(&mut next);
            if let Err(e) = next.validate() {
                result = Err(e);
                return false;
            }
            if **current == next {
                return false;
            }
            debug!("Settings changed");
            *current = Arc::new(next);
            true
        });
        result
    }

    /// Replace the settings wholesale, e.g. after reloading the config file
    pub fn replace(&self, settings: Settings) -> Result<(), ConfigError> {
        self.update(|s| *s = settings)
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<Settings>> {
        self.tx.subscribe()
    }
}

impl Default for SettingsHandle {
    fn default() -> Self {
        Self::new(Settings::default())
    }
}
