//! The shared history store
//!
//! All mutations go through one async mutex and are applied to the active
//! [`History`]. After each mutation a new immutable snapshot is published
//! for readers and the background saver is woken; saving never holds up
//! the next mutation. Notifications are sent while the mutation lock is
//! held, so every subscriber sees them in mutation order.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::collection::{AddOutcome, History, Limits};
use super::item::{Item, ItemKind};
use super::storage::{validate_name, SaveOptions, Storage};
use super::HistoryError;
use crate::config::{Settings, SettingsHandle};

const EVENT_CAPACITY: usize = 256;

/// Notifications sent to front-ends and the synchronizer
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    /// The collection changed structurally; re-read it
    Changed { name: String },
    /// This item should become the clipboard content
    Selected { item: Arc<Item> },
    /// An item was updated in place (rich formats attached)
    Updated { uuid: Uuid },
}

#[derive(Clone)]
struct Published {
    history: Arc<History>,
    seq: u64,
}

pub struct HistoryStore {
    settings: SettingsHandle,
    storage: Arc<Storage>,
    state: tokio::sync::Mutex<History>,
    /// Settings the locked state currently reflects
    applied: Mutex<Arc<Settings>>,
    published: RwLock<Published>,
    seq: AtomicU64,
    dirty: AtomicBool,
    autosave: Arc<Notify>,
    events: broadcast::Sender<HistoryEvent>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HistoryStore {
    /// Load the configured history and start the background tasks
    pub async fn open(settings: SettingsHandle) -> Result<Arc<Self>, HistoryError> {
        let changes = settings.subscribe();
        let current = settings.get();
        let storage = Arc::new(Storage::new(current.data_dir.clone()));
        let (history, migrate) = load_history(&storage, &current.history_name, &current).await?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let store = Arc::new(Self {
            settings: settings.clone(),
            storage,
            published: RwLock::new(Published {
                history: Arc::new(history.clone()),
                seq: 0,
            }),
            state: tokio::sync::Mutex::new(history),
            applied: Mutex::new(Arc::clone(&current)),
            seq: AtomicU64::new(0),
            dirty: AtomicBool::new(false),
            autosave: Arc::new(Notify::new()),
            events,
            tasks: Mutex::new(Vec::new()),
        });

        if migrate {
            store.migrate().await;
        }

        let autosaver = tokio::spawn(autosave_loop(
            Arc::downgrade(&store),
            Arc::clone(&store.autosave),
        ));
        let watcher = tokio::spawn(settings_loop(Arc::downgrade(&store), changes));
        store
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([autosaver, watcher]);

        info!(
            "Opened history {} with {} items",
            current.history_name,
            store.snapshot().len()
        );
        Ok(store)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The latest published state; never blocks on a mutation in progress
    pub fn snapshot(&self) -> Arc<History> {
        Arc::clone(&self.read_published().history)
    }

    /// Name of the active history
    pub fn name(&self) -> String {
        self.snapshot().name().to_string()
    }

    /// Add an item, returning the entry that now holds its content
    pub async fn add(&self, item: Item) -> Result<Arc<Item>, HistoryError> {
        let (mut state, settings) = self.lock().await;
        self.add_locked(&mut state, &settings, item)
            .map(|(item, _)| item)
    }

    /// Add a password, replacing any password with the same name
    pub async fn add_password(&self, name: &str, value: String) -> Result<Arc<Item>, HistoryError> {
        check_password_name(name)?;
        let (mut state, settings) = self.lock().await;
        let item = Item::new_password(name, value);
        Limits::from_settings(&settings).admit(&item)?;
        let replaced = match state.find_password(name) {
            Some(index) => Some(state.remove(index)?),
            None => None,
        };

        let result = self.add_locked(&mut state, &settings, item);
        let committed = matches!(result, Ok((_, true)));
        if replaced.is_some() && !committed {
            self.commit(&state);
            self.emit(HistoryEvent::Changed {
                name: state.name().to_string(),
            });
        }
        result.map(|(item, _)| item)
    }

    pub async fn remove(&self, index: usize) -> Result<Arc<Item>, HistoryError> {
        let (mut state, _) = self.lock().await;
        self.remove_locked(&mut state, index).await
    }

    pub async fn remove_uuid(&self, uuid: Uuid) -> Result<Arc<Item>, HistoryError> {
        let (mut state, _) = self.lock().await;
        let index = state
            .find_uuid(uuid)
            .ok_or_else(|| HistoryError::NotFound(format!("item {}", uuid)))?;
        self.remove_locked(&mut state, index).await
    }

    /// Drop every item; no selection follows
    pub async fn empty(&self) -> Result<(), HistoryError> {
        let (mut state, _) = self.lock().await;
        let removed = state.empty();
        self.commit(&state);
        self.emit(HistoryEvent::Changed {
            name: state.name().to_string(),
        });

        let mut seen = HashSet::new();
        for item in &removed {
            if let Some(image) = item.image() {
                if seen.insert(image.checksum().to_string()) {
                    self.storage.remove_side_file(image.path()).await;
                }
            }
        }
        debug!("Emptied history {} ({} items)", state.name(), removed.len());
        Ok(())
    }

    /// Ask subscribers to put the item at `index` on the clipboard
    pub async fn select(&self, index: usize) -> Result<Arc<Item>, HistoryError> {
        let (state, _) = self.lock().await;
        let item = state
            .get(index)
            .cloned()
            .ok_or_else(|| HistoryError::NotFound(format!("index {}", index)))?;
        self.emit(HistoryEvent::Selected {
            item: Arc::clone(&item),
        });
        Ok(item)
    }

    pub async fn select_uuid(&self, uuid: Uuid) -> Result<Arc<Item>, HistoryError> {
        let (state, _) = self.lock().await;
        let item = state
            .find_uuid(uuid)
            .and_then(|index| state.get(index).cloned())
            .ok_or_else(|| HistoryError::NotFound(format!("item {}", uuid)))?;
        self.emit(HistoryEvent::Selected {
            item: Arc::clone(&item),
        });
        Ok(item)
    }

    /// Replace the value of the text item at `index`, keeping its uuid
    pub async fn replace(&self, index: usize, contents: String) -> Result<(), HistoryError> {
        if contents.is_empty() {
            return Err(HistoryError::InvalidArgument(
                "replacement text is empty".to_string(),
            ));
        }
        let (mut state, settings) = self.lock().await;
        let old = state
            .get(index)
            .ok_or_else(|| HistoryError::NotFound(format!("index {}", index)))?;
        if old.kind() != ItemKind::Text {
            return Err(HistoryError::InvalidArgument(format!(
                "cannot replace the value of a {} item",
                old.kind()
            )));
        }

        let item = Item::new_text(contents).with_uuid(old.uuid());
        state.replace(index, item, Limits::from_settings(&settings), settings.fifo)?;
        self.commit(&state);
        self.emit(HistoryEvent::Changed {
            name: state.name().to_string(),
        });
        if index == 0 {
            self.emit_new_top(&state);
        }
        Ok(())
    }

    pub fn get_value(&self, index: usize) -> Option<String> {
        self.snapshot().get(index).map(|i| i.value().to_string())
    }

    pub fn get_display(&self, index: usize) -> Option<String> {
        self.snapshot()
            .get(index)
            .map(|i| i.display_value().to_string())
    }

    pub fn get_element(&self, uuid: Uuid) -> Option<Arc<Item>> {
        let snapshot = self.snapshot();
        snapshot
            .find_uuid(uuid)
            .and_then(|index| snapshot.get(index).cloned())
    }

    pub fn get_value_by_uuid(&self, uuid: Uuid) -> Result<String, HistoryError> {
        self.get_element(uuid)
            .map(|item| item.value().to_string())
            .ok_or_else(|| HistoryError::NotFound(format!("item {}", uuid)))
    }

    /// `(uuid, display string)` of every item in position order
    pub fn get_history(&self) -> Vec<(Uuid, String)> {
        self.snapshot()
            .items()
            .iter()
            .map(|i| (i.uuid(), i.display_value().to_string()))
            .collect()
    }

    /// Like [`HistoryStore::get_history`], cut to `max-displayed-history-size`
    pub fn get_displayed_history(&self) -> Vec<(Uuid, String)> {
        let mut history = self.get_history();
        history.truncate(self.settings.get().max_displayed_history_size);
        history
    }

    pub fn search(&self, pattern: &str) -> Result<Vec<Uuid>, HistoryError> {
        self.snapshot().search(pattern)
    }

    /// Make `name` the active history, creating it if it does not exist
    ///
    /// The current history is saved first; if that fails nothing changes.
    pub async fn switch(&self, name: &str) -> Result<(), HistoryError> {
        check_name(name)?;
        let (mut state, settings) = self.lock().await;
        if state.name() == name {
            return Ok(());
        }
        self.switch_locked(&mut state, &settings, name).await
    }

    async fn switch_locked(
        &self,
        state: &mut History,
        settings: &Settings,
        name: &str,
    ) -> Result<(), HistoryError> {
        self.flush().await?;

        let (history, migrate) = load_history(&self.storage, name, settings).await?;
        let previous = std::mem::replace(state, history);
        // A fresh history was never saved, so its first write must happen
        self.commit(state);
        if migrate {
            self.migrate().await;
        }

        if let Err(e) = self.settings.update(|s| s.history_name = name.to_string()) {
            warn!("Failed to record active history {}: {}", name, e);
        }
        info!("Switched history from {} to {}", previous.name(), name);
        self.emit(HistoryEvent::Changed {
            name: name.to_string(),
        });
        Ok(())
    }

    /// Write history `name` under `backup_name` without switching
    ///
    /// The active history is copied from memory, any other from disk.
    pub async fn backup(&self, name: &str, backup_name: &str) -> Result<(), HistoryError> {
        check_name(name)?;
        check_name(backup_name)?;
        if name == backup_name {
            return Err(HistoryError::InvalidArgument(format!(
                "cannot back up {} onto itself",
                name
            )));
        }

        let (state, settings) = self.lock().await;
        if backup_name == state.name() {
            return Err(HistoryError::InvalidArgument(format!(
                "cannot overwrite the active history {}",
                backup_name
            )));
        }

        let items = if name == state.name() {
            state.items().to_vec()
        } else {
            if !self.storage.exists(name) {
                return Err(HistoryError::NotFound(format!("history {}", name)));
            }
            let decoded = self.storage.load(name, settings.max_history_size).await?;
            decoded.items.into_iter().map(Arc::new).collect()
        };
        drop(state);

        let options = SaveOptions {
            enabled: true,
            save_passwords: settings.save_passwords,
        };
        self.storage
            .save(backup_name, items, self.next_seq(), options)
            .await?;
        info!("Backed up history {} as {}", name, backup_name);
        Ok(())
    }

    /// Remove a persisted history other than the active one
    pub async fn delete(&self, name: &str) -> Result<(), HistoryError> {
        check_name(name)?;
        let (state, _) = self.lock().await;
        if state.name() == name {
            return Err(HistoryError::InvalidArgument(format!(
                "cannot delete the active history {}",
                name
            )));
        }
        drop(state);
        self.storage.delete(name).await
    }

    /// Persisted histories plus the active one, sorted
    pub async fn list_names(&self) -> Result<Vec<String>, HistoryError> {
        let mut names = self.storage.list().await?;
        let active = self.name();
        if !names.contains(&active) {
            names.push(active);
            names.sort();
        }
        Ok(names)
    }

    /// Concatenate the values of `uuids` into a new text item
    ///
    /// Each value is wrapped in `decoration` on both sides and the results
    /// are joined with `separator`.
    pub async fn merge(
        &self,
        decoration: &str,
        separator: &str,
        uuids: &[Uuid],
    ) -> Result<Arc<Item>, HistoryError> {
        if uuids.is_empty() {
            return Err(HistoryError::InvalidArgument(
                "nothing to merge".to_string(),
            ));
        }

        let (mut state, settings) = self.lock().await;
        let mut parts = Vec::with_capacity(uuids.len());
        for uuid in uuids {
            let item = state
                .find_uuid(*uuid)
                .and_then(|index| state.get(index))
                .ok_or_else(|| HistoryError::NotFound(format!("item {}", uuid)))?;
            parts.push(format!("{}{}{}", decoration, item.value(), decoration));
        }
        let merged = parts.join(separator);
        self.add_locked(&mut state, &settings, Item::new_text(merged))
            .map(|(item, _)| item)
    }

    /// Attach a rich format to an item still in the history
    ///
    /// Returns `false` when the item is gone.
    pub async fn attach_special(
        &self,
        uuid: Uuid,
        mime: &str,
        data: Vec<u8>,
    ) -> Result<bool, HistoryError> {
        let (mut state, settings) = self.lock().await;
        let Some(current) = state.find_uuid(uuid).and_then(|index| state.get(index)) else {
            debug!("Item {} left the history before {} arrived", uuid, mime);
            return Ok(false);
        };

        let mut updated = (**current).clone();
        updated.add_special_value(mime, data)?;
        let evicted = state
            .update(updated, Limits::from_settings(&settings), settings.fifo)
            .unwrap_or_default();
        self.commit(&state);
        self.emit(HistoryEvent::Updated { uuid });
        if !evicted.is_empty() {
            self.emit(HistoryEvent::Changed {
                name: state.name().to_string(),
            });
        }
        Ok(state.find_uuid(uuid).is_some())
    }

    /// Turn the text item at `index` into a password called `name`
    pub async fn set_password(&self, index: usize, name: &str) -> Result<(), HistoryError> {
        check_password_name(name)?;
        let (mut state, settings) = self.lock().await;
        let item = state
            .get(index)
            .ok_or_else(|| HistoryError::NotFound(format!("index {}", index)))?;
        if state.find_password(name).is_some() {
            return Err(HistoryError::InvalidArgument(format!(
                "a password named {} already exists",
                name
            )));
        }

        let password = (**item).clone().into_password(name)?;
        if let Some(other) = state.find_equal(&password).and_then(|i| state.get(i)) {
            return Err(HistoryError::InvalidArgument(format!(
                "the same secret is already stored as {}",
                other.display_value()
            )));
        }
        Limits::from_settings(&settings).admit(&password)?;
        state.update(password, Limits::from_settings(&settings), settings.fifo);
        self.commit(&state);
        self.emit(HistoryEvent::Changed {
            name: state.name().to_string(),
        });
        Ok(())
    }

    pub fn get_password(&self, name: &str) -> Option<Arc<Item>> {
        let snapshot = self.snapshot();
        snapshot
            .find_password(name)
            .and_then(|index| snapshot.get(index).cloned())
    }

    pub async fn rename_password(&self, old: &str, new: &str) -> Result<(), HistoryError> {
        check_password_name(new)?;
        let (mut state, settings) = self.lock().await;
        let index = state
            .find_password(old)
            .ok_or_else(|| HistoryError::NotFound(format!("password {}", old)))?;
        if old != new && state.find_password(new).is_some() {
            return Err(HistoryError::InvalidArgument(format!(
                "a password named {} already exists",
                new
            )));
        }

        let renamed = state
            .get(index)
            .ok_or_else(|| HistoryError::NotFound(format!("password {}", old)))?
            .renamed_password(new)?;
        state.update(renamed, Limits::from_settings(&settings), settings.fifo);
        self.commit(&state);
        self.emit(HistoryEvent::Changed {
            name: state.name().to_string(),
        });
        Ok(())
    }

    pub async fn delete_password(&self, name: &str) -> Result<(), HistoryError> {
        let (mut state, _) = self.lock().await;
        let index = state
            .find_password(name)
            .ok_or_else(|| HistoryError::NotFound(format!("password {}", name)))?;
        self.remove_locked(&mut state, index).await.map(|_| ())
    }

    /// Write the latest snapshot now
    pub async fn flush(&self) -> Result<(), HistoryError> {
        self.dirty.store(false, Ordering::SeqCst);
        let published = self.read_published();
        let settings = self.settings.get();
        let options = SaveOptions {
            enabled: settings.save_history,
            save_passwords: settings.save_passwords,
        };

        let result = self
            .storage
            .save(
                published.history.name(),
                published.history.items().to_vec(),
                published.seq,
                options,
            )
            .await;
        if result.is_err() {
            self.dirty.store(true, Ordering::SeqCst);
        }
        result.map(|_| ())
    }

    /// Returns the head entry and whether the collection changed
    fn add_locked(
        &self,
        state: &mut History,
        settings: &Settings,
        item: Item,
    ) -> Result<(Arc<Item>, bool), HistoryError> {
        self.restore_side_file(&item);

        let changed = match state.add(item, Limits::from_settings(settings), settings.fifo)? {
            AddOutcome::Unchanged => {
                debug!("Item already at the head of {}", state.name());
                false
            }
            AddOutcome::Added { removed } => {
                if !removed.is_empty() {
                    debug!("Add dropped {} items from {}", removed.len(), state.name());
                }
                self.commit(state);
                self.emit(HistoryEvent::Changed {
                    name: state.name().to_string(),
                });
                true
            }
        };

        let head = if settings.fifo {
            state.len().saturating_sub(1)
        } else {
            0
        };
        state
            .get(head)
            .cloned()
            .map(|item| (item, changed))
            .ok_or_else(|| HistoryError::Unavailable("history is empty after add".to_string()))
    }

    async fn remove_locked(
        &self,
        state: &mut History,
        index: usize,
    ) -> Result<Arc<Item>, HistoryError> {
        let removed = state.remove(index)?;
        self.commit(state);
        self.emit(HistoryEvent::Changed {
            name: state.name().to_string(),
        });
        if index == 0 {
            self.emit_new_top(state);
        }

        if let Some(image) = removed.image() {
            if !state.is_checksum_referenced(image.checksum()) {
                self.storage.remove_side_file(image.path()).await;
            }
        }
        Ok(removed)
    }

    /// A side file deleted by an earlier removal is rewritten from memory
    fn restore_side_file(&self, item: &Item) {
        let Some(image) = item.image() else { return };
        if !image.is_stored() || !image.is_loaded() || image.path().exists() {
            return;
        }
        match image.pixels() {
            Ok(pixels) => {
                if let Err(e) = self.storage.images().store(image.checksum(), &pixels) {
                    warn!("Failed to restore image side file: {}", e);
                }
            }
            Err(e) => debug!("Image pixels unavailable: {}", e),
        }
    }

    /// Publish the mutated state and wake the saver
    fn commit(&self, state: &History) {
        state.evict_image_caches();
        let seq = self.next_seq();
        *self
            .published
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Published {
            history: Arc::new(state.clone()),
            seq,
        };
        self.dirty.store(true, Ordering::SeqCst);
        self.autosave.notify_one();
    }

    fn emit_new_top(&self, state: &History) {
        if let Some(top) = state.get(0) {
            self.emit(HistoryEvent::Selected {
                item: Arc::clone(top),
            });
        }
    }

    fn emit(&self, event: HistoryEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn read_published(&self) -> Published {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn save_if_dirty(&self) -> Result<(), HistoryError> {
        if !self.dirty.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.flush().await
    }

    /// Rewrite a legacy document in the current format
    async fn migrate(&self) {
        let name = self.name();
        if !self.settings.get().save_history {
            return;
        }
        self.dirty.store(true, Ordering::SeqCst);
        match self.flush().await {
            Ok(()) => info!("Migrated history {} to the current format", name),
            Err(e) => warn!("Failed to migrate history {}: {}", name, e),
        }
    }

    /// Take the mutation lock with every settings change applied
    ///
    /// The returned settings are the ones the locked state reflects;
    /// mutations use them rather than reading the handle again.
    async fn lock(&self) -> (tokio::sync::MutexGuard<'_, History>, Arc<Settings>) {
        let mut state = self.state.lock().await;
        let settings = self.reconcile(&mut state).await;
        (state, settings)
    }

    async fn reconcile(&self, state: &mut History) -> Arc<Settings> {
        let next = self.settings.get();
        let prev = {
            let mut applied = self.applied.lock().unwrap_or_else(PoisonError::into_inner);
            if Arc::ptr_eq(&applied, &next) {
                return next;
            }
            std::mem::replace(&mut *applied, Arc::clone(&next))
        };

        self.apply_settings(state, &prev, &next);
        if prev.history_name != next.history_name && state.name() != next.history_name {
            if let Err(e) = self.switch_locked(state, &next, &next.history_name).await {
                warn!("Failed to switch to history {}: {}", next.history_name, e);
            }
        }
        next
    }

    fn apply_settings(&self, state: &mut History, prev: &Settings, next: &Settings) {
        let mut changed = false;
        if prev.fifo != next.fifo {
            debug!("Insertion mode changed, reversing {}", state.name());
            state.reverse();
            changed = true;
        }
        let evicted = state.enforce(Limits::from_settings(next), next.fifo);
        if !evicted.is_empty() {
            info!("Evicted {} items after the limits changed", evicted.len());
            changed = true;
        }
        let persistence = prev.save_history != next.save_history
            || prev.save_passwords != next.save_passwords;

        if changed || persistence {
            self.commit(state);
        }
        if changed {
            self.emit(HistoryEvent::Changed {
                name: state.name().to_string(),
            });
        }
    }
}

impl Drop for HistoryStore {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

fn check_name(name: &str) -> Result<(), HistoryError> {
    validate_name(name)
        .map_err(|e| HistoryError::InvalidArgument(format!("history name {:?}: {}", name, e)))
}

fn check_password_name(name: &str) -> Result<(), HistoryError> {
    if name.trim().is_empty() {
        return Err(HistoryError::InvalidArgument(
            "password name cannot be empty".to_string(),
        ));
    }
    Ok(())
}

/// Load `name` from disk; the flag tells whether it needs rewriting
async fn load_history(
    storage: &Storage,
    name: &str,
    settings: &Settings,
) -> Result<(History, bool), HistoryError> {
    check_name(name)?;
    let decoded = storage.load(name, settings.max_history_size).await?;
    let migrate = decoded.needs_migration() && !decoded.items.is_empty();
    let history = History::from_items(
        name,
        decoded.items,
        Limits::from_settings(settings),
        settings.fifo,
    );
    Ok((history, migrate))
}

async fn autosave_loop(store: Weak<HistoryStore>, notify: Arc<Notify>) {
    let mut retry: Option<Duration> = None;
    loop {
        match retry {
            Some(delay) => {
                tokio::select! {
                    _ = notify.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            None => notify.notified().await,
        }

        let Some(store) = store.upgrade() else { break };
        retry = match store.save_if_dirty().await {
            Ok(()) => None,
            Err(e) => {
                let delay = Duration::from_secs(store.settings.get().autosave_retry_secs);
                warn!(
                    "Background save failed, retrying in {}s: {}",
                    delay.as_secs(),
                    e
                );
                Some(delay)
            }
        };
    }
}

async fn settings_loop(store: Weak<HistoryStore>, mut rx: watch::Receiver<Arc<Settings>>) {
    while rx.changed().await.is_ok() {
        rx.borrow_and_update();
        let Some(store) = store.upgrade() else { break };
        drop(store.lock().await);
    }
}
