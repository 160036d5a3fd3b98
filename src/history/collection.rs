//! The ordered, deduplicated, size-bounded item collection
//!
//! Position 0 is the most relevant item. In LIFO mode new items go to the
//! front and the back is evicted; in FIFO mode new items go to the back and
//! the front is evicted.

use std::sync::Arc;

use regex::RegexBuilder;
use uuid::Uuid;

use super::item::Item;
use super::HistoryError;
use crate::config::Settings;

/// Count and byte budgets of a history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_items: usize,
    pub max_bytes: u64,
}

impl Limits {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_items: settings.max_history_size,
            max_bytes: settings.max_memory_bytes(),
        }
    }

    pub fn unbounded() -> Self {
        Self {
            max_items: usize::MAX,
            max_bytes: u64::MAX,
        }
    }

    /// Reject an item that could never fit the byte budget
    pub fn admit(&self, item: &Item) -> Result<(), HistoryError> {
        if item.size() > self.max_bytes {
            return Err(HistoryError::InvalidArgument(format!(
                "item of {} bytes exceeds the history budget of {} bytes",
                item.size(),
                self.max_bytes
            )));
        }
        Ok(())
    }

    fn exceeded_by(&self, len: usize, size: u64) -> bool {
        len > self.max_items || size > self.max_bytes
    }
}

#[derive(Debug)]
pub enum AddOutcome {
    /// The item was already at the insertion position
    Unchanged,
    Added {
        /// Items dropped by dedup or to satisfy the budgets
        removed: Vec<Arc<Item>>,
    },
}

/// One named history
#[derive(Debug, Clone)]
pub struct History {
    name: String,
    items: Vec<Arc<Item>>,
    size: u64,
}

impl History {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Vec::new(),
            size: 0,
        }
    }

    /// Build from persisted items in position order
    ///
    /// Later duplicates are dropped and the budgets are applied.
    pub fn from_items(
        name: impl Into<String>,
        items: Vec<Item>,
        limits: Limits,
        fifo: bool,
    ) -> Self {
        let mut history = Self::new(name);
        for item in items {
            if history.items.iter().any(|kept| kept.equals(&item)) {
                continue;
            }
            history.size += item.size();
            history.items.push(Arc::new(item));
        }
        history.enforce(limits, fifo);
        history
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn items(&self) -> &[Arc<Item>] {
        &self.items
    }

    pub fn get(&self, index: usize) -> Option<&Arc<Item>> {
        self.items.get(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Sum of item sizes
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn find_uuid(&self, uuid: Uuid) -> Option<usize> {
        self.items.iter().position(|i| i.uuid() == uuid)
    }

    pub fn find_password(&self, name: &str) -> Option<usize> {
        self.items
            .iter()
            .position(|i| i.password_name() == Some(name))
    }

    /// Position of an item with the same content as `item`, other than itself
    pub fn find_equal(&self, item: &Item) -> Option<usize> {
        self.items
            .iter()
            .position(|i| i.uuid() != item.uuid() && i.equals(item))
    }

    /// Whether any item still points at the side file for `checksum`
    pub fn is_checksum_referenced(&self, checksum: &str) -> bool {
        self.items
            .iter()
            .filter_map(|i| i.image())
            .any(|image| image.checksum() == checksum)
    }

    /// Insert with dedup, then evict from the far end until within budget
    pub fn add(
        &mut self,
        item: Item,
        limits: Limits,
        fifo: bool,
    ) -> Result<AddOutcome, HistoryError> {
        limits.admit(&item)?;

        let head = if fifo { self.items.len().checked_sub(1) } else { Some(0) };
        let existing = self.items.iter().position(|i| i.equals(&item));
        if existing.is_some() && existing == head {
            return Ok(AddOutcome::Unchanged);
        }

        let mut removed = Vec::new();
        if let Some(index) = existing {
            removed.push(self.take(index));
        }

        self.size += item.size();
        if fifo {
            self.items.push(Arc::new(item));
        } else {
            self.items.insert(0, Arc::new(item));
        }
        removed.extend(self.enforce(limits, fifo));
        Ok(AddOutcome::Added { removed })
    }

    pub fn remove(&mut self, index: usize) -> Result<Arc<Item>, HistoryError> {
        if index >= self.items.len() {
            return Err(out_of_range(index, self.items.len()));
        }
        Ok(self.take(index))
    }

    /// Drop everything, returning what was held
    pub fn empty(&mut self) -> Vec<Arc<Item>> {
        self.size = 0;
        std::mem::take(&mut self.items)
    }

    /// Put `item` at `index`, dropping any other item equal to it
    ///
    /// Returns the replaced item followed by anything removed by dedup or
    /// the budgets.
    pub fn replace(
        &mut self,
        index: usize,
        item: Item,
        limits: Limits,
        fifo: bool,
    ) -> Result<Vec<Arc<Item>>, HistoryError> {
        if index >= self.items.len() {
            return Err(out_of_range(index, self.items.len()));
        }
        limits.admit(&item)?;

        let mut index = index;
        let mut removed = Vec::new();
        if let Some(dup) = self
            .items
            .iter()
            .enumerate()
            .position(|(i, other)| i != index && other.equals(&item))
        {
            removed.push(self.take(dup));
            if dup < index {
                index -= 1;
            }
        }

        let item = Arc::new(item);
        self.size = self.size - self.items[index].size() + item.size();
        let old = std::mem::replace(&mut self.items[index], item);
        removed.insert(0, old);
        removed.extend(self.enforce(limits, fifo));
        Ok(removed)
    }

    /// Swap in a new version of the item with the same uuid
    ///
    /// Returns `None` when that uuid is no longer held.
    pub fn update(
        &mut self,
        item: Item,
        limits: Limits,
        fifo: bool,
    ) -> Option<Vec<Arc<Item>>> {
        let index = self.find_uuid(item.uuid())?;
        let item = Arc::new(item);
        self.size = self.size - self.items[index].size() + item.size();
        self.items[index] = item;
        Some(self.enforce(limits, fifo))
    }

    /// Evict from the end opposite the insertion point until within budget
    pub fn enforce(&mut self, limits: Limits, fifo: bool) -> Vec<Arc<Item>> {
        let mut evicted = Vec::new();
        while !self.items.is_empty() && limits.exceeded_by(self.items.len(), self.size) {
            let index = if fifo { 0 } else { self.items.len() - 1 };
            evicted.push(self.take(index));
        }
        evicted
    }

    /// Flip the order, used when the insertion mode changes
    pub fn reverse(&mut self) {
        self.items.reverse();
    }

    /// Uuids of items whose display string contains `pattern`, ignoring case
    pub fn search(&self, pattern: &str) -> Result<Vec<Uuid>, HistoryError> {
        let matcher = RegexBuilder::new(&regex::escape(pattern))
            .case_insensitive(true)
            .build()
            .map_err(|e| HistoryError::InvalidArgument(format!("bad pattern: {}", e)))?;
        Ok(self
            .items
            .iter()
            .filter(|i| matcher.is_match(i.display_value()))
            .map(|i| i.uuid())
            .collect())
    }

    /// Release decoded pixels of every image except the one at position 0
    pub fn evict_image_caches(&self) {
        for image in self.items.iter().skip(1).filter_map(|i| i.image()) {
            if image.is_loaded() {
                image.evict_cache();
            }
        }
    }

    fn take(&mut self, index: usize) -> Arc<Item> {
        let item = self.items.remove(index);
        self.size -= item.size();
        item
    }
}

fn out_of_range(index: usize, len: usize) -> HistoryError {
    HistoryError::NotFound(format!("index {} (history holds {} items)", index, len))
}
