//! Shared value cache.
//!
//! One slot per tag that some group subscribes to. A slot holds the whole
//! value/quality/timestamp triple under a single lock, so a reader never
//! sees a value paired with a stale quality or timestamp.

use crate::opc_da::errors::OpcResult;
use crate::opc_da::quality::Quality;
use crate::opc_da::value::{Variant, Vqt};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
pub struct TagSlot {
    current: RwLock<Vqt>,
}

impl TagSlot {
    fn with_value(vqt: Vqt) -> Self {
        Self {
            current: RwLock::new(vqt),
        }
    }

    pub fn snapshot(&self) -> Vqt {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn store(&self, vqt: Vqt) {
        *self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner) = vqt;
    }

    /// Replace quality and timestamp, keeping the last known value.
    pub fn mark(&self, quality: Quality) {
        let mut current = self
            .current
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *current = current.with_quality(quality, Utc::now());
    }
}

/// Item ID to slot map.
///
/// Items hold an `Arc` to their slot, so a slot whose only owner is the
/// cache itself has no subscriber left.
#[derive(Debug, Default)]
pub struct DataCache {
    slots: RwLock<HashMap<String, Arc<TagSlot>>>,
}

impl DataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Slot for `item_id`, created with `initial` on first use.
    pub(crate) fn slot(&self, item_id: &str, initial: impl FnOnce() -> Vqt) -> OpcResult<Arc<TagSlot>> {
        if let Some(slot) = self.slots.read()?.get(item_id) {
            return Ok(Arc::clone(slot));
        }
        let mut slots = self.slots.write()?;
        let slot = slots
            .entry(item_id.to_string())
            .or_insert_with(|| Arc::new(TagSlot::with_value(initial())));
        Ok(Arc::clone(slot))
    }

    /// Store a sample, creating the slot if no item subscribes to the tag yet.
    pub(crate) fn upsert(&self, item_id: &str, vqt: Vqt) -> OpcResult<()> {
        self.slot(item_id, Vqt::default)?.store(vqt);
        Ok(())
    }

    pub fn get(&self, item_id: &str) -> Option<Vqt> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item_id)
            .map(|slot| slot.snapshot())
    }

    /// Store a sample for `item_id`. Tags nobody subscribes to are not cached.
    pub fn update(&self, item_id: &str, vqt: Vqt) -> bool {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        match slots.get(item_id) {
            Some(slot) => {
                slot.store(vqt);
                true
            }
            None => false,
        }
    }

    /// Shorthand for a Good sample stamped now.
    pub fn update_value(&self, item_id: &str, value: impl Into<Variant>) -> bool {
        self.update(item_id, Vqt::good(value))
    }

    pub fn mark_bad(&self, item_id: &str, quality: Quality) {
        if let Some(slot) = self
            .slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(item_id)
        {
            slot.mark(quality);
        }
    }

    /// IDs of tags that at least one item still references.
    pub fn subscribed_ids(&self) -> Vec<String> {
        let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = slots
            .iter()
            .filter(|(_, slot)| Arc::strong_count(slot) > 1)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop slots no item references any more.
    pub fn purge_unused(&self) -> usize {
        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        let before = slots.len();
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        let purged = before - slots.len();
        if purged > 0 {
            tracing::debug!(purged, "dropped unreferenced cache slots");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
