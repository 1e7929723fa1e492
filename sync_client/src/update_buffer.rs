//! Update buffer.
//!
//! Updates can be processed before the throttled spawn queue has
//! materialized their entity. They wait here until the spawn lands or the
//! entry expires. One entry per id; newer updates overwrite older ones.

use std::collections::HashMap;

use serde_json::{Map, Value};
use sync_shared::entity::EntityId;
use tracing::{debug, warn};

use crate::pause::{PauseSpan, TimeShift};

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedUpdate {
    pub payload: Map<String, Value>,
    pub expires_at: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOutcome {
    Stored,
    /// Replaced an older entry for the same id.
    Refreshed,
    /// Buffer stayed over capacity after sweeping expired entries.
    Dropped,
}

#[derive(Debug)]
pub struct UpdateBuffer {
    entries: HashMap<EntityId, BufferedUpdate>,
    ttl: f64,
    cap: usize,
    sweep_interval: f64,
    last_sweep: Option<f64>,
}

impl UpdateBuffer {
    pub fn new(ttl: f64, cap: usize, sweep_interval: f64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            cap,
            sweep_interval,
            last_sweep: None,
        }
    }

    /// Stores or refreshes the update for `id`.
    ///
    /// When a new id would exceed the cap, expired entries are evicted first;
    /// if the buffer is still full the update is dropped.
    pub fn buffer_update(
        &mut self,
        id: EntityId,
        payload: Map<String, Value>,
        now: f64,
    ) -> (BufferOutcome, usize) {
        let entry = BufferedUpdate {
            payload,
            expires_at: now + self.ttl,
        };
        if let Some(slot) = self.entries.get_mut(&id) {
            *slot = entry;
            return (BufferOutcome::Refreshed, 0);
        }
        let mut evicted = 0;
        if self.entries.len() >= self.cap {
            evicted = self.evict_expired(now);
            if self.entries.len() >= self.cap {
                warn!(id = ?id, cap = self.cap, "Update buffer full, dropping update");
                return (BufferOutcome::Dropped, evicted);
            }
        }
        self.entries.insert(id, entry);
        (BufferOutcome::Stored, evicted)
    }

    /// Removes and returns the entry for `id` if it has not expired.
    pub fn take(&mut self, id: EntityId, now: f64) -> Option<BufferedUpdate> {
        self.entries.remove(&id).filter(|e| e.expires_at > now)
    }

    pub fn discard(&mut self, id: EntityId) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entries.contains_key(&id)
    }

    /// Sweeps expired entries, at most once per sweep interval.
    ///
    /// Returns the number evicted, or `None` if the sweep was skipped.
    pub fn cleanup_expired(&mut self, now: f64) -> Option<usize> {
        if let Some(last) = self.last_sweep {
            if now - last < self.sweep_interval {
                return None;
            }
        }
        self.last_sweep = Some(now);
        let evicted = self.evict_expired(now);
        if evicted > 0 {
            debug!(evicted, remaining = self.entries.len(), "Expired buffered updates");
        }
        Some(evicted)
    }

    fn evict_expired(&mut self, now: f64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.last_sweep = None;
    }
}

impl TimeShift for UpdateBuffer {
    fn shift_time(&mut self, span: &PauseSpan) {
        for entry in self.entries.values_mut() {
            entry.expires_at += span.offset(entry.expires_at - self.ttl);
        }
        if let Some(last) = &mut self.last_sweep {
            *last += span.offset(*last);
        }
    }
}
