//! Shared component cache.
//!
//! Many entities reference the same immutable payload (enemy archetypes,
//! ability visuals) by integer key instead of repeating it on the wire.
//! Publication is last-writer-wins per `(class, key)`; classes never
//! interfere with each other.

use std::{collections::HashMap, sync::Arc};

use serde_json::Value;
use sync_shared::{entity::ComponentResolver, net::SharedTables};
use tracing::debug;

#[derive(Debug, Default)]
pub struct SharedComponentCache {
    classes: HashMap<String, HashMap<u64, Arc<Value>>>,
}

impl SharedComponentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges entries into one class. Returns the number of entries stored.
    pub fn publish_shared<I>(&mut self, class: &str, entries: I) -> usize
    where
        I: IntoIterator<Item = (u64, Value)>,
    {
        let table = self.classes.entry(class.to_string()).or_default();
        let mut stored = 0;
        for (key, payload) in entries {
            table.insert(key, Arc::new(payload));
            stored += 1;
        }
        stored
    }

    /// Publishes every class of a wire table.
    ///
    /// Returns `(stored, malformed_keys)`; entries whose key is not an
    /// unsigned integer are skipped.
    pub fn publish_tables(&mut self, tables: &SharedTables) -> (usize, usize) {
        let mut stored = 0;
        let mut malformed = 0;
        for (class, entries) in tables {
            let parsed: Vec<(u64, Value)> = entries
                .iter()
                .filter_map(|(key, payload)| match key.trim().parse::<u64>() {
                    Ok(k) => Some((k, payload.clone())),
                    Err(_) => {
                        malformed += 1;
                        None
                    }
                })
                .collect();
            stored += self.publish_shared(class, parsed);
        }
        if stored > 0 {
            debug!(stored, malformed, "Published shared components");
        }
        (stored, malformed)
    }

    pub fn resolve(&self, class: &str, key: u64) -> Option<Arc<Value>> {
        self.classes.get(class)?.get(&key).cloned()
    }

    pub fn len(&self) -> usize {
        self.classes.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.classes.clear();
    }
}

impl ComponentResolver for SharedComponentCache {
    fn resolve(&self, class: &str, key: u64) -> Option<Arc<Value>> {
        SharedComponentCache::resolve(self, class, key)
    }
}
