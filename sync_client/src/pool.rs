//! Model pool.
//!
//! Released visual instances are parked per template key and handed back out
//! on the next spawn of that template. Each key holds a bounded ring; when it
//! is full the oldest idle instance is destroyed, so overflow costs one
//! destroy instead of a full rebuild.

use std::collections::{HashMap, VecDeque};

use sync_shared::render::{VisualBackend, VisualHandle};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    Reused(VisualHandle),
    Cloned(VisualHandle),
}

impl Acquired {
    pub fn handle(self) -> VisualHandle {
        match self {
            Acquired::Reused(h) | Acquired::Cloned(h) => h,
        }
    }
}

#[derive(Debug)]
pub struct ModelPool {
    idle: HashMap<String, VecDeque<VisualHandle>>,
    cap_per_template: usize,
}

impl ModelPool {
    pub fn new(cap_per_template: usize) -> Self {
        Self {
            idle: HashMap::new(),
            cap_per_template,
        }
    }

    /// Takes an idle instance of `template` or clones a new one.
    ///
    /// `None` means the template asset is not available.
    pub fn acquire<B: VisualBackend>(&mut self, template: &str, backend: &mut B) -> Option<Acquired> {
        if let Some(handle) = self.idle.get_mut(template).and_then(VecDeque::pop_back) {
            backend.unpark(handle);
            return Some(Acquired::Reused(handle));
        }
        if !backend.has_template(template) {
            return None;
        }
        backend.instantiate(template).map(Acquired::Cloned)
    }

    /// Parks `handle` for reuse. Returns true if an older idle instance had to
    /// be destroyed to make room.
    pub fn release<B: VisualBackend>(&mut self, template: &str, handle: VisualHandle, backend: &mut B) -> bool {
        backend.park(handle);
        if self.cap_per_template == 0 {
            backend.destroy(handle);
            return false;
        }
        let ring = self.idle.entry(template.to_string()).or_default();
        let mut evicted = false;
        if ring.len() >= self.cap_per_template {
            if let Some(oldest) = ring.pop_front() {
                warn!(template, handle = ?oldest, "Pool full, destroying oldest idle instance");
                backend.destroy(oldest);
                evicted = true;
            }
        }
        ring.push_back(handle);
        evicted
    }

    pub fn idle_count(&self, template: &str) -> usize {
        self.idle.get(template).map_or(0, VecDeque::len)
    }

    pub fn total_idle(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    /// Destroys every idle instance.
    pub fn clear<B: VisualBackend>(&mut self, backend: &mut B) {
        for (_, ring) in self.idle.drain() {
            for handle in ring {
                backend.destroy(handle);
            }
        }
    }
}
