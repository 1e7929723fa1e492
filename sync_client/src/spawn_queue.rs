//! Spawn queue.
//!
//! Spawn requests are materialized a fixed number per frame so a burst (an
//! area ability firing dozens of projectiles) costs a few frames of latency
//! instead of one long frame. The queue is a FIFO over a `Vec` with a moving
//! head; consumed slots are compacted away once enough accumulate.

use std::{collections::HashMap, sync::Arc};

use serde_json::{Map, Value};
use sync_shared::{
    entity::{EntityId, EntityKind, EntityPayload, PayloadEvents},
    math::{Transform, Vec3},
    render::{FadePart, VisualBackend},
};
use tracing::debug;

use crate::{
    engine::{SyncEngine, SyncEvent},
    interp::orient,
    pause::{PauseSpan, TimeShift},
    pool::Acquired,
    record::{derive_ground, derive_template, EntityRecord, InterpWindow, LifecycleFlags, LocalSim, VisualState},
};

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnQueueEntry {
    pub id: EntityId,
    pub payload: Map<String, Value>,
    /// Kind implied by the message list the spawn arrived in.
    pub kind_hint: Option<EntityKind>,
    pub enqueued_at: f64,
    seq: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnOutcome {
    Queued,
    /// Id already live or queued; nothing changed.
    Duplicate,
    Materialized,
    /// Template not loaded; the spawn was dropped.
    MissingAsset,
    /// Local lifetime already over; nothing to show.
    ExpiredOnArrival,
}

#[derive(Debug)]
pub struct SpawnQueue {
    slots: Vec<Option<SpawnQueueEntry>>,
    head: usize,
    /// Live entries by id. An entry whose seq no longer matches was cancelled.
    queued: HashMap<EntityId, u64>,
    next_seq: u64,
    compact_threshold: usize,
}

impl SpawnQueue {
    pub fn new(compact_threshold: usize) -> Self {
        Self {
            slots: Vec::new(),
            head: 0,
            queued: HashMap::new(),
            next_seq: 0,
            compact_threshold: compact_threshold.max(1),
        }
    }

    /// Appends a spawn. Returns false if `id` is already queued.
    pub fn push(&mut self, id: EntityId, payload: Map<String, Value>, kind_hint: Option<EntityKind>, now: f64) -> bool {
        if self.queued.contains_key(&id) {
            return false;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queued.insert(id, seq);
        self.slots.push(Some(SpawnQueueEntry {
            id,
            payload,
            kind_hint,
            enqueued_at: now,
            seq,
        }));
        true
    }

    /// Removes the oldest live entry, skipping cancelled slots.
    pub fn pop(&mut self) -> Option<SpawnQueueEntry> {
        while self.head < self.slots.len() {
            let slot = self.slots[self.head].take();
            self.head += 1;
            if let Some(entry) = slot {
                if self.queued.get(&entry.id) == Some(&entry.seq) {
                    self.queued.remove(&entry.id);
                    return Some(entry);
                }
            }
        }
        None
    }

    /// Cancels the queued spawn for `id`, if any.
    pub fn cancel(&mut self, id: EntityId) -> bool {
        self.queued.remove(&id).is_some()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.queued.contains_key(&id)
    }

    /// Live entries.
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Drops consumed head slots once they dominate the buffer.
    pub fn compact(&mut self) -> bool {
        if self.head < self.compact_threshold || self.head * 2 < self.slots.len() {
            return false;
        }
        self.slots.drain(..self.head);
        self.head = 0;
        true
    }

    /// Slots held, including consumed and cancelled ones.
    pub fn capacity_used(&self) -> usize {
        self.slots.len()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.head = 0;
        self.queued.clear();
    }
}

impl TimeShift for SpawnQueue {
    fn shift_time(&mut self, span: &PauseSpan) {
        for entry in self.slots[self.head..].iter_mut().flatten() {
            entry.enqueued_at += span.offset(entry.enqueued_at);
        }
    }
}

impl<B: VisualBackend> SyncEngine<B> {
    /// Queues a spawn unless `id` is already live or queued.
    pub fn enqueue_spawn(
        &mut self,
        id: EntityId,
        payload: Map<String, Value>,
        kind_hint: Option<EntityKind>,
        now: f64,
    ) -> SpawnOutcome {
        if self.records.contains(id) || !self.spawns.push(id, payload, kind_hint, now) {
            self.stats.duplicate_spawns += 1;
            debug!(id = ?id, "Duplicate spawn ignored");
            return SpawnOutcome::Duplicate;
        }
        self.stats.spawns_enqueued += 1;
        SpawnOutcome::Queued
    }

    /// Materializes up to the per-frame budget of queued spawns, then applies
    /// any updates that were buffered for them. Returns the number spawned.
    pub fn process_spawn_queue_frame(&mut self, now: f64) -> usize {
        let mut spawned = Vec::new();
        for _ in 0..self.cfg.spawn_budget_per_frame {
            let Some(entry) = self.spawns.pop() else {
                break;
            };
            let id = entry.id;
            if self.materialize(entry, now) == SpawnOutcome::Materialized {
                spawned.push(id);
            }
        }
        self.spawns.compact();

        for id in &spawned {
            if let Some(buffered) = self.buffered.take(*id, now) {
                debug!(id = ?id, "Applying buffered update");
                self.stats.buffered_applied += 1;
                // Nothing has been displayed yet, so there is no motion to smooth.
                self.apply_update(*id, &buffered.payload, true, now);
            }
        }
        spawned.len()
    }

    fn materialize(&mut self, entry: SpawnQueueEntry, now: f64) -> SpawnOutcome {
        let id = entry.id;
        if self.records.contains(id) {
            self.stats.duplicate_spawns += 1;
            return SpawnOutcome::Duplicate;
        }
        let payload = EntityPayload::decode(id, &entry.payload, entry.kind_hint, &self.shared);
        self.stats.malformed_fields += u64::from(payload.malformed);

        let local_sim = payload
            .local_sim
            .map(|spec| LocalSim::from_spec(&spec, entry.enqueued_at, self.cfg.default_local_lifetime));
        if local_sim.is_some_and(|sim| sim.is_expired(now)) {
            debug!(id = ?id, "Spawn expired before materializing");
            self.stats.expired_on_arrival += 1;
            return SpawnOutcome::ExpiredOnArrival;
        }

        let template = derive_template(payload.kind, payload.model.as_deref(), &payload.components);
        let Some(acquired) = self.pool.acquire(&template, &mut self.backend) else {
            debug!(id = ?id, template = %template, "Template not loaded, dropping spawn");
            self.stats.missing_assets += 1;
            return SpawnOutcome::MissingAsset;
        };
        if matches!(acquired, Acquired::Reused(_)) {
            self.stats.pool_reuses += 1;
        }
        let handle = acquired.handle();

        let ground = derive_ground(payload.kind, &payload.components);
        let velocity = local_sim
            .map(|sim| sim.velocity)
            .or(payload.velocity)
            .unwrap_or(Vec3::ZERO);
        let rotation = orient(payload.facing.unwrap_or(velocity), ground);
        let position = match &local_sim {
            Some(sim) => sim.position_at(now),
            None => payload.position.unwrap_or(Vec3::ZERO),
        };
        let transform = Transform::new(position, rotation);
        self.backend.set_transform(handle, &transform);
        let fade_cache: Arc<[FadePart]> = self.backend.fade_parts(handle).into();

        let mut flags = LifecycleFlags::empty();
        flags.set(
            LifecycleFlags::PENDING_REFS,
            payload.components.iter().any(|c| c.is_pending()),
        );
        let kind = payload.kind;
        let events = payload.events;
        self.records.insert(EntityRecord {
            id,
            kind,
            template,
            handle,
            body: payload.body,
            components: payload.components,
            extensions: payload.extensions,
            ground,
            window: InterpWindow::at_rest(transform, now),
            local_sim,
            current: transform,
            velocity,
            facing: payload.facing,
            state: VisualState::Spawning,
            flags,
            fade_cache,
            flash: None,
            death: None,
            last_update: now,
        });
        self.on_materialized(id, now);
        self.events.push_back(SyncEvent::Spawned { id, kind });
        self.stats.spawns_materialized += 1;
        debug!(id = ?id, kind = ?kind, "Materialized");

        if events.contains(PayloadEvents::HIT) {
            self.report_hit(id, now);
        }
        if events.contains(PayloadEvents::DEATH) {
            self.report_death_animation(id, now);
        }
        SpawnOutcome::Materialized
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty() -> Map<String, Value> {
        Map::new()
    }

    #[test]
    fn fifo_with_cancellation() {
        let mut q = SpawnQueue::new(64);
        assert!(q.push(EntityId(1), empty(), None, 0.0));
        assert!(q.push(EntityId(2), empty(), None, 0.0));
        assert!(q.push(EntityId(3), empty(), None, 0.0));
        assert!(!q.push(EntityId(2), empty(), None, 0.1));
        assert!(q.cancel(EntityId(2)));
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop().map(|e| e.id), Some(EntityId(1)));
        assert_eq!(q.pop().map(|e| e.id), Some(EntityId(3)));
        assert!(q.pop().is_none());
    }

    #[test]
    fn cancelled_then_requeued_id_is_not_duplicated() {
        let mut q = SpawnQueue::new(64);
        q.push(EntityId(5), empty(), None, 0.0);
        q.cancel(EntityId(5));
        q.push(EntityId(5), empty(), Some(EntityKind::Enemy), 1.0);
        let first = q.pop().unwrap();
        assert_eq!(first.kind_hint, Some(EntityKind::Enemy));
        assert!(q.pop().is_none());
    }

    #[test]
    fn compaction_drops_consumed_slots() {
        let mut q = SpawnQueue::new(4);
        for i in 0..6 {
            q.push(EntityId(i), empty(), None, 0.0);
        }
        for _ in 0..3 {
            q.pop();
        }
        assert!(!q.compact(), "below threshold");
        q.pop();
        assert!(q.compact());
        assert_eq!(q.capacity_used(), 2);
        assert_eq!(q.pop().map(|e| e.id), Some(EntityId(4)));
    }
}
