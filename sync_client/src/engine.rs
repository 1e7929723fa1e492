//! Sync engine.
//!
//! Owns every per-entity store and runs the per-frame pipeline:
//!
//! 1. spawn queue (bounded materializations)
//! 2. update buffer sweep
//! 3. interpolation and local simulation
//! 4. visual lifecycle (culling, hit flash, death sequence, staleness)
//! 5. fade ops (bounded)
//!
//! Messages may arrive at any point between frames and are applied
//! immediately; the engine never blocks and nothing on the message path is
//! fatal. Recoverable conditions are counted in [`SyncStats`].

use std::collections::VecDeque;

use serde::Serialize;
use serde_json::{Map, Value};
use sync_shared::{
    config::SyncConfig,
    entity::{expand_compact_row, EntityId, EntityKind, EntityPayload, PayloadEvents},
    math::{Transform, Vec3},
    net::{SharedTables, SnapshotMsg, SyncMsg, UpdateBatch},
    render::VisualBackend,
};
use tracing::{debug, info, trace};

use crate::{
    fade::FadeScheduler,
    interp::{orient, retarget, MotionUpdate},
    pause::{PauseCompensator, PlayerId, TimeShift},
    pool::ModelPool,
    record::{InterpWindow, LifecycleFlags, LocalSim, RecordStore, VisualState},
    shared_cache::SharedComponentCache,
    spawn_queue::SpawnQueue,
    stats::SyncStats,
    update_buffer::{BufferOutcome, UpdateBuffer},
};

/// Why a record was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RemovalReason {
    /// Server despawn, after the death sequence.
    Despawned,
    /// Local simulation lifetime elapsed.
    LocalExpiry,
    /// No update for too long.
    Stale,
    /// Death sequence overran its deadline.
    Watchdog,
    /// Removed by the host through [`SyncEngine::force_remove`].
    Forced,
    /// Engine reset by an initial snapshot or reconnect.
    Reset,
}

/// Notifications for the host (UI, audio, analytics).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum SyncEvent {
    Spawned { id: EntityId, kind: EntityKind },
    VisibilityChanged { id: EntityId, visible: bool },
    Removed { id: EntityId, reason: RemovalReason },
}

pub struct SyncEngine<B: VisualBackend> {
    pub(crate) cfg: SyncConfig,
    pub(crate) backend: B,
    pub(crate) records: RecordStore,
    pub(crate) spawns: SpawnQueue,
    pub(crate) buffered: UpdateBuffer,
    pub(crate) shared: SharedComponentCache,
    pub(crate) pool: ModelPool,
    pub(crate) fades: FadeScheduler,
    pub(crate) pause: PauseCompensator,
    pub(crate) camera: Vec3,
    pub(crate) stats: SyncStats,
    pub(crate) events: VecDeque<SyncEvent>,
}

impl<B: VisualBackend> SyncEngine<B> {
    pub fn new(cfg: SyncConfig, backend: B) -> Self {
        Self {
            spawns: SpawnQueue::new(cfg.spawn_compact_threshold),
            buffered: UpdateBuffer::new(cfg.update_ttl, cfg.update_buffer_cap, cfg.update_sweep_interval),
            pool: ModelPool::new(cfg.pool_cap_per_template),
            records: RecordStore::default(),
            shared: SharedComponentCache::new(),
            fades: FadeScheduler::new(),
            pause: PauseCompensator::new(),
            camera: Vec3::ZERO,
            stats: SyncStats::default(),
            events: VecDeque::new(),
            backend,
            cfg,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.cfg
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Drops all entity state. Live instances go back to the pool; the pause
    /// state and the pool itself survive.
    pub fn reset(&mut self) {
        let ids = self.records.ids();
        let released = ids.len();
        for id in ids {
            self.release_record(id, RemovalReason::Reset);
        }
        self.spawns.clear();
        self.buffered.clear();
        self.shared.clear();
        self.fades.clear();
        info!(released, "Sync state reset");
    }

    /// Resets and destroys every pooled instance.
    pub fn shutdown(&mut self) {
        self.reset();
        self.pool.clear(&mut self.backend);
    }

    // ─── Messages ───

    pub fn handle_message(&mut self, msg: SyncMsg, now: f64) {
        match msg {
            SyncMsg::Snapshot(snapshot) => self.apply_snapshot(snapshot, now),
            SyncMsg::Update(batch) => self.apply_update_batch(batch, now),
            SyncMsg::Despawn { ids } => self.apply_despawns(&ids.ids(), now),
        }
    }

    pub fn apply_snapshot(&mut self, snapshot: SnapshotMsg, now: f64) {
        if snapshot.is_initial {
            self.reset();
        }
        self.publish_shared(&snapshot.shared);
        for (key, payload) in snapshot.entities {
            self.spawn_keyed(&key, payload, None, now);
        }
        for payload in snapshot.projectile_spawns {
            self.spawn_inline(payload, Some(EntityKind::Projectile), now);
        }
        for payload in snapshot.orb_spawns {
            self.spawn_inline(payload, Some(EntityKind::ExpOrb), now);
        }
        info!(
            initial = snapshot.is_initial,
            live = self.records.len(),
            queued = self.spawns.len(),
            "Snapshot applied"
        );
    }

    pub fn apply_update_batch(&mut self, batch: UpdateBatch, now: f64) {
        self.publish_shared(&batch.shared);
        for (key, payload) in batch.entities {
            self.spawn_keyed(&key, payload, None, now);
        }
        for row in batch.projectiles.iter().chain(&batch.enemies) {
            let Some(expanded) = row.as_array().and_then(|r| expand_compact_row(r)) else {
                self.stats.malformed_entries += 1;
                continue;
            };
            self.stats.malformed_fields += u64::from(expanded.malformed);
            self.route_update(expanded.id, expanded.fields, false, now);
        }
        for update in batch.updates {
            self.route_verbose(update, false, now);
        }
        for update in batch.resyncs {
            self.route_verbose(update, true, now);
        }
        let ids: Vec<EntityId> = batch
            .despawns
            .iter()
            .filter_map(|v| {
                let id = EntityId::from_value(v);
                if id.is_none() {
                    self.stats.malformed_entries += 1;
                }
                id
            })
            .collect();
        self.apply_despawns(&ids, now);
    }

    pub fn apply_despawns(&mut self, ids: &[EntityId], now: f64) {
        for id in ids {
            self.despawn(*id, now);
        }
    }

    /// Stores shared component tables and retries records still waiting on
    /// a reference.
    pub fn publish_shared(&mut self, tables: &SharedTables) -> usize {
        if tables.is_empty() {
            return 0;
        }
        let (stored, bad_keys) = self.shared.publish_tables(tables);
        self.stats.malformed_entries += bad_keys as u64;
        if stored > 0 {
            let shared = &self.shared;
            for record in self.records.iter_mut() {
                if record.flags.contains(LifecycleFlags::PENDING_REFS) && record.retry_components(shared) {
                    debug!(id = ?record.id, "Resolved pending shared components");
                }
            }
        }
        stored
    }

    fn spawn_keyed(&mut self, key: &str, payload: Value, hint: Option<EntityKind>, now: f64) {
        match (EntityId::parse(key), payload) {
            (Some(id), Value::Object(map)) => self.spawn_or_update(id, map, hint, now),
            _ => {
                debug!(key, "Malformed entity entry");
                self.stats.malformed_entries += 1;
            }
        }
    }

    fn spawn_inline(&mut self, payload: Value, hint: Option<EntityKind>, now: f64) {
        match id_and_map(payload) {
            Some((id, map)) => self.spawn_or_update(id, map, hint, now),
            None => self.stats.malformed_entries += 1,
        }
    }

    fn route_verbose(&mut self, payload: Value, resync: bool, now: f64) {
        match id_and_map(payload) {
            Some((id, map)) => {
                self.route_update(id, map, resync, now);
            }
            None => self.stats.malformed_entries += 1,
        }
    }

    /// A spawn entry for a live id is treated as an update.
    fn spawn_or_update(&mut self, id: EntityId, payload: Map<String, Value>, hint: Option<EntityKind>, now: f64) {
        if self.records.contains(id) {
            self.apply_update(id, &payload, false, now);
        } else {
            self.enqueue_spawn(id, payload, hint, now);
        }
    }

    /// Applies an update to a live record, or buffers it until the spawn lands.
    /// Returns true if it was applied.
    pub fn route_update(&mut self, id: EntityId, payload: Map<String, Value>, resync: bool, now: f64) -> bool {
        if self.records.contains(id) {
            return self.apply_update(id, &payload, resync, now);
        }
        self.buffer_update(id, payload, now);
        false
    }

    /// Buffers an update for an id that is not live yet. It is applied as a
    /// snap once the spawn materializes, so resyncs need no separate flag.
    pub fn buffer_update(&mut self, id: EntityId, payload: Map<String, Value>, now: f64) -> BufferOutcome {
        let (outcome, evicted) = self.buffered.buffer_update(id, payload, now);
        self.stats.buffered_expired += evicted as u64;
        match outcome {
            BufferOutcome::Stored | BufferOutcome::Refreshed => self.stats.updates_buffered += 1,
            BufferOutcome::Dropped => self.stats.buffered_dropped += 1,
        }
        trace!(id = ?id, ?outcome, "Update buffered");
        outcome
    }

    /// Merges an update into a live record. `snap` teleports instead of
    /// interpolating.
    pub fn apply_update(&mut self, id: EntityId, raw: &Map<String, Value>, snap: bool, now: f64) -> bool {
        let cfg = &self.cfg;
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        let payload = EntityPayload::decode(id, raw, Some(record.kind), &self.shared);
        self.stats.malformed_fields += u64::from(payload.malformed);

        record.body.merge_from(&payload.body);
        if !payload.components.is_empty() {
            record.merge_components(payload.components);
        }
        record.extensions.extend(payload.extensions);
        record.last_update = now;

        let mut snapped = false;
        if let Some(spec) = payload.local_sim {
            // A new origin restarts local simulation from the update.
            let sim = LocalSim::from_spec(&spec, now, cfg.default_local_lifetime);
            let rotation = orient(payload.facing.unwrap_or(sim.velocity), record.ground);
            let target = Transform::new(sim.position_at(now), rotation);
            record.velocity = sim.velocity;
            record.facing = payload.facing.or(record.facing);
            record.local_sim = Some(sim);
            record.window = InterpWindow::at_rest(target, now);
            record.current = target;
        } else if payload.position.is_some() || payload.velocity.is_some() || payload.facing.is_some() {
            if payload.position.is_some() && record.local_sim.take().is_some() {
                // The server took over motion; continue from where the entity is shown.
                record.window = InterpWindow::at_rest(record.current, now);
            }
            if record.local_sim.is_some() {
                // Direction-only update on a dead-reckoned entity.
                if let Some(dir) = payload.facing.or(payload.velocity) {
                    record.window.to.rotation = orient(dir, record.ground);
                }
                record.facing = payload.facing.or(record.facing);
            } else {
                let motion = MotionUpdate {
                    position: payload.position,
                    velocity: payload.velocity,
                    facing: payload.facing,
                };
                snapped = retarget(record, motion, now, cfg, snap);
            }
        }

        if snapped {
            self.stats.hard_snaps += 1;
        }
        self.stats.updates_applied += 1;

        if payload.events.contains(PayloadEvents::HIT) {
            self.report_hit(id, now);
        }
        if payload.events.contains(PayloadEvents::DEATH) {
            self.report_death_animation(id, now);
        }
        true
    }

    /// Handles a server despawn. Live entities play their death sequence;
    /// queued spawns and buffered updates for the id are discarded.
    pub fn despawn(&mut self, id: EntityId, now: f64) {
        let cancelled = self.spawns.cancel(id);
        let discarded = self.buffered.discard(id);
        if self.records.contains(id) {
            self.begin_death(id, now, false);
        } else if cancelled || discarded {
            debug!(id = ?id, cancelled, discarded, "Despawn before materialization");
        } else {
            trace!(id = ?id, "Despawn for unknown id");
        }
    }

    /// Removes an entity immediately, skipping the death sequence.
    pub fn force_remove(&mut self, id: EntityId) -> bool {
        self.spawns.cancel(id);
        self.buffered.discard(id);
        self.release_record(id, RemovalReason::Forced)
    }

    /// The single removal path: cancels pending fades, clears the highlight,
    /// returns the instance to the pool and reports the removal.
    pub(crate) fn release_record(&mut self, id: EntityId, reason: RemovalReason) -> bool {
        let Some(record) = self.records.remove(id) else {
            return false;
        };
        self.fades.cancel(record.handle);
        if record.flags.contains(LifecycleFlags::FLASHING) {
            self.backend.set_highlight(record.handle, false);
        }
        if self.pool.release(&record.template, record.handle, &mut self.backend) {
            self.stats.pool_evictions += 1;
        }
        self.stats.removals += 1;
        self.events.push_back(SyncEvent::Removed { id, reason });
        debug!(id = ?id, ?reason, "Released");
        true
    }

    // ─── Frame ───

    /// Runs one render frame.
    ///
    /// While globally paused only death sequences and their fades advance.
    pub fn frame(&mut self, now: f64) {
        if self.pause.is_paused() {
            self.lifecycle_pass(now, true);
            self.fade_pass(now, true);
            return;
        }
        self.process_spawn_queue_frame(now);
        if let Some(evicted) = self.buffered.cleanup_expired(now) {
            self.stats.buffered_expired += evicted as u64;
        }
        self.interpolation_pass(now);
        self.lifecycle_pass(now, false);
        self.fade_pass(now, false);
    }

    fn fade_pass(&mut self, now: f64, paused: bool) {
        let (completed, executed) = self
            .fades
            .step(now, self.cfg.fade_op_budget, &mut self.backend, paused);
        self.stats.fade_ops_executed += executed as u64;
        self.stats.fades_completed += completed.len() as u64;
        self.apply_fade_completions(completed);
    }

    pub fn set_camera(&mut self, position: Vec3) {
        self.camera = position;
    }

    /// Enters or leaves the global pause. On resume every stored timestamp
    /// is shifted by the pause length; stamps taken while paused move to the
    /// resume time.
    pub fn set_global_pause(&mut self, paused: bool, now: f64) {
        if paused {
            self.pause.pause(now);
            return;
        }
        if let Some(span) = self.pause.resume(now) {
            self.records.shift_time(&span);
            self.spawns.shift_time(&span);
            self.buffered.shift_time(&span);
            self.fades.shift_time(&span);
        }
    }

    /// Individual player pauses never suppress synchronization.
    pub fn set_player_pause(&mut self, player: PlayerId, paused: bool) {
        self.pause.set_player_paused(player, paused);
    }

    pub fn is_paused(&self) -> bool {
        self.pause.is_paused()
    }

    // ─── Queries ───

    pub fn render_transform(&self, id: EntityId) -> Option<Transform> {
        self.records.get(id).map(|r| r.current)
    }

    pub fn render_position(&self, id: EntityId) -> Option<Vec3> {
        self.records.get(id).map(|r| r.current.position)
    }

    pub fn render_velocity(&self, id: EntityId) -> Option<Vec3> {
        self.records
            .get(id)
            .map(|r| r.local_sim.map_or(r.velocity, |sim| sim.velocity))
    }

    pub fn render_facing(&self, id: EntityId) -> Option<Vec3> {
        self.records.get(id).map(|r| r.current.forward())
    }

    pub fn is_visible(&self, id: EntityId) -> bool {
        self.records.get(id).is_some_and(|r| r.is_visible())
    }

    pub fn visual_state(&self, id: EntityId) -> Option<VisualState> {
        self.records.get(id).map(|r| r.state)
    }

    pub fn kind_of(&self, id: EntityId) -> Option<EntityKind> {
        self.records.get(id).map(|r| r.kind)
    }

    pub fn extension(&self, id: EntityId, key: &str) -> Option<&Value> {
        self.records.get(id)?.extensions.get(key)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.records.contains(id)
    }

    pub fn is_queued(&self, id: EntityId) -> bool {
        self.spawns.contains(id)
    }

    pub fn is_buffered(&self, id: EntityId) -> bool {
        self.buffered.contains(id)
    }

    pub fn live_ids(&self) -> Vec<EntityId> {
        self.records.ids()
    }

    pub fn live_count(&self) -> usize {
        self.records.len()
    }

    pub fn queued_count(&self) -> usize {
        self.spawns.len()
    }

    pub fn buffered_count(&self) -> usize {
        self.buffered.len()
    }

    pub fn pending_fade_ops(&self) -> usize {
        self.fades.queued_ops()
    }

    pub fn idle_pooled(&self) -> usize {
        self.pool.total_idle()
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn drain_events(&mut self) -> Vec<SyncEvent> {
        self.events.drain(..).collect()
    }
}

fn id_and_map(payload: Value) -> Option<(EntityId, Map<String, Value>)> {
    match payload {
        Value::Object(map) => Some((EntityId::from_value(map.get("id")?)?, map)),
        _ => None,
    }
}
