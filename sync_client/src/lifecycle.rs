//! Visual lifecycle.
//!
//! `Spawning -> Visible <-> FadedOutByDistance -> Dying -> Removed`
//!
//! Every opacity change goes through the fade scheduler; nothing here toggles
//! visibility instantly. Culling uses two radii: instances fade out beyond
//! the cull radius and fade back in only inside the near edge, so an entity
//! hovering at the boundary does not flicker.

use sync_shared::{entity::EntityId, render::VisualBackend};
use tracing::{debug, warn};

use crate::{
    engine::{RemovalReason, SyncEngine, SyncEvent},
    fade::{CompletedFade, FadeOutcome, FadeRequest},
    record::{DeathSequence, EntityRecord, HitFlash, LifecycleFlags, VisualState},
};

fn fade_request(record: &EntityRecord, from: f32, to: f32, duration: f64, outcome: FadeOutcome) -> FadeRequest {
    FadeRequest {
        entity: record.id,
        handle: record.handle,
        parts: record.fade_cache.clone(),
        from,
        to,
        duration,
        outcome,
        must_finish: outcome == FadeOutcome::Release,
    }
}

enum Sweep {
    Stale,
    Watchdog,
}

impl<B: VisualBackend> SyncEngine<B> {
    /// Starts a fresh instance transparent. Near spawns fade in; distant ones
    /// stay faded out until the camera approaches.
    pub(crate) fn on_materialized(&mut self, id: EntityId, now: f64) {
        let Some(record) = self.records.get_mut(id) else {
            return;
        };
        for part in record.fade_cache.iter() {
            self.backend.set_part_opacity(record.handle, part.part, 0.0);
        }
        let edge = self.cfg.near_cull_edge;
        if record.current.position.distance_sq(self.camera) > edge * edge {
            record.state = VisualState::FadedOutByDistance;
            record.flags.insert(LifecycleFlags::FADED_OUT);
            return;
        }
        record.state = VisualState::Spawning;
        record.flags.insert(LifecycleFlags::SPAWNING);
        self.fades.start(
            fade_request(record, 0.0, 1.0, self.cfg.spawn_fade_duration, FadeOutcome::Shown),
            now,
        );
    }

    /// Advances culling, hit flashes, death sequences and staleness.
    ///
    /// While `paused` only death sequences advance.
    pub(crate) fn lifecycle_pass(&mut self, now: f64, paused: bool) {
        let cfg = &self.cfg;
        let out_sq = cfg.cull_radius * cfg.cull_radius;
        let in_sq = cfg.near_cull_edge * cfg.near_cull_edge;
        let mut sweeps: Vec<(EntityId, Sweep)> = Vec::new();

        for record in self.records.iter_mut() {
            if let Some(mut death) = record.death {
                if record.flags.contains(LifecycleFlags::FLASHING) && now >= death.flash_until {
                    self.backend.set_highlight(record.handle, false);
                    record.flags.remove(LifecycleFlags::FLASHING);
                }
                if !death.fade_started && now >= death.fade_at {
                    death.fade_started = true;
                    death.deadline = now + cfg.death_fade_duration + cfg.watchdog_slack;
                    let req = fade_request(record, 1.0, 0.0, cfg.death_fade_duration, FadeOutcome::Release);
                    self.fades.start(req, now);
                }
                if now > death.deadline {
                    sweeps.push((record.id, Sweep::Watchdog));
                }
                record.death = Some(death);
                continue;
            }
            if paused {
                continue;
            }

            if let Some(flash) = record.flash {
                if now >= flash.until {
                    self.backend.set_highlight(record.handle, false);
                    record.flash = None;
                    record.flags.remove(LifecycleFlags::FLASHING);
                }
            }

            if let Some(ttl) = cfg.stale_after {
                if record.local_sim.is_none() && now - record.last_update > ttl {
                    sweeps.push((record.id, Sweep::Stale));
                    continue;
                }
            }

            let dist_sq = record.current.position.distance_sq(self.camera);
            match record.state {
                VisualState::Spawning | VisualState::Visible if dist_sq > out_sq => {
                    record.state = VisualState::FadedOutByDistance;
                    record.flags.remove(LifecycleFlags::SPAWNING);
                    record.flags.insert(LifecycleFlags::FADED_OUT);
                    let req = fade_request(record, 1.0, 0.0, cfg.cull_fade_duration, FadeOutcome::Hidden);
                    self.fades.start(req, now);
                    self.events.push_back(SyncEvent::VisibilityChanged {
                        id: record.id,
                        visible: false,
                    });
                }
                VisualState::FadedOutByDistance if dist_sq < in_sq => {
                    record.state = VisualState::Visible;
                    record.flags.remove(LifecycleFlags::FADED_OUT);
                    let req = fade_request(record, 0.0, 1.0, cfg.cull_fade_duration, FadeOutcome::Shown);
                    self.fades.start(req, now);
                    self.events.push_back(SyncEvent::VisibilityChanged {
                        id: record.id,
                        visible: true,
                    });
                }
                _ => {}
            }
        }

        for (id, sweep) in sweeps {
            match sweep {
                Sweep::Stale => {
                    debug!(id = ?id, "No updates for too long, removing");
                    self.stats.stale_removals += 1;
                    self.release_record(id, RemovalReason::Stale);
                }
                Sweep::Watchdog => {
                    warn!(id = ?id, "Death fade overran its deadline, forcing cleanup");
                    self.stats.watchdog_cleanups += 1;
                    self.release_record(id, RemovalReason::Watchdog);
                }
            }
        }
    }

    pub(crate) fn apply_fade_completions(&mut self, completed: Vec<CompletedFade>) {
        for done in completed {
            let Some(record) = self.records.get_mut(done.entity).filter(|r| r.handle == done.handle) else {
                continue;
            };
            match done.outcome {
                FadeOutcome::Shown => {
                    if record.state == VisualState::Spawning {
                        record.state = VisualState::Visible;
                    }
                    record.flags.remove(LifecycleFlags::SPAWNING);
                }
                FadeOutcome::Hidden => {}
                FadeOutcome::Release => {
                    self.release_record(done.entity, RemovalReason::Despawned);
                }
            }
        }
    }

    /// Highlights the entity for the hit-flash duration, timed on the local
    /// clock. Ignored for dying entities.
    pub fn report_hit(&mut self, id: EntityId, now: f64) -> bool {
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };
        if record.is_dying() {
            return false;
        }
        self.backend.set_highlight(record.handle, true);
        record.flash = Some(HitFlash {
            started: now,
            until: now + self.cfg.hit_flash_duration,
        });
        record.flags.insert(LifecycleFlags::FLASHING);
        true
    }

    /// Death animation event from the server. An entity that is already
    /// aging (hit-flashing or mid death sequence) starts its fade at once.
    pub fn report_death_animation(&mut self, id: EntityId, now: f64) -> bool {
        let aging = self
            .records
            .get(id)
            .is_some_and(|r| r.is_dying() || r.flags.contains(LifecycleFlags::FLASHING));
        self.begin_death(id, now, aging)
    }

    /// Enters the death sequence: hit flash, buffer delay, fade, release.
    ///
    /// With `skip_flash` the fade starts immediately. Instances faded out by
    /// distance have nothing to show and are released right away.
    pub(crate) fn begin_death(&mut self, id: EntityId, now: f64, skip_flash: bool) -> bool {
        let cfg = &self.cfg;
        let Some(record) = self.records.get_mut(id) else {
            return false;
        };

        if let Some(death) = &mut record.death {
            if skip_flash && !death.fade_started {
                death.fade_started = true;
                death.fade_at = now;
                death.deadline = now + cfg.death_fade_duration + cfg.watchdog_slack;
                let req = fade_request(record, 1.0, 0.0, cfg.death_fade_duration, FadeOutcome::Release);
                self.fades.start(req, now);
            }
            return true;
        }

        if !record.is_visible() {
            self.release_record(id, RemovalReason::Despawned);
            return true;
        }

        record.state = VisualState::Dying;
        record.flags.insert(LifecycleFlags::DYING);
        record.flags.remove(LifecycleFlags::SPAWNING);
        record.flash = None;

        if skip_flash {
            record.death = Some(DeathSequence {
                flash_until: now,
                fade_at: now,
                fade_started: true,
                deadline: now + cfg.death_fade_duration + cfg.watchdog_slack,
            });
            let req = fade_request(record, 1.0, 0.0, cfg.death_fade_duration, FadeOutcome::Release);
            self.fades.start(req, now);
        } else {
            let flash_until = now + cfg.hit_flash_duration;
            let fade_at = flash_until + cfg.death_buffer_delay;
            record.death = Some(DeathSequence {
                flash_until,
                fade_at,
                fade_started: false,
                deadline: fade_at + cfg.death_fade_duration + cfg.watchdog_slack,
            });
            record.flags.insert(LifecycleFlags::FLASHING);
            self.backend.set_highlight(record.handle, true);
        }
        debug!(id = ?id, skip_flash, "Death sequence started");
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};
    use sync_shared::{config::SyncConfig, entity::EntityKind, math::Vec3, render::HeadlessVisuals};

    use super::*;

    fn engine() -> SyncEngine<HeadlessVisuals> {
        let backend = HeadlessVisuals::new().with_template("enemy", &[1.0, 0.5]);
        SyncEngine::new(SyncConfig::default(), backend)
    }

    fn spawn_enemy(e: &mut SyncEngine<HeadlessVisuals>, id: u64, at: [f32; 3], now: f64) {
        let payload: Map<String, Value> = match json!({ "position": at }) {
            Value::Object(m) => m,
            _ => Map::new(),
        };
        e.enqueue_spawn(EntityId(id), payload, Some(EntityKind::Enemy), now);
        e.frame(now);
    }

    fn opacity(e: &SyncEngine<HeadlessVisuals>, id: u64) -> f32 {
        let handle = e.records.get(EntityId(id)).unwrap().handle;
        e.backend().instance(handle).unwrap().max_opacity()
    }

    #[test]
    fn spawn_fades_in_then_becomes_visible() {
        let mut e = engine();
        spawn_enemy(&mut e, 1, [0.0, 0.0, 0.0], 0.0);
        assert_eq!(e.visual_state(EntityId(1)), Some(VisualState::Spawning));
        assert!(opacity(&e, 1) < 0.01);
        e.frame(0.15);
        e.frame(0.4);
        e.frame(0.45);
        assert_eq!(e.visual_state(EntityId(1)), Some(VisualState::Visible));
        assert!((opacity(&e, 1) - 1.0).abs() < 1e-5);
    }

    #[test]
    fn distant_spawn_starts_faded() {
        let mut e = engine();
        spawn_enemy(&mut e, 1, [190.0, 0.0, 0.0], 0.0);
        assert_eq!(e.visual_state(EntityId(1)), Some(VisualState::FadedOutByDistance));
        assert!(!e.is_visible(EntityId(1)));
        assert_eq!(e.pending_fade_ops(), 0);
    }

    #[test]
    fn culling_fades_out_and_back_in() {
        let mut e = engine();
        spawn_enemy(&mut e, 1, [0.0, 0.0, 0.0], 0.0);
        e.frame(0.5);
        e.set_camera(Vec3::new(500.0, 0.0, 0.0));
        e.frame(1.0);
        assert!(!e.is_visible(EntityId(1)));
        e.frame(1.5);
        e.frame(1.55);
        assert_eq!(opacity(&e, 1), 0.0);

        e.set_camera(Vec3::ZERO);
        e.frame(2.0);
        assert!(e.is_visible(EntityId(1)));
        e.frame(2.5);
        e.frame(2.55);
        assert!((opacity(&e, 1) - 1.0).abs() < 1e-5);
        let visibility: Vec<_> = e
            .drain_events()
            .into_iter()
            .filter(|ev| matches!(ev, SyncEvent::VisibilityChanged { .. }))
            .collect();
        assert_eq!(visibility.len(), 2);
    }

    #[test]
    fn despawn_flashes_then_fades_then_releases() {
        let mut e = engine();
        spawn_enemy(&mut e, 1, [0.0, 0.0, 0.0], 0.0);
        e.frame(0.5);
        e.despawn(EntityId(1), 1.0);
        let handle = e.records.get(EntityId(1)).unwrap().handle;
        assert_eq!(e.visual_state(EntityId(1)), Some(VisualState::Dying));
        assert!(e.backend().instance(handle).unwrap().highlighted);

        e.frame(1.12);
        assert!(!e.backend().instance(handle).unwrap().highlighted);
        e.frame(1.3);
        assert!(e.contains(EntityId(1)));
        e.frame(1.7);
        e.frame(1.75);
        assert!(!e.contains(EntityId(1)));
        assert!(e.backend().instance(handle).unwrap().parked);
        assert_eq!(e.stats().watchdog_cleanups, 0);
    }

    #[test]
    fn death_animation_on_aging_entity_skips_flash() {
        let mut e = engine();
        spawn_enemy(&mut e, 1, [0.0, 0.0, 0.0], 0.0);
        e.frame(0.5);
        e.despawn(EntityId(1), 1.0);
        assert!(e.report_death_animation(EntityId(1), 1.02));
        let death = e.records.get(EntityId(1)).unwrap().death.unwrap();
        assert!(death.fade_started);
        e.frame(1.4);
        e.frame(1.45);
        assert!(!e.contains(EntityId(1)));
    }

    #[test]
    fn watchdog_forces_cleanup() {
        let mut e = engine();
        spawn_enemy(&mut e, 1, [0.0, 0.0, 0.0], 0.0);
        e.frame(0.5);
        e.despawn(EntityId(1), 1.0);
        // lose the fade job as if its completion never fired
        let handle = e.records.get(EntityId(1)).unwrap().handle;
        e.frame(1.3);
        e.fades.cancel(handle);
        e.frame(2.0);
        assert!(e.contains(EntityId(1)));
        e.frame(3.0);
        assert!(!e.contains(EntityId(1)));
        assert_eq!(e.stats().watchdog_cleanups, 1);
    }

    #[test]
    fn faded_out_entity_is_released_on_despawn() {
        let mut e = engine();
        spawn_enemy(&mut e, 1, [190.0, 0.0, 0.0], 0.0);
        e.despawn(EntityId(1), 0.1);
        assert!(!e.contains(EntityId(1)));
    }

    #[test]
    fn hit_flash_uses_local_duration() {
        let mut e = engine();
        spawn_enemy(&mut e, 1, [0.0, 0.0, 0.0], 0.0);
        assert!(e.report_hit(EntityId(1), 0.2));
        let handle = e.records.get(EntityId(1)).unwrap().handle;
        assert!(e.backend().instance(handle).unwrap().highlighted);
        e.frame(0.25);
        assert!(e.backend().instance(handle).unwrap().highlighted);
        e.frame(0.31);
        assert!(!e.backend().instance(handle).unwrap().highlighted);
    }

    #[test]
    fn silent_entities_go_stale() {
        let mut e = engine();
        spawn_enemy(&mut e, 1, [0.0, 0.0, 0.0], 0.0);
        e.frame(29.0);
        assert!(e.contains(EntityId(1)));
        e.frame(31.0);
        assert!(!e.contains(EntityId(1)));
        assert_eq!(e.stats().stale_removals, 1);
    }
}
