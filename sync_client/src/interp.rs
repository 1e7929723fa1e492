//! Interpolation.
//!
//! The server sends discrete updates at tick boundaries.
//! The client renders at its own rate and eases each entity from where it is
//! displayed towards the latest target over a short, per-kind window.
//! Entities with a local-simulation profile skip the window entirely and are
//! dead-reckoned from `origin + velocity * elapsed`.

use sync_shared::{
    config::SyncConfig,
    entity::{EntityId, EntityKind},
    math::{Quat, Transform, Vec3},
    render::VisualBackend,
};
use tracing::debug;

use crate::{
    engine::{RemovalReason, SyncEngine},
    record::{EntityRecord, InterpWindow},
};

/// Interpolation window length for an entity moving at `velocity`.
pub fn interp_window(kind: EntityKind, velocity: Vec3, cfg: &SyncConfig) -> f64 {
    match kind {
        EntityKind::Projectile => cfg.projectile_interp_window,
        EntityKind::Enemy if velocity.horizontal().len() > cfg.fast_enemy_speed => cfg.fast_enemy_interp_window,
        _ => cfg.default_interp_window,
    }
}

/// Orientation facing `dir`; ground entities only yaw.
pub fn orient(dir: Vec3, ground: bool) -> Quat {
    Quat::look_rotation(if ground { dir.horizontal() } else { dir })
}

/// Motion carried by one update.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MotionUpdate {
    pub position: Option<Vec3>,
    pub velocity: Option<Vec3>,
    pub facing: Option<Vec3>,
}

/// Points the record's window at the new target.
///
/// Facing wins over velocity for orientation; with neither, the previous
/// orientation is kept. Errors beyond the hard-snap distance (or `force_snap`)
/// teleport instead of interpolating. Returns true on a snap.
pub fn retarget(record: &mut EntityRecord, motion: MotionUpdate, now: f64, cfg: &SyncConfig, force_snap: bool) -> bool {
    if let Some(v) = motion.velocity {
        record.velocity = v;
    }
    if motion.facing.is_some() {
        record.facing = motion.facing;
    }

    let rotation = match (motion.facing, motion.velocity) {
        (Some(f), _) => orient(f, record.ground),
        (None, Some(v)) => orient(v, record.ground),
        (None, None) => record.window.to.rotation,
    };
    let position = motion.position.unwrap_or(record.window.to.position);
    let target = Transform::new(position, rotation);

    let shown = record.window.sample(now);
    let limit = cfg.hard_snap_distance;
    let snap = force_snap || shown.position.distance_sq(position) > limit * limit;
    if snap {
        record.window = InterpWindow::at_rest(target, now);
        record.current = target;
    } else {
        record.window = InterpWindow {
            from: shown,
            to: target,
            start: now,
            end: now + interp_window(record.kind, record.velocity, cfg),
        };
    }
    snap
}

impl<B: VisualBackend> SyncEngine<B> {
    /// Computes every record's render transform for this frame and pushes it
    /// to the backend. Locally simulated entities whose lifetime ran out are
    /// removed without waiting for the server.
    pub(crate) fn interpolation_pass(&mut self, now: f64) {
        let mut expired: Vec<EntityId> = Vec::new();
        for record in self.records.iter_mut() {
            record.current = match &record.local_sim {
                Some(sim) if sim.is_expired(now) => {
                    expired.push(record.id);
                    Transform::new(sim.position_at(now), record.window.to.rotation)
                }
                Some(sim) => Transform::new(sim.position_at(now), record.window.to.rotation),
                None => record.window.sample(now),
            };
            self.backend.set_transform(record.handle, &record.current);
        }
        for id in expired {
            debug!(id = ?id, "Local lifetime elapsed");
            self.stats.local_expiries += 1;
            self.release_record(id, RemovalReason::LocalExpiry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use sync_shared::{entity::EntityBody, render::VisualHandle};

    use crate::record::{LifecycleFlags, VisualState};

    fn record(kind: EntityKind, at: Vec3) -> EntityRecord {
        let t = Transform::from_position(at);
        EntityRecord {
            id: EntityId(1),
            kind,
            template: "t".into(),
            handle: VisualHandle(0),
            body: EntityBody::Unknown,
            components: Vec::new(),
            extensions: Default::default(),
            ground: kind.is_ground(),
            window: InterpWindow::at_rest(t, 0.0),
            local_sim: None,
            current: t,
            velocity: Vec3::ZERO,
            facing: None,
            state: VisualState::Visible,
            flags: LifecycleFlags::empty(),
            fade_cache: Arc::from(Vec::new()),
            flash: None,
            death: None,
            last_update: 0.0,
        }
    }

    #[test]
    fn window_depends_on_kind_and_speed() {
        let cfg = SyncConfig::default();
        assert_eq!(interp_window(EntityKind::Projectile, Vec3::ZERO, &cfg), 0.03);
        assert_eq!(interp_window(EntityKind::Enemy, Vec3::new(1.0, 0.0, 0.0), &cfg), 0.25);
        assert_eq!(interp_window(EntityKind::Enemy, Vec3::new(20.0, 0.0, 0.0), &cfg), 0.05);
        // vertical speed does not count
        assert_eq!(interp_window(EntityKind::Enemy, Vec3::new(0.0, 50.0, 0.0), &cfg), 0.25);
    }

    #[test]
    fn small_error_interpolates() {
        let cfg = SyncConfig::default();
        let mut r = record(EntityKind::Enemy, Vec3::ZERO);
        let motion = MotionUpdate {
            position: Some(Vec3::new(2.0, 0.0, 0.0)),
            ..Default::default()
        };
        assert!(!retarget(&mut r, motion, 1.0, &cfg, false));
        assert_eq!(r.window.sample(1.0).position, Vec3::ZERO);
        assert_eq!(r.window.sample(1.125).position, Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(r.window.sample(1.25).position, Vec3::new(2.0, 0.0, 0.0));
    }

    #[test]
    fn large_error_snaps_immediately() {
        let cfg = SyncConfig::default();
        let mut r = record(EntityKind::Enemy, Vec3::ZERO);
        let far = Vec3::new(cfg.hard_snap_distance + 1.0, 0.0, 0.0);
        let motion = MotionUpdate {
            position: Some(far),
            ..Default::default()
        };
        assert!(retarget(&mut r, motion, 1.0, &cfg, false));
        assert_eq!(r.window.alpha(1.0), 1.0);
        assert_eq!(r.window.sample(1.0).position, far);
    }

    #[test]
    fn ground_entities_only_yaw() {
        let cfg = SyncConfig::default();
        let mut r = record(EntityKind::Enemy, Vec3::ZERO);
        let motion = MotionUpdate {
            velocity: Some(Vec3::new(0.0, 5.0, 5.0)),
            ..Default::default()
        };
        retarget(&mut r, motion, 0.0, &cfg, true);
        let fwd = r.window.to.forward();
        assert!(fwd.y.abs() < 1e-5);
        assert!((fwd.z - 1.0).abs() < 1e-5);

        let mut p = record(EntityKind::Projectile, Vec3::ZERO);
        retarget(&mut p, motion, 0.0, &cfg, true);
        assert!(p.window.to.forward().y > 0.5);
    }

    #[test]
    fn zero_velocity_faces_forward_and_missing_direction_keeps_rotation() {
        let cfg = SyncConfig::default();
        let mut r = record(EntityKind::Enemy, Vec3::ZERO);
        let turn = MotionUpdate {
            facing: Some(Vec3::new(1.0, 0.0, 0.0)),
            ..Default::default()
        };
        retarget(&mut r, turn, 0.0, &cfg, true);
        let turned = r.window.to.rotation;

        let move_only = MotionUpdate {
            position: Some(Vec3::new(1.0, 0.0, 0.0)),
            ..Default::default()
        };
        retarget(&mut r, move_only, 0.1, &cfg, false);
        assert_eq!(r.window.to.rotation, turned);

        let stop = MotionUpdate {
            velocity: Some(Vec3::ZERO),
            ..Default::default()
        };
        retarget(&mut r, stop, 0.2, &cfg, true);
        assert!((r.window.to.forward().z - 1.0).abs() < 1e-5);
    }
}
