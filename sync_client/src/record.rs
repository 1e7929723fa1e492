//! Entity records.
//!
//! One record per locally known entity. A record exists iff a visual instance
//! is materialized for it; every removal path goes through the engine so the
//! instance is always returned to the pool.

use std::{
    collections::{btree_map, BTreeMap},
    sync::Arc,
};

use serde::Serialize;
use serde_json::Value;
use sync_shared::{
    entity::{ComponentRef, ComponentResolver, EntityBody, EntityId, EntityKind, LocalSimSpec},
    math::{Transform, Vec3},
    render::{FadePart, VisualHandle},
};

use crate::pause::{PauseSpan, TimeShift};

/// Visual lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VisualState {
    /// Fading in after materialization.
    Spawning,
    Visible,
    /// Beyond the culling radius, faded to transparent.
    FadedOutByDistance,
    /// Hit flash / death fade in progress.
    Dying,
    /// Released; only reported in events.
    Removed,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LifecycleFlags: u8 {
        const FADED_OUT = 1 << 0;
        const SPAWNING = 1 << 1;
        const FLASHING = 1 << 2;
        const DYING = 1 << 3;
        /// A shared component reference is still unresolved.
        const PENDING_REFS = 1 << 4;
    }
}

/// Interpolation window `[from, to]` over `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InterpWindow {
    pub from: Transform,
    pub to: Transform,
    pub start: f64,
    pub end: f64,
}

impl InterpWindow {
    pub fn at_rest(t: Transform, now: f64) -> Self {
        Self {
            from: t,
            to: t,
            start: now,
            end: now,
        }
    }

    /// Progress through the window. Zero-length windows are complete.
    pub fn alpha(&self, now: f64) -> f32 {
        let span = self.end - self.start;
        if span <= 0.0 {
            return 1.0;
        }
        ((now - self.start) / span).clamp(0.0, 1.0) as f32
    }

    pub fn sample(&self, now: f64) -> Transform {
        self.from.lerp(self.to, self.alpha(now))
    }
}

/// Dead-reckoning parameters in the local timeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalSim {
    pub origin: Vec3,
    pub velocity: Vec3,
    pub spawn_time: f64,
    pub lifetime: f64,
}

impl LocalSim {
    pub fn from_spec(spec: &LocalSimSpec, now: f64, default_lifetime: f64) -> Self {
        Self {
            origin: spec.origin,
            velocity: spec.velocity,
            spawn_time: spec.spawn_time.unwrap_or(now),
            lifetime: spec.lifetime.unwrap_or(default_lifetime),
        }
    }

    /// `origin + velocity * clamp(now - spawn_time, 0, lifetime)`.
    pub fn position_at(&self, now: f64) -> Vec3 {
        let t = (now - self.spawn_time).clamp(0.0, self.lifetime);
        self.origin + self.velocity * t as f32
    }

    pub fn expires_at(&self) -> f64 {
        self.spawn_time + self.lifetime
    }

    pub fn is_expired(&self, now: f64) -> bool {
        now >= self.expires_at()
    }
}

/// Timers of a death sequence. These run on the local clock only and keep
/// running through a global pause.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeathSequence {
    pub flash_until: f64,
    /// When the fade to transparent starts.
    pub fade_at: f64,
    pub fade_started: bool,
    /// Watchdog: cleanup is forced after this.
    pub deadline: f64,
}

/// Hit highlight outside a death sequence, on the local clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HitFlash {
    pub started: f64,
    pub until: f64,
}

#[derive(Debug, Clone)]
pub struct EntityRecord {
    pub id: EntityId,
    pub kind: EntityKind,
    pub template: String,
    pub handle: VisualHandle,
    pub body: EntityBody,
    pub components: Vec<ComponentRef>,
    pub extensions: BTreeMap<String, Value>,
    /// Orient horizontally only.
    pub ground: bool,

    pub window: InterpWindow,
    pub local_sim: Option<LocalSim>,
    pub current: Transform,
    pub velocity: Vec3,
    pub facing: Option<Vec3>,

    pub state: VisualState,
    pub flags: LifecycleFlags,
    /// Fadeable parts resolved once at spawn.
    pub fade_cache: Arc<[FadePart]>,
    pub flash: Option<HitFlash>,
    pub death: Option<DeathSequence>,

    pub last_update: f64,
}

impl EntityRecord {
    pub fn is_visible(&self) -> bool {
        !self.flags.contains(LifecycleFlags::FADED_OUT)
    }

    pub fn is_dying(&self) -> bool {
        self.death.is_some()
    }

    /// Retries unresolved shared references. Returns true if any resolved.
    pub fn retry_components(&mut self, resolver: &dyn ComponentResolver) -> bool {
        let mut any = false;
        for component in &mut self.components {
            any |= component.retry(resolver);
        }
        self.flags
            .set(LifecycleFlags::PENDING_REFS, self.components.iter().any(ComponentRef::is_pending));
        if any {
            self.ground = derive_ground(self.kind, &self.components);
        }
        any
    }

    /// Replaces references of the same class with newer ones.
    pub fn merge_components(&mut self, newer: Vec<ComponentRef>) {
        for component in newer {
            match self.components.iter_mut().find(|c| c.class == component.class) {
                Some(slot) => *slot = component,
                None => self.components.push(component),
            }
        }
        self.flags
            .set(LifecycleFlags::PENDING_REFS, self.components.iter().any(ComponentRef::is_pending));
        self.ground = derive_ground(self.kind, &self.components);
    }
}

/// Template key: explicit model, then a resolved component's model, then the kind default.
pub fn derive_template(kind: EntityKind, model: Option<&str>, components: &[ComponentRef]) -> String {
    model
        .or_else(|| components.iter().find_map(|c| c.str_field("model")))
        .unwrap_or_else(|| kind.default_template())
        .to_string()
}

/// Ground kinds orient horizontally unless a component marks them flying.
pub fn derive_ground(kind: EntityKind, components: &[ComponentRef]) -> bool {
    kind.is_ground() && !components.iter().any(|c| c.bool_field("flying") == Some(true))
}

/// All live records, iterated in id order.
#[derive(Debug, Default)]
pub struct RecordStore {
    records: BTreeMap<EntityId, EntityRecord>,
}

impl RecordStore {
    pub fn insert(&mut self, record: EntityRecord) -> Option<EntityRecord> {
        self.records.insert(record.id, record)
    }

    pub fn remove(&mut self, id: EntityId) -> Option<EntityRecord> {
        self.records.remove(&id)
    }

    pub fn get(&self, id: EntityId) -> Option<&EntityRecord> {
        self.records.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut EntityRecord> {
        self.records.get_mut(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ids(&self) -> Vec<EntityId> {
        self.records.keys().copied().collect()
    }

    pub fn iter(&self) -> btree_map::Values<'_, EntityId, EntityRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> btree_map::ValuesMut<'_, EntityId, EntityRecord> {
        self.records.values_mut()
    }
}

impl TimeShift for RecordStore {
    fn shift_time(&mut self, span: &PauseSpan) {
        for r in self.records.values_mut() {
            let d = span.offset(r.window.start);
            r.window.start += d;
            r.window.end += d;
            if let Some(sim) = &mut r.local_sim {
                sim.spawn_time += span.offset(sim.spawn_time);
            }
            r.last_update += span.offset(r.last_update);
            // Death sequences ran on local time through the pause.
            if r.death.is_none() {
                if let Some(flash) = &mut r.flash {
                    let d = span.offset(flash.started);
                    flash.started += d;
                    flash.until += d;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sync_shared::entity::ComponentValue;

    #[test]
    fn zero_length_window_snaps() {
        let from = Transform::from_position(Vec3::ZERO);
        let to = Transform::from_position(Vec3::new(4.0, 0.0, 0.0));
        let w = InterpWindow {
            from,
            to,
            start: 1.0,
            end: 1.0,
        };
        assert_eq!(w.alpha(1.0), 1.0);
        assert_eq!(w.sample(0.5).position, to.position);
    }

    #[test]
    fn window_endpoints_and_monotonicity() {
        let w = InterpWindow {
            from: Transform::from_position(Vec3::ZERO),
            to: Transform::from_position(Vec3::new(10.0, 0.0, 0.0)),
            start: 2.0,
            end: 2.25,
        };
        assert_eq!(w.sample(2.0).position, Vec3::ZERO);
        assert_eq!(w.sample(2.25).position, Vec3::new(10.0, 0.0, 0.0));
        let mut last = -1.0;
        for i in 0..=25 {
            let x = w.sample(2.0 + i as f64 * 0.01).position.x;
            assert!(x >= last);
            last = x;
        }
    }

    #[test]
    fn local_sim_clamps_to_lifetime() {
        let sim = LocalSim {
            origin: Vec3::ZERO,
            velocity: Vec3::new(10.0, 0.0, 0.0),
            spawn_time: 0.0,
            lifetime: 2.0,
        };
        assert_eq!(sim.position_at(-1.0), Vec3::ZERO);
        assert_eq!(sim.position_at(1.0), Vec3::new(10.0, 0.0, 0.0));
        assert_eq!(sim.position_at(5.0), Vec3::new(20.0, 0.0, 0.0));
        assert!(!sim.is_expired(1.99));
        assert!(sim.is_expired(2.0));
    }

    #[test]
    fn template_prefers_model_then_component() {
        let component = ComponentRef {
            class: "Archetype",
            value: ComponentValue::Literal(Arc::new(json!({ "model": "brute", "flying": true }))),
        };
        assert_eq!(derive_template(EntityKind::Enemy, Some("imp"), &[component.clone()]), "imp");
        assert_eq!(derive_template(EntityKind::Enemy, None, &[component.clone()]), "brute");
        assert_eq!(derive_template(EntityKind::Enemy, None, &[]), "enemy");
        assert!(!derive_ground(EntityKind::Enemy, &[component]));
        assert!(derive_ground(EntityKind::Enemy, &[]));
        assert!(!derive_ground(EntityKind::Projectile, &[]));
    }
}
