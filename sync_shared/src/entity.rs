//! Entity vocabulary.
//!
//! Entity payloads arrive as loosely-typed JSON maps. This module turns them
//! into tagged, per-kind structs. Decoding is tolerant: a field with the
//! wrong shape is ignored and counted, the rest of the payload still applies.

use std::{collections::BTreeMap, fmt, sync::Arc};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::math::Vec3;

/// Opaque entity id.
///
/// Accepts JSON numbers or numeric strings on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "WireId", into = "u64")]
pub struct EntityId(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum WireId {
    Num(u64),
    Float(f64),
    Text(String),
}

impl TryFrom<WireId> for EntityId {
    type Error = String;

    fn try_from(raw: WireId) -> Result<Self, Self::Error> {
        match raw {
            WireId::Num(n) => Ok(EntityId(n)),
            WireId::Float(f) => float_id(f).ok_or_else(|| format!("invalid entity id {f}")),
            WireId::Text(s) => EntityId::parse(&s).ok_or_else(|| format!("invalid entity id {s:?}")),
        }
    }
}

impl From<EntityId> for u64 {
    fn from(id: EntityId) -> u64 {
        id.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

fn float_id(f: f64) -> Option<EntityId> {
    (f.is_finite() && f >= 0.0 && f.fract() == 0.0 && f <= u64::MAX as f64).then(|| EntityId(f as u64))
}

impl EntityId {
    /// Parses a map key or string id.
    pub fn parse(s: &str) -> Option<Self> {
        s.trim().parse().ok().map(EntityId)
    }

    /// Reads an id from an arbitrary JSON value.
    pub fn from_value(v: &Value) -> Option<Self> {
        match v {
            Value::Number(n) => n.as_u64().map(EntityId).or_else(|| n.as_f64().and_then(float_id)),
            Value::String(s) => Self::parse(s),
            _ => None,
        }
    }
}

/// Entity type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Enemy,
    Projectile,
    ExpOrb,
    Powerup,
    Clone,
    Unknown,
}

impl EntityKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "enemy" => Some(EntityKind::Enemy),
            "projectile" => Some(EntityKind::Projectile),
            "orb" | "exporb" | "exp_orb" => Some(EntityKind::ExpOrb),
            "powerup" => Some(EntityKind::Powerup),
            "clone" => Some(EntityKind::Clone),
            "unknown" => Some(EntityKind::Unknown),
            _ => None,
        }
    }

    /// Template used when neither the payload nor a shared component names one.
    pub fn default_template(self) -> &'static str {
        match self {
            EntityKind::Enemy => "enemy",
            EntityKind::Projectile => "projectile",
            EntityKind::ExpOrb => "exp_orb",
            EntityKind::Powerup => "powerup",
            EntityKind::Clone => "clone",
            EntityKind::Unknown => "unknown",
        }
    }

    /// Ground entities only ever yaw; the rest orient in full 3D.
    pub fn is_ground(self) -> bool {
        !matches!(self, EntityKind::Projectile)
    }
}

/// Payload fields that reference the shared component cache, and their class.
pub const SHARED_COMPONENT_FIELDS: &[(&str, &str)] = &[("archetype", "Archetype"), ("ability", "Ability")];

/// Lookup into published shared components.
pub trait ComponentResolver {
    fn resolve(&self, class: &str, key: u64) -> Option<Arc<Value>>;
}

/// Resolver that knows nothing; every shared reference stays pending.
pub struct NoComponents;

impl ComponentResolver for NoComponents {
    fn resolve(&self, _class: &str, _key: u64) -> Option<Arc<Value>> {
        None
    }
}

/// Value of a shared-component-typed field.
#[derive(Debug, Clone, PartialEq)]
pub enum ComponentValue {
    /// Payload sent inline.
    Literal(Arc<Value>),
    /// Numeric reference into the shared cache. The key is kept until it resolves.
    Shared { key: u64, resolved: Option<Arc<Value>> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ComponentRef {
    pub class: &'static str,
    pub value: ComponentValue,
}

impl ComponentRef {
    pub fn payload(&self) -> Option<&Value> {
        match &self.value {
            ComponentValue::Literal(v) => Some(v),
            ComponentValue::Shared { resolved, .. } => resolved.as_deref(),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.value, ComponentValue::Shared { resolved: None, .. })
    }

    /// Retries a pending reference. Returns true if it resolved now.
    pub fn retry(&mut self, resolver: &dyn ComponentResolver) -> bool {
        if let ComponentValue::Shared { key, resolved } = &mut self.value {
            if resolved.is_none() {
                *resolved = resolver.resolve(self.class, *key);
                return resolved.is_some();
            }
        }
        false
    }

    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.payload()?.get(name)?.as_str()
    }

    pub fn bool_field(&self, name: &str) -> Option<bool> {
        self.payload()?.get(name)?.as_bool()
    }
}

/// Parameters for client-side dead reckoning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalSimSpec {
    pub origin: Vec3,
    pub velocity: Vec3,
    pub spawn_time: Option<f64>,
    pub lifetime: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnemyFields {
    pub health: Option<f32>,
    pub max_health: Option<f32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectileFields {
    pub owner: Option<EntityId>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrbFields {
    pub value: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PowerupFields {
    pub powerup: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloneFields {
    pub owner: Option<EntityId>,
    pub health: Option<f32>,
    pub max_health: Option<f32>,
}

/// Kind-specific state.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityBody {
    Enemy(EnemyFields),
    Projectile(ProjectileFields),
    ExpOrb(OrbFields),
    Powerup(PowerupFields),
    Clone(CloneFields),
    Unknown,
}

impl EntityBody {
    /// Overwrites every field that `newer` carries. Mismatched kinds are ignored.
    pub fn merge_from(&mut self, newer: &EntityBody) {
        fn take<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
            if src.is_some() {
                dst.clone_from(src);
            }
        }
        match (self, newer) {
            (EntityBody::Enemy(a), EntityBody::Enemy(b)) => {
                take(&mut a.health, &b.health);
                take(&mut a.max_health, &b.max_health);
            }
            (EntityBody::Projectile(a), EntityBody::Projectile(b)) => take(&mut a.owner, &b.owner),
            (EntityBody::ExpOrb(a), EntityBody::ExpOrb(b)) => take(&mut a.value, &b.value),
            (EntityBody::Powerup(a), EntityBody::Powerup(b)) => take(&mut a.powerup, &b.powerup),
            (EntityBody::Clone(a), EntityBody::Clone(b)) => {
                take(&mut a.owner, &b.owner);
                take(&mut a.health, &b.health);
                take(&mut a.max_health, &b.max_health);
            }
            _ => {}
        }
    }
}

bitflags::bitflags! {
    /// One-shot visual events carried by a payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct PayloadEvents: u8 {
        const HIT = 1 << 0;
        const DEATH = 1 << 1;
    }
}

/// A decoded spawn or update payload.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityPayload {
    pub id: EntityId,
    pub kind: EntityKind,
    pub model: Option<String>,
    pub position: Option<Vec3>,
    pub velocity: Option<Vec3>,
    pub facing: Option<Vec3>,
    pub local_sim: Option<LocalSimSpec>,
    pub body: EntityBody,
    pub components: Vec<ComponentRef>,
    pub events: PayloadEvents,
    /// Ability-specific attributes (orbit, homing, petals, ...).
    pub extensions: BTreeMap<String, Value>,
    /// Number of fields that were present but unusable.
    pub malformed: u32,
}

impl EntityPayload {
    /// Decodes a raw payload map.
    ///
    /// `kind_hint` wins over the payload's own `type` field; it comes from the
    /// message list the payload arrived in, or from the live record.
    pub fn decode(
        id: EntityId,
        raw: &Map<String, Value>,
        kind_hint: Option<EntityKind>,
        resolver: &dyn ComponentResolver,
    ) -> Self {
        let mut malformed = 0u32;
        let mut bad = |ok: bool| {
            if !ok {
                malformed += 1;
            }
        };

        let mut wire_kind = None;
        let mut model = None;
        let (mut position, mut velocity, mut facing, mut origin) = (None, None, None, None);
        let (mut spawn_time, mut lifetime) = (None, None);
        let (mut health, mut max_health, mut owner, mut value, mut powerup) = (None, None, None, None, None);
        let mut components = Vec::new();
        let mut events = PayloadEvents::empty();
        let mut extensions = BTreeMap::new();

        for (key, v) in raw {
            match key.as_str() {
                "id" => {}
                "type" => {
                    wire_kind = v.as_str().and_then(EntityKind::parse);
                    bad(wire_kind.is_some());
                }
                "model" => {
                    model = v.as_str().map(str::to_owned);
                    bad(model.is_some());
                }
                "position" => {
                    position = parse_vec3(v);
                    bad(position.is_some());
                }
                "velocity" => {
                    velocity = parse_vec3(v);
                    bad(velocity.is_some());
                }
                "facing" => {
                    facing = parse_vec3(v);
                    bad(facing.is_some());
                }
                "origin" => {
                    origin = parse_vec3(v);
                    bad(origin.is_some());
                }
                "spawnTime" => {
                    spawn_time = parse_f64(v);
                    bad(spawn_time.is_some());
                }
                "lifetime" => {
                    lifetime = parse_f64(v).filter(|l| *l >= 0.0);
                    bad(lifetime.is_some());
                }
                "health" => {
                    health = parse_f64(v).map(|h| h as f32);
                    bad(health.is_some());
                }
                "maxHealth" => {
                    max_health = parse_f64(v).map(|h| h as f32);
                    bad(max_health.is_some());
                }
                "owner" => {
                    owner = EntityId::from_value(v);
                    bad(owner.is_some());
                }
                "value" => {
                    value = v.as_u64().and_then(|n| u32::try_from(n).ok());
                    bad(value.is_some());
                }
                "powerup" => {
                    powerup = v.as_str().map(str::to_owned);
                    bad(powerup.is_some());
                }
                "hit" => match v.as_bool() {
                    Some(true) => events |= PayloadEvents::HIT,
                    Some(false) => {}
                    None => bad(false),
                },
                "dying" => match v.as_bool() {
                    Some(true) => events |= PayloadEvents::DEATH,
                    Some(false) => {}
                    None => bad(false),
                },
                other => {
                    if let Some(class) = shared_class(other) {
                        let component = parse_component(class, v, resolver);
                        bad(component.is_some());
                        components.extend(component);
                    } else {
                        extensions.insert(other.to_owned(), v.clone());
                    }
                }
            }
        }

        let kind = kind_hint.or(wire_kind).unwrap_or(EntityKind::Unknown);
        let body = match kind {
            EntityKind::Enemy => EntityBody::Enemy(EnemyFields { health, max_health }),
            EntityKind::Projectile => EntityBody::Projectile(ProjectileFields { owner }),
            EntityKind::ExpOrb => EntityBody::ExpOrb(OrbFields { value }),
            EntityKind::Powerup => EntityBody::Powerup(PowerupFields { powerup }),
            EntityKind::Clone => EntityBody::Clone(CloneFields {
                owner,
                health,
                max_health,
            }),
            EntityKind::Unknown => EntityBody::Unknown,
        };

        let local_sim = origin.map(|origin| LocalSimSpec {
            origin,
            velocity: velocity.unwrap_or(Vec3::ZERO),
            spawn_time,
            lifetime,
        });

        Self {
            id,
            kind,
            model,
            position,
            velocity,
            facing,
            local_sim,
            body,
            components,
            events,
            extensions,
            malformed,
        }
    }
}

fn shared_class(field: &str) -> Option<&'static str> {
    SHARED_COMPONENT_FIELDS
        .iter()
        .find(|(name, _)| *name == field)
        .map(|(_, class)| *class)
}

fn parse_component(class: &'static str, v: &Value, resolver: &dyn ComponentResolver) -> Option<ComponentRef> {
    let value = match v {
        Value::Number(n) => {
            let key = n.as_u64()?;
            ComponentValue::Shared {
                key,
                resolved: resolver.resolve(class, key),
            }
        }
        Value::Object(_) => ComponentValue::Literal(Arc::new(v.clone())),
        _ => return None,
    };
    Some(ComponentRef { class, value })
}

/// Reads `[x, y, z]` or `{ "x": .., "y": .., "z": .. }`.
pub fn parse_vec3(v: &Value) -> Option<Vec3> {
    let (x, y, z) = match v {
        Value::Array(items) if items.len() >= 3 => (items[0].as_f64()?, items[1].as_f64()?, items[2].as_f64()?),
        Value::Object(map) => (
            map.get("x")?.as_f64()?,
            map.get("y")?.as_f64()?,
            map.get("z")?.as_f64()?,
        ),
        _ => return None,
    };
    let out = Vec3::new(x as f32, y as f32, z as f32);
    out.is_finite().then_some(out)
}

fn parse_f64(v: &Value) -> Option<f64> {
    v.as_f64().filter(|f| f.is_finite())
}

/// A compact numeric row rewritten into the verbose payload form.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpandedRow {
    pub id: EntityId,
    pub fields: Map<String, Value>,
    /// Vector groups dropped because an entry was not a number.
    pub malformed: u32,
}

/// Expands `[id, px, py, pz, vx, vy, vz, (fx, fy, fz)]`.
///
/// Each vector group is kept only if all three entries are numbers. Rows
/// without a usable id yield `None`.
pub fn expand_compact_row(row: &[Value]) -> Option<ExpandedRow> {
    let id = EntityId::from_value(row.first()?)?;
    let mut fields = Map::new();
    let mut malformed = 0;
    for (name, start) in [("position", 1), ("velocity", 4), ("facing", 7)] {
        let Some(group) = row.get(start..start + 3) else {
            continue;
        };
        if group.iter().all(|v| v.as_f64().is_some_and(f64::is_finite)) {
            fields.insert(name.to_owned(), Value::Array(group.to_vec()));
        } else {
            malformed += 1;
        }
    }
    Some(ExpandedRow { id, fields, malformed })
}
