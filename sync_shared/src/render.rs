//! Rendering abstraction.
//!
//! This crate intentionally does not depend on a graphics backend.
//! The sync engine only needs to clone templates, move instances, and set
//! per-part opacity; a renderer integration implements [`VisualBackend`].

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;

use crate::math::Transform;

/// Handle to a materialized visual instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct VisualHandle(pub u32);

/// Index of a fadeable sub-part (mesh, decal, texture) of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PartId(pub u16);

/// A fadeable part and the opacity its template was authored with.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FadePart {
    pub part: PartId,
    pub authored_opacity: f32,
}

/// What the engine needs from a renderer.
pub trait VisualBackend {
    /// Whether the template asset is loaded and can be cloned.
    fn has_template(&self, template: &str) -> bool;
    /// Clones a template. `None` if the asset is not available.
    fn instantiate(&mut self, template: &str) -> Option<VisualHandle>;
    /// Pre-resolved list of fadeable parts.
    fn fade_parts(&self, handle: VisualHandle) -> Vec<FadePart>;
    fn set_transform(&mut self, handle: VisualHandle, transform: &Transform);
    fn set_part_opacity(&mut self, handle: VisualHandle, part: PartId, opacity: f32);
    fn set_highlight(&mut self, handle: VisualHandle, on: bool);
    /// Detaches an instance from the scene while it sits in a pool.
    fn park(&mut self, handle: VisualHandle);
    /// Re-attaches a pooled instance.
    fn unpark(&mut self, handle: VisualHandle);
    fn destroy(&mut self, handle: VisualHandle);
}

/// State of one headless instance.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeadlessInstance {
    pub template: String,
    pub transform: Transform,
    pub authored: Vec<f32>,
    pub opacity: Vec<f32>,
    pub highlighted: bool,
    pub parked: bool,
}

impl HeadlessInstance {
    /// Highest part opacity; zero for instances without parts.
    pub fn max_opacity(&self) -> f32 {
        self.opacity.iter().copied().fold(0.0, f32::max)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HeadlessCounters {
    pub instantiated: u64,
    pub destroyed: u64,
    pub parked: u64,
    pub opacity_writes: u64,
}

/// In-memory backend for headless runs and tests.
#[derive(Debug, Default)]
pub struct HeadlessVisuals {
    templates: HashMap<String, Vec<f32>>,
    instances: BTreeMap<VisualHandle, HeadlessInstance>,
    next_handle: u32,
    pub counters: HeadlessCounters,
}

impl HeadlessVisuals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a template whose parts have the given authored opacities.
    pub fn register_template(&mut self, template: &str, authored: &[f32]) {
        self.templates.insert(template.to_string(), authored.to_vec());
    }

    pub fn with_template(mut self, template: &str, authored: &[f32]) -> Self {
        self.register_template(template, authored);
        self
    }

    pub fn unload_template(&mut self, template: &str) {
        self.templates.remove(template);
    }

    pub fn instance(&self, handle: VisualHandle) -> Option<&HeadlessInstance> {
        self.instances.get(&handle)
    }

    /// Instances currently in the scene (not parked).
    pub fn active_instances(&self) -> impl Iterator<Item = (VisualHandle, &HeadlessInstance)> {
        self.instances
            .iter()
            .filter(|(_, inst)| !inst.parked)
            .map(|(h, inst)| (*h, inst))
    }

    /// All instances that exist, parked or not.
    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }
}

impl VisualBackend for HeadlessVisuals {
    fn has_template(&self, template: &str) -> bool {
        self.templates.contains_key(template)
    }

    fn instantiate(&mut self, template: &str) -> Option<VisualHandle> {
        let authored = self.templates.get(template)?.clone();
        let handle = VisualHandle(self.next_handle);
        self.next_handle += 1;
        self.counters.instantiated += 1;
        self.instances.insert(
            handle,
            HeadlessInstance {
                template: template.to_string(),
                transform: Transform::default(),
                opacity: authored.clone(),
                authored,
                highlighted: false,
                parked: false,
            },
        );
        Some(handle)
    }

    fn fade_parts(&self, handle: VisualHandle) -> Vec<FadePart> {
        self.instances
            .get(&handle)
            .map(|inst| {
                inst.authored
                    .iter()
                    .enumerate()
                    .map(|(i, a)| FadePart {
                        part: PartId(i as u16),
                        authored_opacity: *a,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn set_transform(&mut self, handle: VisualHandle, transform: &Transform) {
        if let Some(inst) = self.instances.get_mut(&handle) {
            inst.transform = *transform;
        }
    }

    fn set_part_opacity(&mut self, handle: VisualHandle, part: PartId, opacity: f32) {
        if let Some(slot) = self
            .instances
            .get_mut(&handle)
            .and_then(|inst| inst.opacity.get_mut(part.0 as usize))
        {
            *slot = opacity;
            self.counters.opacity_writes += 1;
        }
    }

    fn set_highlight(&mut self, handle: VisualHandle, on: bool) {
        if let Some(inst) = self.instances.get_mut(&handle) {
            inst.highlighted = on;
        }
    }

    fn park(&mut self, handle: VisualHandle) {
        if let Some(inst) = self.instances.get_mut(&handle) {
            inst.parked = true;
            inst.highlighted = false;
            self.counters.parked += 1;
        }
    }

    fn unpark(&mut self, handle: VisualHandle) {
        if let Some(inst) = self.instances.get_mut(&handle) {
            inst.parked = false;
        }
    }

    fn destroy(&mut self, handle: VisualHandle) {
        if self.instances.remove(&handle).is_some() {
            self.counters.destroyed += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_template_does_not_instantiate() {
        let mut visuals = HeadlessVisuals::new().with_template("orb", &[1.0]);
        assert!(visuals.instantiate("brute").is_none());
        let h = visuals.instantiate("orb").unwrap();
        assert_eq!(visuals.fade_parts(h).len(), 1);
        assert_eq!(visuals.counters.instantiated, 1);
    }

    #[test]
    fn opacity_writes_ignore_unknown_parts() {
        let mut visuals = HeadlessVisuals::new().with_template("orb", &[0.8, 0.5]);
        let h = visuals.instantiate("orb").unwrap();
        visuals.set_part_opacity(h, PartId(1), 0.25);
        visuals.set_part_opacity(h, PartId(9), 0.0);
        let inst = visuals.instance(h).unwrap();
        assert_eq!(inst.opacity, vec![0.8, 0.25]);
        assert_eq!(visuals.counters.opacity_writes, 1);
    }
}
