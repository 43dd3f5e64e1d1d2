//! In-memory scene host
//!
//! A minimal host object model implementing [`SceneHost`]. Used by the demo CLI,
//! benches and tests; real deployments implement the traits over their own model.

use crate::tree::rules::{Edge, RuleProvider, SceneHost};
use crate::types::{AttrValue, VolatileRef};
use serde::{Deserialize, Serialize};

/// Handle to an object in a [`MemoryScene`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(usize);

impl ObjectId {
    pub fn index(self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
struct SceneObject {
    key: String,
    type_tag: String,
    name: Option<String>,
    attributes: Vec<(String, AttrValue)>,
    edges: Vec<(ObjectId, Option<String>)>,
}

impl SceneObject {
    fn new(key: &str, type_tag: &str, name: Option<&str>) -> Self {
        Self {
            key: key.to_string(),
            type_tag: type_tag.to_string(),
            name: name.map(str::to_string),
            attributes: Vec::new(),
            edges: Vec::new(),
        }
    }
}

/// Arena-backed object graph. Objects are never freed; unlinked ones become unreachable.
#[derive(Debug, Clone)]
pub struct MemoryScene {
    objects: Vec<SceneObject>,
    root: ObjectId,
    epoch: u64,
}

impl MemoryScene {
    pub fn new(root_key: &str) -> Self {
        Self {
            objects: vec![SceneObject::new(root_key, "scene", None)],
            root: ObjectId(0),
            epoch: 0,
        }
    }

    pub fn root_id(&self) -> ObjectId {
        self.root
    }

    /// Create an object and link it under `parent`.
    pub fn add_child(
        &mut self,
        parent: ObjectId,
        key: &str,
        type_tag: &str,
        membership: Option<&str>,
    ) -> ObjectId {
        let child = self.create_object(key, type_tag, None);
        self.link(&parent, &child, membership);
        child
    }

    /// Add an extra edge to an existing object (diamonds, instancing).
    pub fn link_existing(&mut self, parent: ObjectId, child: ObjectId, membership: Option<&str>) {
        self.link(&parent, &child, membership);
    }

    pub fn set(&mut self, object: ObjectId, name: &str, value: AttrValue) {
        self.set_attribute(&object, name, value);
    }

    pub fn get(&self, object: ObjectId, name: &str) -> Option<&AttrValue> {
        self.objects
            .get(object.0)?
            .attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    /// Simulate the host reallocating its memory (undo/redo, reload).
    pub fn invalidate_handles(&mut self) {
        self.epoch += 1;
    }

    /// Objects of `type_tag`, in creation order. Includes unreachable ones.
    pub fn objects_of_type(&self, type_tag: &str) -> Vec<ObjectId> {
        self.objects
            .iter()
            .enumerate()
            .filter(|(_, o)| o.type_tag == type_tag)
            .map(|(i, _)| ObjectId(i))
            .collect()
    }

    /// A small production-shaped scene: `rigs` objects, each owning a mesh, every
    /// mesh sharing one material (a diamond below the root).
    pub fn sample(rigs: usize) -> Self {
        let mut scene = MemoryScene::new("scene");
        let root = scene.root_id();
        scene.set(root, "frame", AttrValue::Int(1));
        let material = scene.create_object("shared_material", "material", Some("Shared"));
        scene.set(material, "roughness", AttrValue::Float(0.5));
        scene.link(&root, &material, Some("materials"));
        for i in 0..rigs {
            let rig = scene.add_child(root, &format!("rig_{:03}", i), "object", Some("objects"));
            scene.set(rig, "location", AttrValue::Vector(vec![i as f64, 0.0, 0.0]));
            scene.set(rig, "visible", AttrValue::Bool(true));
            let mesh = scene.add_child(rig, &format!("mesh_{:03}", i), "mesh", Some("data"));
            scene.set(mesh, "vertices", AttrValue::Int(8 + i as i64));
            scene.link(&mesh, &material, Some("materials"));
        }
        scene
    }
}

impl RuleProvider for MemoryScene {
    type Object = ObjectId;

    fn stable_key(&self, object: &ObjectId) -> String {
        self.objects
            .get(object.0)
            .map(|o| o.key.clone())
            .unwrap_or_default()
    }

    fn type_tag(&self, object: &ObjectId) -> String {
        self.objects
            .get(object.0)
            .map(|o| o.type_tag.clone())
            .unwrap_or_default()
    }

    fn display_name(&self, object: &ObjectId) -> Option<String> {
        self.objects.get(object.0).and_then(|o| o.name.clone())
    }

    fn attributes(&self, object: &ObjectId) -> Vec<(String, AttrValue)> {
        self.objects
            .get(object.0)
            .map(|o| o.attributes.clone())
            .unwrap_or_default()
    }

    fn edges(&self, object: &ObjectId) -> Vec<Edge<ObjectId>> {
        self.objects
            .get(object.0)
            .map(|o| {
                o.edges
                    .iter()
                    .map(|(child, membership)| Edge::new(*child, membership.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn volatile_ref(&self, object: &ObjectId) -> VolatileRef {
        VolatileRef((self.epoch << 32) | object.0 as u64)
    }
}

impl SceneHost for MemoryScene {
    fn root(&self) -> ObjectId {
        self.root
    }

    fn set_attribute(&mut self, object: &ObjectId, name: &str, value: AttrValue) {
        let Some(o) = self.objects.get_mut(object.0) else {
            return;
        };
        match o.attributes.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => o.attributes.push((name.to_string(), value)),
        }
    }

    fn remove_attribute(&mut self, object: &ObjectId, name: &str) {
        if let Some(o) = self.objects.get_mut(object.0) {
            o.attributes.retain(|(n, _)| n != name);
        }
    }

    fn rename(&mut self, object: &ObjectId, new_key: &str) {
        if let Some(o) = self.objects.get_mut(object.0) {
            o.key = new_key.to_string();
        }
    }

    fn create_object(&mut self, key: &str, type_tag: &str, display_name: Option<&str>) -> ObjectId {
        self.objects.push(SceneObject::new(key, type_tag, display_name));
        ObjectId(self.objects.len() - 1)
    }

    fn link(&mut self, parent: &ObjectId, child: &ObjectId, membership: Option<&str>) {
        if let Some(o) = self.objects.get_mut(parent.0) {
            o.edges.push((*child, membership.map(str::to_string)));
        }
    }

    fn unlink(&mut self, parent: &ObjectId, child: &ObjectId, membership: Option<&str>) {
        if let Some(o) = self.objects.get_mut(parent.0) {
            if let Some(pos) = o
                .edges
                .iter()
                .position(|(c, m)| c == child && m.as_deref() == membership)
            {
                o.edges.remove(pos);
            }
        }
    }

    fn clear_edges(&mut self, object: &ObjectId) {
        if let Some(o) = self.objects.get_mut(object.0) {
            o.edges.clear();
        }
    }
}
