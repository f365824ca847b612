//! In-memory [`SceneHost`] used by tests and by the CLI daemon.
//!
//! Objects live in a `BTreeMap` keyed by handle, so enumeration order is
//! deterministic. Every recorded mutation snapshots the object table onto an
//! undo history; undo groups are indexes into that history.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde_json::{Value, json};

use crate::dispatch::{HandlerContext, HandlerError, HandlerTable, OperationClass};
use crate::host::{HostError, HostStability, ObjectHandle, SceneHost, UndoGroupId};
use crate::registry::Fingerprint;

const FIRST_HANDLE: i64 = 1000;
const LIGHT_COMPONENT: &str = "Light";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimMesh {
    pub asset: String,
    pub vertex_count: u32,
    pub triangle_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimObject {
    pub name: String,
    pub parent: Option<ObjectHandle>,
    pub mesh: Option<SimMesh>,
    pub components: BTreeSet<String>,
    pub properties: BTreeMap<String, String>,
}

impl SimObject {
    pub fn empty(name: &str) -> Self {
        let mut components = BTreeSet::new();
        components.insert("Transform".to_string());
        Self {
            name: name.to_string(),
            parent: None,
            mesh: None,
            components,
            properties: BTreeMap::new(),
        }
    }

    pub fn mesh(name: &str, asset: &str, vertex_count: u32, triangle_count: u32) -> Self {
        let mut object = Self::empty(name).with_component("MeshRenderer");
        object.mesh = Some(SimMesh {
            asset: asset.to_string(),
            vertex_count,
            triangle_count,
        });
        object
    }

    pub fn with_component(mut self, component: &str) -> Self {
        self.components.insert(component.to_string());
        self
    }

    pub fn with_parent(mut self, parent: ObjectHandle) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}

#[derive(Debug, Clone)]
struct UndoStep {
    label: String,
    before: BTreeMap<ObjectHandle, SimObject>,
}

#[derive(Debug)]
pub struct SimScene {
    objects: BTreeMap<ObjectHandle, SimObject>,
    next_handle: i64,
    history: Vec<UndoStep>,
    group_names: HashMap<UndoGroupId, String>,
    stability: HostStability,
    probe_fails: bool,
}

impl Default for SimScene {
    fn default() -> Self {
        Self::new()
    }
}

impl SimScene {
    pub fn new() -> Self {
        Self {
            objects: BTreeMap::new(),
            next_handle: FIRST_HANDLE,
            history: Vec::new(),
            group_names: HashMap::new(),
            stability: HostStability::default(),
            probe_fails: false,
        }
    }

    /// Small avatar scene used by the CLI daemon.
    pub fn demo() -> Self {
        let mut scene = Self::new();
        let avatar = scene.spawn(SimObject::empty("Avatar").with_component("Animator"));
        scene.spawn(
            SimObject::mesh("Body", "Body_Mesh", 18_432, 30_120)
                .with_component("SkinnedMeshRenderer")
                .with_parent(avatar),
        );
        scene.spawn(
            SimObject::mesh("Hair", "Hair_Mesh", 6_210, 9_880)
                .with_component("SkinnedMeshRenderer")
                .with_parent(avatar),
        );
        scene.spawn(
            SimObject::empty("Key Light")
                .with_component(LIGHT_COMPONENT)
                .with_property("intensity", "1"),
        );
        scene
    }

    /// Adds an object without recording an undo step.
    pub fn spawn(&mut self, object: SimObject) -> ObjectHandle {
        let handle = ObjectHandle(self.next_handle);
        self.next_handle += 1;
        self.objects.insert(handle, object);
        handle
    }

    /// Adds an object as an undoable edit.
    pub fn spawn_recorded(&mut self, object: SimObject) -> ObjectHandle {
        self.record(&format!("Create {}", object.name));
        self.spawn(object)
    }

    /// Removes an object and its descendants as an undoable edit.
    pub fn despawn(&mut self, handle: ObjectHandle) -> bool {
        if !self.objects.contains_key(&handle) {
            return false;
        }
        self.record("Delete");
        let mut doomed = vec![handle];
        let mut idx = 0;
        while idx < doomed.len() {
            let parent = doomed[idx];
            doomed.extend(
                self.objects
                    .iter()
                    .filter(|(_, obj)| obj.parent == Some(parent))
                    .map(|(child, _)| *child),
            );
            idx += 1;
        }
        for handle in doomed {
            self.objects.remove(&handle);
        }
        true
    }

    pub fn rename(&mut self, handle: ObjectHandle, name: &str) -> Result<(), HandlerError> {
        if !self.objects.contains_key(&handle) {
            return Err(HandlerError::failed(format!("object {handle} is gone")));
        }
        self.record("Rename");
        if let Some(object) = self.objects.get_mut(&handle) {
            object.name = name.to_string();
        }
        Ok(())
    }

    pub fn set_property(
        &mut self,
        handle: ObjectHandle,
        key: &str,
        value: &str,
    ) -> Result<(), HandlerError> {
        if !self.objects.contains_key(&handle) {
            return Err(HandlerError::failed(format!("object {handle} is gone")));
        }
        self.record(&format!("Set {key}"));
        if let Some(object) = self.objects.get_mut(&handle) {
            object.properties.insert(key.to_string(), value.to_string());
        }
        Ok(())
    }

    /// Duplicates an object (not its children) next to the original.
    pub fn duplicate(&mut self, handle: ObjectHandle) -> Option<ObjectHandle> {
        let mut copy = self.objects.get(&handle)?.clone();
        copy.name = format!("{} (Clone)", copy.name);
        Some(self.spawn_recorded(copy))
    }

    pub fn object(&self, handle: ObjectHandle) -> Option<&SimObject> {
        self.objects.get(&handle)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Slash-separated path from the root to `handle`.
    pub fn path_of(&self, handle: ObjectHandle) -> Option<String> {
        let mut segments = Vec::new();
        let mut cursor = Some(handle);
        while let Some(current) = cursor {
            let object = self.objects.get(&current)?;
            segments.push(object.name.as_str());
            cursor = object.parent;
            if segments.len() > self.objects.len() {
                return None;
            }
        }
        segments.reverse();
        Some(segments.join("/"))
    }

    /// Reassigns every handle while keeping structure, as a domain reload
    /// would. Clears undo history.
    pub fn reload(&mut self) {
        let old = std::mem::take(&mut self.objects);
        let remap: HashMap<ObjectHandle, ObjectHandle> = old
            .keys()
            .map(|handle| {
                let fresh = ObjectHandle(self.next_handle);
                self.next_handle += 1;
                (*handle, fresh)
            })
            .collect();
        for (handle, mut object) in old {
            object.parent = object.parent.and_then(|p| remap.get(&p).copied());
            self.objects.insert(remap[&handle], object);
        }
        self.history.clear();
        self.group_names.clear();
    }

    pub fn stability_mut(&mut self) -> &mut HostStability {
        &mut self.stability
    }

    /// Makes `stability()` return an error.
    pub fn fail_stability_probe(&mut self, fail: bool) {
        self.probe_fails = fail;
    }

    pub fn undo_depth(&self) -> usize {
        self.history.len()
    }

    pub fn undo_labels(&self) -> Vec<&str> {
        self.history.iter().map(|step| step.label.as_str()).collect()
    }

    fn record(&mut self, label: &str) {
        self.history.push(UndoStep {
            label: label.to_string(),
            before: self.objects.clone(),
        });
    }
}

impl SceneHost for SimScene {
    fn stability(&self) -> Result<HostStability, HostError> {
        if self.probe_fails {
            return Err(HostError("stability probe unavailable".into()));
        }
        Ok(self.stability)
    }

    fn is_live(&self, handle: ObjectHandle) -> bool {
        self.objects.contains_key(&handle)
    }

    fn find_by_path(&self, path: &str) -> Option<ObjectHandle> {
        let path = path.trim().trim_matches('/');
        if path.is_empty() {
            return None;
        }
        let handles = self.objects.keys().copied();
        handles
            .clone()
            .find(|handle| self.path_of(*handle).as_deref() == Some(path))
            .or_else(|| {
                handles
                    .clone()
                    .find(|handle| self.objects.get(handle).is_some_and(|o| o.name == path))
            })
    }

    fn live_objects(&self) -> Vec<ObjectHandle> {
        self.objects.keys().copied().collect()
    }

    fn fingerprint(&self, handle: ObjectHandle) -> Option<Fingerprint> {
        let object = self.objects.get(&handle)?;
        let mesh = object.mesh.as_ref()?;
        Some(Fingerprint {
            primary_asset_name: mesh.asset.clone(),
            vertex_count: mesh.vertex_count,
            triangle_count: mesh.triangle_count,
            component_type_names: object.components.clone(),
        })
    }

    fn begin_undo_group(&mut self, name: &str) -> UndoGroupId {
        let marker = self.history.len() as UndoGroupId;
        self.group_names.insert(marker, name.to_string());
        marker
    }

    fn collapse_undo_group(&mut self, group: UndoGroupId) {
        let start = usize::try_from(group).unwrap_or(usize::MAX);
        let label = self.group_names.remove(&group).unwrap_or_default();
        if start >= self.history.len() {
            return;
        }
        let mut steps = self.history.split_off(start);
        let first = steps.swap_remove(0);
        self.history.push(UndoStep {
            label,
            before: first.before,
        });
    }

    fn revert_to_undo_group(&mut self, group: UndoGroupId) {
        let start = usize::try_from(group).unwrap_or(usize::MAX);
        self.group_names.remove(&group);
        if start >= self.history.len() {
            return;
        }
        let steps = self.history.split_off(start);
        if let Some(first) = steps.into_iter().next() {
            self.objects = first.before;
        }
    }
}

fn describe(scene: &SimScene, handle: ObjectHandle) -> Value {
    let Some(object) = scene.object(handle) else {
        return Value::Null;
    };
    json!({
        "handle": handle,
        "name": object.name,
        "path": scene.path_of(handle),
        "components": object.components,
        "properties": object.properties,
        "mesh": object.mesh.as_ref().map(|m| json!({
            "asset": m.asset,
            "vertexCount": m.vertex_count,
            "triangleCount": m.triangle_count,
        })),
    })
}

fn inspect(ctx: &mut HandlerContext<'_, SimScene>) -> Result<Value, HandlerError> {
    let handle = ctx.target()?;
    Ok(describe(&*ctx.host, handle))
}

fn hierarchy(ctx: &mut HandlerContext<'_, SimScene>) -> Result<Value, HandlerError> {
    let scene: &SimScene = &*ctx.host;
    let nodes: Vec<Value> = scene
        .live_objects()
        .into_iter()
        .map(|handle| json!({ "handle": handle, "path": scene.path_of(handle) }))
        .collect();
    Ok(json!({ "objects": nodes }))
}

fn rename(ctx: &mut HandlerContext<'_, SimScene>) -> Result<Value, HandlerError> {
    let handle = ctx.target()?;
    let name = ctx.require("name")?.to_string();
    if name.trim().is_empty() {
        return Err(HandlerError::InvalidArgument {
            key: "name".into(),
            reason: "must not be empty".into(),
        });
    }
    ctx.host.rename(handle, &name)?;
    Ok(json!({ "message": format!("Renamed to {name}"), "id": handle }))
}

fn delete(ctx: &mut HandlerContext<'_, SimScene>) -> Result<Value, HandlerError> {
    let handle = ctx.target()?;
    ctx.host.despawn(handle);
    Ok(json!({ "message": "Deleted", "id": handle }))
}

fn clone_object(ctx: &mut HandlerContext<'_, SimScene>) -> Result<Value, HandlerError> {
    let handle = ctx.target()?;
    let copy = ctx
        .host
        .duplicate(handle)
        .ok_or_else(|| HandlerError::failed(format!("object {handle} is gone")))?;
    ctx.created(copy);
    Ok(json!({ "message": "Cloned", "id": copy }))
}

fn spawn(ctx: &mut HandlerContext<'_, SimScene>) -> Result<Value, HandlerError> {
    let name = ctx.require("name")?.to_string();
    let count = ctx.parse::<u32>("count")?.unwrap_or(1);
    let parent = match ctx.arg("parent") {
        Some(path) => Some(
            ctx.host
                .find_by_path(path)
                .ok_or_else(|| HandlerError::failed(format!("parent '{path}' not found")))?,
        ),
        None => None,
    };
    let mut spawned = Vec::new();
    for _ in 0..count {
        let mut object = SimObject::empty(&name);
        object.parent = parent;
        let handle = ctx.host.spawn_recorded(object);
        ctx.created(handle);
        spawned.push(handle);
    }
    Ok(json!({ "message": format!("Spawned {}", spawned.len()), "ids": spawned }))
}

fn set_value(ctx: &mut HandlerContext<'_, SimScene>) -> Result<Value, HandlerError> {
    let handle = ctx.target()?;
    let key = ctx.require("key")?.to_string();
    let value = ctx.require("value")?.to_string();
    ctx.host.set_property(handle, &key, &value)?;
    Ok(json!({ "message": format!("Set {key}"), "id": handle }))
}

fn set_intensity(ctx: &mut HandlerContext<'_, SimScene>) -> Result<Value, HandlerError> {
    let handle = ctx.target()?;
    let intensity = ctx
        .parse::<f64>("intensity")?
        .ok_or_else(|| HandlerError::MissingArgument("intensity".into()))?;
    let is_light = ctx
        .host
        .object(handle)
        .is_some_and(|object| object.components.contains(LIGHT_COMPONENT));
    if !is_light {
        return Err(HandlerError::failed(format!("object {handle} has no Light")));
    }
    ctx.host.set_property(handle, "intensity", &intensity.to_string())?;
    Ok(json!({ "message": format!("Intensity set to {intensity}"), "id": handle }))
}

/// Capability handlers over [`SimScene`].
pub fn demo_handlers() -> HandlerTable<SimScene> {
    let mut table = HandlerTable::new();
    table
        .register_targeted("inspect", OperationClass::Read, "path", inspect)
        .register("hierarchy", OperationClass::Read, hierarchy)
        .register_targeted("object/rename", OperationClass::Mutate, "path", rename)
        .register_targeted("object/delete", OperationClass::Mutate, "path", delete)
        .register_targeted("object/clone", OperationClass::Mutate, "path", clone_object)
        .register("object/spawn", OperationClass::Mutate, spawn)
        .register_targeted("object/set-value", OperationClass::Mutate, "path", set_value)
        .register_targeted("light/set-intensity", OperationClass::Mutate, "path", set_intensity);
    table
}
