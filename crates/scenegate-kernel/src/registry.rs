//! Identity registry: stable semantic roles mapped onto volatile host handles.
//!
//! A reference is resolved through an ordered fallback chain, stopping at the
//! first success:
//!
//! 1. raw numeric handle (`"1042"`)
//! 2. `sem:<role>` via the entry's cached `last_known_handle`
//! 3. path lookup in the host namespaces
//! 4. full scan comparing structural [`Fingerprint`]s
//!
//! Any success through steps 2-4 for a `sem:` reference rewrites the cached
//! handle and persists the registry.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::host::{ObjectHandle, SceneHost};
use crate::util::write_json_atomic;

/// Prefix that marks a reference as a semantic role lookup.
pub const SEMANTIC_PREFIX: &str = "sem:";

/// Structural signature of a host object. Equality is exact on every field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub primary_asset_name: String,
    pub vertex_count: u32,
    pub triangle_count: u32,
    pub component_type_names: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub id: Uuid,
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Weak back-reference; may dangle after any structural edit.
    #[serde(default)]
    pub last_known_handle: Option<ObjectHandle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_index: Option<i32>,
    #[serde(default)]
    pub fingerprint: Option<Fingerprint>,
}

/// Parameters for [`IdentityRegistry::register`].
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub role: String,
    pub id: Option<Uuid>,
    pub group: Option<String>,
    pub slot_index: Option<i32>,
}

/// Which step of the fallback chain produced a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedVia {
    RawHandle,
    CachedHandle,
    Path,
    Fingerprint,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolution {
    pub handle: ObjectHandle,
    pub via: ResolvedVia,
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("registry decode error: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("role must not be empty")]
    EmptyRole,
    #[error("object {0} has no mesh to fingerprint")]
    NoFingerprint(ObjectHandle),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("{0}")]
    NotFound(String),
    #[error("{reference} (ambiguous fingerprint: {candidates} candidates)")]
    Ambiguous { reference: String, candidates: usize },
}

#[derive(Debug, Default)]
pub struct IdentityRegistry {
    path: Option<PathBuf>,
    entries: Vec<RegistryEntry>,
}

impl IdentityRegistry {
    /// Registry without durable storage.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens the registry file at `path`. A missing file yields an empty
    /// registry; an unreadable one is moved aside so it is not overwritten.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let mut registry = Self {
            path: Some(path.into()),
            entries: Vec::new(),
        };
        registry.reload()?;
        Ok(registry)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Re-reads entries from disk, replacing the in-memory set.
    pub fn reload(&mut self) -> Result<(), RegistryError> {
        let Some(path) = self.path.clone() else {
            return Ok(());
        };
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                self.entries.clear();
                return Ok(());
            }
            Err(source) => return Err(RegistryError::Io { path, source }),
        };
        match serde_json::from_str::<Vec<RegistryEntry>>(&text) {
            Ok(entries) => {
                self.entries = entries;
                log::debug!("loaded {} registry entries from {}", self.entries.len(), path.display());
            }
            Err(err) => {
                let aside = path.with_extension("json.corrupt");
                log::warn!(
                    "registry {} is unreadable ({err}); moving it to {} and starting empty",
                    path.display(),
                    aside.display()
                );
                fs::rename(&path, &aside).map_err(|source| RegistryError::Io {
                    path: aside.clone(),
                    source,
                })?;
                self.entries.clear();
            }
        }
        Ok(())
    }

    pub fn save(&self) -> Result<(), RegistryError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_json_atomic(path, &self.entries).map_err(|source| RegistryError::Io {
            path: path.clone(),
            source,
        })
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn by_role(&self, role: &str) -> Option<&RegistryEntry> {
        self.entries.iter().find(|entry| entry.role == role)
    }

    /// All entries tagged with `group`, for background synchronization passes.
    pub fn by_group(&self, group: &str) -> Vec<&RegistryEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.group.as_deref() == Some(group))
            .collect()
    }

    /// Upserts an entry for `handle` under `registration.role`, replacing any
    /// entry that shares the role or the id. Computes a fresh fingerprint.
    pub fn register<H: SceneHost + ?Sized>(
        &mut self,
        host: &H,
        handle: ObjectHandle,
        registration: Registration,
    ) -> Result<RegistryEntry, RegistryError> {
        let role = registration.role.trim().to_string();
        if role.is_empty() {
            return Err(RegistryError::EmptyRole);
        }
        let fingerprint = host
            .fingerprint(handle)
            .ok_or(RegistryError::NoFingerprint(handle))?;
        let id = registration.id.unwrap_or_else(Uuid::new_v4);
        let entry = RegistryEntry {
            id,
            role: role.clone(),
            group: registration.group.filter(|g| !g.is_empty()),
            last_known_handle: Some(handle),
            slot_index: registration.slot_index,
            fingerprint: Some(fingerprint),
        };
        self.entries.retain(|existing| existing.role != role && existing.id != id);
        self.entries.push(entry.clone());
        self.save()?;
        log::info!("registered {handle} as '{role}' ({id})");
        Ok(entry)
    }

    /// Resolves `reference` to a live handle through the fallback chain.
    pub fn resolve<H: SceneHost + ?Sized>(
        &mut self,
        host: &H,
        reference: &str,
    ) -> Result<Resolution, ResolveError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ResolveError::NotFound("empty reference".into()));
        }

        if let Some(handle) = ObjectHandle::parse(reference) {
            if host.is_live(handle) {
                return Ok(Resolution {
                    handle,
                    via: ResolvedVia::RawHandle,
                });
            }
        }

        let role = reference.strip_prefix(SEMANTIC_PREFIX);
        let slot = role.and_then(|role| self.entries.iter().position(|e| e.role == role));

        if let Some(idx) = slot {
            if let Some(handle) = self.entries[idx].last_known_handle {
                if revalidate(host, handle, &self.entries[idx]) {
                    return Ok(Resolution {
                        handle,
                        via: ResolvedVia::CachedHandle,
                    });
                }
            }
        }

        let path = role.unwrap_or(reference);
        if let Some(handle) = host.find_by_path(path) {
            let accepted = match slot {
                Some(idx) => matches_fingerprint(host, handle, &self.entries[idx]),
                None => true,
            };
            if accepted {
                if let Some(idx) = slot {
                    self.heal(idx, handle);
                }
                return Ok(Resolution {
                    handle,
                    via: ResolvedVia::Path,
                });
            }
        }

        if let Some(idx) = slot {
            if let Some(fingerprint) = self.entries[idx].fingerprint.clone() {
                let candidates: Vec<ObjectHandle> = host
                    .live_objects()
                    .into_iter()
                    .filter(|candidate| host.fingerprint(*candidate).as_ref() == Some(&fingerprint))
                    .collect();
                match candidates.as_slice() {
                    [] => {}
                    [handle] => {
                        let handle = *handle;
                        self.heal(idx, handle);
                        return Ok(Resolution {
                            handle,
                            via: ResolvedVia::Fingerprint,
                        });
                    }
                    many => {
                        log::warn!(
                            "fingerprint for '{reference}' matches {} live objects; refusing to guess",
                            many.len()
                        );
                        return Err(ResolveError::Ambiguous {
                            reference: reference.to_string(),
                            candidates: many.len(),
                        });
                    }
                }
            }
        }

        Err(ResolveError::NotFound(reference.to_string()))
    }

    /// Drops entries whose cached handle and fingerprint both fail to resolve.
    /// Returns the removed entries.
    pub fn sanitize<H: SceneHost + ?Sized>(
        &mut self,
        host: &H,
    ) -> Result<Vec<RegistryEntry>, RegistryError> {
        let live: Vec<ObjectHandle> = host.live_objects();
        let (keep, dropped): (Vec<_>, Vec<_>) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|entry| {
                let handle_ok = entry
                    .last_known_handle
                    .is_some_and(|handle| revalidate(host, handle, entry));
                let fingerprint_ok = entry.fingerprint.as_ref().is_some_and(|fingerprint| {
                    live.iter()
                        .any(|candidate| host.fingerprint(*candidate).as_ref() == Some(fingerprint))
                });
                handle_ok || fingerprint_ok
            });
        self.entries = keep;
        if !dropped.is_empty() {
            log::info!("sanitize dropped {} unresolvable registry entries", dropped.len());
            self.save()?;
        }
        Ok(dropped)
    }

    fn heal(&mut self, idx: usize, handle: ObjectHandle) {
        let entry = &mut self.entries[idx];
        if entry.last_known_handle == Some(handle) {
            return;
        }
        log::info!(
            "self-healed '{}': {:?} -> {handle}",
            entry.role,
            entry.last_known_handle.map(ObjectHandle::raw)
        );
        entry.last_known_handle = Some(handle);
        if let Err(err) = self.save() {
            log::error!("failed to persist healed registry entry: {err}");
        }
    }
}

fn matches_fingerprint<H: SceneHost + ?Sized>(
    host: &H,
    handle: ObjectHandle,
    entry: &RegistryEntry,
) -> bool {
    match &entry.fingerprint {
        Some(expected) => host.fingerprint(handle).as_ref() == Some(expected),
        None => true,
    }
}

fn revalidate<H: SceneHost + ?Sized>(
    host: &H,
    handle: ObjectHandle,
    entry: &RegistryEntry,
) -> bool {
    host.is_live(handle) && matches_fingerprint(host, handle, entry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimObject, SimScene};
    use tempfile::TempDir;

    fn scene_with_body() -> (SimScene, ObjectHandle) {
        let mut scene = SimScene::new();
        let body = scene.spawn(SimObject::mesh("Body", "BodyMesh", 1200, 800).with_component("SkinnedMeshRenderer"));
        scene.spawn(SimObject::empty("Lamp").with_component("Light"));
        (scene, body)
    }

    fn register(registry: &mut IdentityRegistry, scene: &SimScene, handle: ObjectHandle, role: &str) {
        registry
            .register(
                scene,
                handle,
                Registration {
                    role: role.into(),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn raw_handle_resolves_directly() {
        let (scene, body) = scene_with_body();
        let mut registry = IdentityRegistry::in_memory();
        let res = registry.resolve(&scene, &body.to_string()).unwrap();
        assert_eq!(res.handle, body);
        assert_eq!(res.via, ResolvedVia::RawHandle);
    }

    #[test]
    fn semantic_role_uses_cached_handle() {
        let (scene, body) = scene_with_body();
        let mut registry = IdentityRegistry::in_memory();
        register(&mut registry, &scene, body, "torso");
        let res = registry.resolve(&scene, "sem:torso").unwrap();
        assert_eq!(res, Resolution { handle: body, via: ResolvedVia::CachedHandle });
    }

    #[test]
    fn path_lookup_for_plain_names() {
        let (scene, _) = scene_with_body();
        let mut registry = IdentityRegistry::in_memory();
        let res = registry.resolve(&scene, "Lamp").unwrap();
        assert_eq!(res.via, ResolvedVia::Path);
    }

    #[test]
    fn fingerprint_scan_heals_after_reload_and_persists() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.json");
        let (mut scene, body) = scene_with_body();
        let mut registry = IdentityRegistry::open(&path).unwrap();
        register(&mut registry, &scene, body, "torso");

        scene.rename(body, "Body (renamed)").unwrap();
        scene.reload();
        assert!(!scene.is_live(body));

        let res = registry.resolve(&scene, "sem:torso").unwrap();
        assert_eq!(res.via, ResolvedVia::Fingerprint);
        assert_eq!(scene.object(res.handle).unwrap().name, "Body (renamed)");
        assert_eq!(registry.by_role("torso").unwrap().last_known_handle, Some(res.handle));

        let reopened = IdentityRegistry::open(&path).unwrap();
        assert_eq!(reopened.by_role("torso").unwrap().last_known_handle, Some(res.handle));
    }

    #[test]
    fn cached_handle_reused_by_other_object_is_rejected() {
        let (mut scene, body) = scene_with_body();
        let mut registry = IdentityRegistry::in_memory();
        register(&mut registry, &scene, body, "torso");
        scene.despawn(body);
        assert!(matches!(
            registry.resolve(&scene, "sem:torso"),
            Err(ResolveError::NotFound(_))
        ));
    }

    #[test]
    fn identical_fingerprints_fail_closed() {
        let (mut scene, body) = scene_with_body();
        let mut registry = IdentityRegistry::in_memory();
        register(&mut registry, &scene, body, "torso");
        scene.spawn(SimObject::mesh("Twin", "BodyMesh", 1200, 800).with_component("SkinnedMeshRenderer"));
        scene.reload();
        let err = registry.resolve(&scene, "sem:torso").unwrap_err();
        assert_eq!(
            err,
            ResolveError::Ambiguous {
                reference: "sem:torso".into(),
                candidates: 2
            }
        );
    }

    #[test]
    fn register_upserts_by_role_and_id() {
        let (scene, body) = scene_with_body();
        let mut registry = IdentityRegistry::in_memory();
        let first = registry
            .register(&scene, body, Registration { role: "torso".into(), ..Default::default() })
            .unwrap();
        registry
            .register(
                &scene,
                body,
                Registration {
                    role: "chest".into(),
                    id: Some(first.id),
                    group: Some("outfit".into()),
                    slot_index: Some(2),
                },
            )
            .unwrap();
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_group("outfit").len(), 1);
        assert!(registry.by_role("torso").is_none());
    }

    #[test]
    fn register_requires_mesh() {
        let (scene, _) = scene_with_body();
        let lamp = scene.find_by_path("Lamp").unwrap();
        let mut registry = IdentityRegistry::in_memory();
        let err = registry
            .register(&scene, lamp, Registration { role: "key".into(), ..Default::default() })
            .unwrap_err();
        assert!(matches!(err, RegistryError::NoFingerprint(_)));
    }

    #[test]
    fn sanitize_drops_only_unresolvable_entries() {
        let (mut scene, body) = scene_with_body();
        let hat = scene.spawn(SimObject::mesh("Hat", "HatMesh", 40, 20));
        let mut registry = IdentityRegistry::in_memory();
        register(&mut registry, &scene, body, "torso");
        register(&mut registry, &scene, hat, "hat");
        scene.despawn(hat);
        scene.reload();
        let dropped = registry.sanitize(&scene).unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].role, "hat");
        assert!(registry.by_role("torso").is_some());
    }

    #[test]
    fn corrupt_file_is_moved_aside() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("registry.json");
        fs::write(&path, "[{ broken").unwrap();
        let registry = IdentityRegistry::open(&path).unwrap();
        assert!(registry.is_empty());
        assert!(tmp.path().join("registry.json.corrupt").exists());
    }
}
