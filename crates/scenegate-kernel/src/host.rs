//! Narrow boundary between the kernel and the embedding scene editor.
//!
//! The kernel never talks to a scene-graph API directly. Everything it needs
//! from the host (stability, handle liveness, lookups, structural fingerprints,
//! undo grouping) goes through [`SceneHost`]; concrete mutations are supplied
//! as named capability handlers (see [`crate::dispatch`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::registry::Fingerprint;

/// Volatile, non-owning reference to a live host object.
///
/// Handles do not survive renames, reparents or reloads; never treat one as a
/// stable identity. Revalidate with [`SceneHost::is_live`] before every use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectHandle(pub i64);

impl ObjectHandle {
    /// Parses a raw numeric reference such as `"-1204"`.
    pub fn parse(text: &str) -> Option<Self> {
        text.trim().parse::<i64>().ok().map(ObjectHandle)
    }

    pub fn raw(self) -> i64 {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Marker returned by the host when an undo group is opened.
pub type UndoGroupId = i64;

/// Snapshot of the host conditions under which mutation is unsafe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStability {
    pub compiling: bool,
    pub changing_play_mode: bool,
    pub importing: bool,
}

impl HostStability {
    pub fn is_stable(&self) -> bool {
        !self.compiling && !self.changing_play_mode && !self.importing
    }

    pub fn unstable_reasons(&self) -> Vec<&'static str> {
        let mut reasons = Vec::new();
        if self.compiling {
            reasons.push("compiling");
        }
        if self.changing_play_mode {
            reasons.push("changing play mode");
        }
        if self.importing {
            reasons.push("importing assets");
        }
        reasons
    }

    /// Coarse editor state label published in the health file.
    pub fn editor_state(&self) -> &'static str {
        if self.compiling {
            "Compiling"
        } else if self.changing_play_mode {
            "Playing"
        } else if self.importing {
            "Importing"
        } else {
            "Ready"
        }
    }
}

#[derive(Debug, Error)]
#[error("host query failed: {0}")]
pub struct HostError(pub String);

/// Host capability provider. Only ever called from the worker thread.
pub trait SceneHost {
    /// Current stability flags. An error is treated as unstable.
    fn stability(&self) -> Result<HostStability, HostError>;

    fn is_live(&self, handle: ObjectHandle) -> bool;

    /// Looks an object up by name or slash-separated path in the project and
    /// scene namespaces.
    fn find_by_path(&self, path: &str) -> Option<ObjectHandle>;

    /// Every live object, in the host's enumeration order.
    fn live_objects(&self) -> Vec<ObjectHandle>;

    /// Structural signature of an object, or `None` if it carries no mesh.
    fn fingerprint(&self, handle: ObjectHandle) -> Option<Fingerprint>;

    /// Opens a named undo group and returns its marker.
    fn begin_undo_group(&mut self, name: &str) -> UndoGroupId;

    /// Collapses every undo step recorded since `group` into a single step.
    fn collapse_undo_group(&mut self, group: UndoGroupId);

    /// Reverts every change recorded since `group` was opened.
    fn revert_to_undo_group(&mut self, group: UndoGroupId);
}
