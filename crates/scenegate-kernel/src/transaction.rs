use serde::Serialize;

use crate::host::{SceneHost, UndoGroupId};
use crate::util::now_iso8601;

pub const DEFAULT_TRANSACTION_NAME: &str = "Unnamed Transaction";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionGroup {
    pub group_id: u64,
    pub name: String,
    pub opened_at: String,
    #[serde(skip)]
    undo_marker: UndoGroupId,
}

/// Groups host mutations into one undo step. At most one group is open; a
/// second `begin` replaces the open group without closing it.
#[derive(Debug, Default)]
pub struct TransactionCoordinator {
    next_id: u64,
    open: Option<TransactionGroup>,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> Option<&TransactionGroup> {
        self.open.as_ref()
    }

    pub fn is_open(&self) -> bool {
        self.open.is_some()
    }

    /// Opens a group. Callers must have passed the stability gate already.
    pub fn begin<H: SceneHost + ?Sized>(&mut self, host: &mut H, name: &str) -> &TransactionGroup {
        let name = match name.trim() {
            "" => DEFAULT_TRANSACTION_NAME,
            trimmed => trimmed,
        };
        if let Some(previous) = &self.open {
            log::warn!(
                "transaction '{}' ({}) still open; replacing it with '{name}'",
                previous.name,
                previous.group_id
            );
        }
        self.next_id += 1;
        let undo_marker = host.begin_undo_group(name);
        log::debug!("transaction {} '{name}' opened", self.next_id);
        self.open.insert(TransactionGroup {
            group_id: self.next_id,
            name: name.to_string(),
            opened_at: now_iso8601(),
            undo_marker,
        })
    }

    /// Collapses everything since `begin` into one undo step. `None` when no
    /// group was open.
    pub fn commit<H: SceneHost + ?Sized>(&mut self, host: &mut H) -> Option<TransactionGroup> {
        let group = self.open.take()?;
        host.collapse_undo_group(group.undo_marker);
        log::info!("transaction {} '{}' committed", group.group_id, group.name);
        Some(group)
    }

    /// Reverts host state to the point `begin` was called. `None` when no
    /// group was open.
    pub fn abort<H: SceneHost + ?Sized>(&mut self, host: &mut H) -> Option<TransactionGroup> {
        let group = self.open.take()?;
        host.revert_to_undo_group(group.undo_marker);
        log::info!("transaction {} '{}' aborted", group.group_id, group.name);
        Some(group)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimObject, SimScene};

    #[test]
    fn commit_collapses_to_one_undo_step() {
        let mut scene = SimScene::new();
        let mut tx = TransactionCoordinator::new();
        tx.begin(&mut scene, "batch");
        scene.spawn_recorded(SimObject::empty("A"));
        scene.spawn_recorded(SimObject::empty("B"));
        let before = scene.undo_depth();
        let group = tx.commit(&mut scene).unwrap();
        assert_eq!(group.name, "batch");
        assert!(scene.undo_depth() < before);
        assert!(scene.find_by_path("A").is_some());
        assert!(!tx.is_open());
    }

    #[test]
    fn abort_reverts_everything_since_begin() {
        let mut scene = SimScene::new();
        scene.spawn_recorded(SimObject::empty("Keep"));
        let mut tx = TransactionCoordinator::new();
        tx.begin(&mut scene, "");
        assert_eq!(tx.current().unwrap().name, DEFAULT_TRANSACTION_NAME);
        scene.spawn_recorded(SimObject::empty("Drop"));
        tx.abort(&mut scene).unwrap();
        assert!(scene.find_by_path("Keep").is_some());
        assert!(scene.find_by_path("Drop").is_none());
    }

    #[test]
    fn nested_begin_replaces_group_with_fresh_id() {
        let mut scene = SimScene::new();
        let mut tx = TransactionCoordinator::new();
        let first = tx.begin(&mut scene, "a").group_id;
        let second = tx.begin(&mut scene, "b").group_id;
        assert!(second > first);
        assert_eq!(tx.current().unwrap().name, "b");
    }

    #[test]
    fn close_without_open_is_none() {
        let mut scene = SimScene::new();
        let mut tx = TransactionCoordinator::new();
        assert!(tx.commit(&mut scene).is_none());
        assert!(tx.abort(&mut scene).is_none());
    }
}
