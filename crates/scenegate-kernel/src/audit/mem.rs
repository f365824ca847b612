use std::sync::{Arc, Mutex};

use super::{AuditEntry, AuditStore, LedgerError};

/// In-memory store. Clones share the same backing vector, so a test can keep
/// a handle while the ledger owns another.
#[derive(Debug, Default, Clone)]
pub struct MemAuditStore {
    entries: Arc<Mutex<Vec<AuditEntry>>>,
}

impl MemAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

impl AuditStore for MemAuditStore {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), LedgerError> {
        let mut guard = self
            .entries
            .lock()
            .map_err(|_| std::io::Error::other("audit store lock poisoned"))?;
        guard.push(entry.clone());
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditEntry>, LedgerError> {
        Ok(self.entries())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLedger;

    #[test]
    fn clones_observe_appends() {
        let store = MemAuditStore::new();
        let mut ledger = AuditLedger::open(store.clone()).unwrap();
        ledger.record("write", "object/rename", "{}").unwrap();
        assert_eq!(store.entries().len(), 1);
        assert_eq!(ledger.entries().unwrap(), store.entries());
    }
}
