//! Append-only, hash-chained ledger of mutating actions.
//!
//! Every entry embeds the hash of its predecessor; the first entry links to
//! [`GENESIS`]. Recomputing the chain front-to-back detects any insertion,
//! deletion or edit of a stored entry.

pub mod fs;
pub mod mem;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::util::now_iso8601;

/// Previous-hash value of the first entry in a chain.
pub const GENESIS: &str = "GENESIS";

/// Prefix for serialized digests, e.g. `sha256:9f86d0...`.
pub const HASH_PREFIX: &str = "sha256:";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub previous_hash: String,
    pub timestamp: String,
    pub capability: String,
    pub action: String,
    pub details: String,
    pub entry_hash: String,
}

impl AuditEntry {
    /// Recomputes this entry's hash from its own fields.
    pub fn computed_hash(&self) -> String {
        entry_hash(
            &self.previous_hash,
            &self.timestamp,
            &self.capability,
            &self.action,
            &self.details,
        )
    }
}

/// `H(previous ‖ timestamp ‖ capability ‖ action ‖ details)`. Each field is
/// length-prefixed so that shifting bytes between adjacent fields changes the
/// digest.
pub fn entry_hash(
    previous: &str,
    timestamp: &str,
    capability: &str,
    action: &str,
    details: &str,
) -> String {
    let mut hasher = Sha256::new();
    for field in [previous, timestamp, capability, action, details] {
        hasher.update((field.len() as u64).to_le_bytes());
        hasher.update(field.as_bytes());
    }
    format!("{HASH_PREFIX}{}", hex::encode(hasher.finalize()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakKind {
    /// `previousHash` does not equal the predecessor's `entryHash`.
    PreviousHashMismatch,
    /// Stored `entryHash` does not match the recomputed digest.
    EntryHashMismatch,
}

/// First point at which a stored chain fails verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainBreak {
    pub index: usize,
    pub kind: BreakKind,
}

/// Verifies a full chain starting at [`GENESIS`]. Returns the number of
/// verified entries.
pub fn verify_chain(entries: &[AuditEntry]) -> Result<usize, ChainBreak> {
    let mut expected_prev = GENESIS;
    for (index, entry) in entries.iter().enumerate() {
        if entry.previous_hash != expected_prev {
            return Err(ChainBreak {
                index,
                kind: BreakKind::PreviousHashMismatch,
            });
        }
        if entry.computed_hash() != entry.entry_hash {
            return Err(ChainBreak {
                index,
                kind: BreakKind::EntryHashMismatch,
            });
        }
        expected_prev = &entry.entry_hash;
    }
    Ok(entries.len())
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt entry at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Durable backing for the ledger (NDJSON file, in-memory).
pub trait AuditStore: Send {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), LedgerError>;

    /// Loads the complete stored chain in append order.
    fn load_all(&self) -> Result<Vec<AuditEntry>, LedgerError>;
}

pub struct AuditLedger {
    store: Box<dyn AuditStore>,
    head: String,
    len: usize,
}

impl std::fmt::Debug for AuditLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLedger")
            .field("head", &self.head)
            .field("len", &self.len)
            .finish()
    }
}

impl AuditLedger {
    /// Opens the ledger over `store`, resuming the chain head from the last
    /// persisted entry.
    pub fn open(store: impl AuditStore + 'static) -> Result<Self, LedgerError> {
        let entries = store.load_all()?;
        let head = entries
            .last()
            .map(|entry| entry.entry_hash.clone())
            .unwrap_or_else(|| GENESIS.to_string());
        log::debug!("audit ledger opened with {} entries", entries.len());
        Ok(Self {
            store: Box::new(store),
            head,
            len: entries.len(),
        })
    }

    /// Appends an entry and advances the chain head. The head is left
    /// untouched when the store rejects the write.
    pub fn record(
        &mut self,
        capability: &str,
        action: &str,
        details: &str,
    ) -> Result<AuditEntry, LedgerError> {
        let timestamp = now_iso8601();
        let entry_hash = entry_hash(&self.head, &timestamp, capability, action, details);
        let entry = AuditEntry {
            previous_hash: self.head.clone(),
            timestamp,
            capability: capability.to_string(),
            action: action.to_string(),
            details: details.to_string(),
            entry_hash,
        };
        self.store.append(&entry)?;
        self.head = entry.entry_hash.clone();
        self.len += 1;
        Ok(entry)
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn entries(&self) -> Result<Vec<AuditEntry>, LedgerError> {
        self.store.load_all()
    }

    /// Verifies the stored chain. The outer error is a storage failure, the
    /// inner one a chain break.
    pub fn verify(&self) -> Result<Result<usize, ChainBreak>, LedgerError> {
        Ok(verify_chain(&self.store.load_all()?))
    }
}
