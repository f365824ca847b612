use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::host::ObjectHandle;
use crate::util::write_json_atomic;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Per-kernel session: the shared secret HTTP callers present, plus every
/// object handle created by remote commands during the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub nonce: String,
    #[serde(default)]
    pub created_handles: BTreeSet<ObjectHandle>,
}

impl Session {
    pub fn fresh() -> Self {
        Self {
            nonce: Uuid::new_v4().simple().to_string(),
            created_handles: BTreeSet::new(),
        }
    }

    /// Loads the persisted session, or creates and persists a fresh one when
    /// the file is absent or unreadable.
    pub fn load_or_create(path: &Path) -> Result<Self, SessionError> {
        match fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<Session>(&text) {
                Ok(session) if !session.nonce.is_empty() => {
                    log::info!("continuing session from {}", path.display());
                    return Ok(session);
                }
                Ok(_) => log::warn!("session at {} has no nonce; starting fresh", path.display()),
                Err(err) => log::warn!("session at {} is unreadable ({err}); starting fresh", path.display()),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(SessionError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
        let session = Session::fresh();
        session.save(path)?;
        Ok(session)
    }

    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        write_json_atomic(path, self).map_err(|source| SessionError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Records newly created handles. Returns whether anything changed.
    pub fn track_created(&mut self, handles: impl IntoIterator<Item = ObjectHandle>) -> bool {
        let before = self.created_handles.len();
        self.created_handles.extend(handles);
        self.created_handles.len() != before
    }

    /// Constant-shape comparison of a presented token against the nonce.
    pub fn authenticates(&self, token: &str) -> bool {
        token_matches(&self.nonce, token)
    }
}

/// Compares two tokens without short-circuiting on the first differing byte.
pub fn token_matches(expected: &str, presented: &str) -> bool {
    let (a, b) = (expected.as_bytes(), presented.as_bytes());
    if a.len() != b.len() || a.is_empty() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn load_or_create_persists_and_continues() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("metadata").join("session.json");
        let first = Session::load_or_create(&path).unwrap();
        assert_eq!(first.nonce.len(), 32);
        let again = Session::load_or_create(&path).unwrap();
        assert_eq!(again.nonce, first.nonce);
    }

    #[test]
    fn unreadable_session_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("session.json");
        fs::write(&path, "not json").unwrap();
        let session = Session::load_or_create(&path).unwrap();
        let stored: Session = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored.nonce, session.nonce);
    }

    #[test]
    fn created_handles_round_trip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("session.json");
        let mut session = Session::load_or_create(&path).unwrap();
        assert!(session.track_created([ObjectHandle(7), ObjectHandle(9)]));
        assert!(!session.track_created([ObjectHandle(7)]));
        session.save(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("createdHandles"));
        let reloaded = Session::load_or_create(&path).unwrap();
        assert_eq!(reloaded.created_handles.len(), 2);
    }

    #[test]
    fn token_comparison() {
        let session = Session::fresh();
        assert!(session.authenticates(&session.nonce.clone()));
        assert!(!session.authenticates(""));
        assert!(!session.authenticates("nope"));
        assert!(!token_matches("", ""));
    }
}
