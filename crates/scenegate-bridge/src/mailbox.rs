//! File mailbox: `inbox/<name>.json` requests, `outbox/res_<name>.json`
//! responses.

use std::ffi::OsStr;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use scenegate_kernel::{Command, KernelError};
use serde_json::Value;

use crate::error::BridgeError;

pub const RESPONSE_PREFIX: &str = "res_";

/// Outcome of reading one request file.
#[derive(Debug)]
pub enum Inbound {
    Command(Command),
    /// Unreadable or unparseable; answered with an error and still consumed.
    Malformed(KernelError),
    /// Removed by someone else between listing and reading.
    Gone,
}

#[derive(Debug, Clone)]
pub struct Mailbox {
    inbox: PathBuf,
    outbox: PathBuf,
}

impl Mailbox {
    pub fn open(inbox: impl Into<PathBuf>, outbox: impl Into<PathBuf>) -> Result<Self, BridgeError> {
        let mailbox = Self {
            inbox: inbox.into(),
            outbox: outbox.into(),
        };
        for dir in [&mailbox.inbox, &mailbox.outbox] {
            fs::create_dir_all(dir).map_err(|source| BridgeError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(mailbox)
    }

    pub fn inbox(&self) -> &Path {
        &self.inbox
    }

    pub fn outbox(&self) -> &Path {
        &self.outbox
    }

    /// Pending `.json` requests, oldest first by creation time (falling back
    /// to modification time), ties broken by file name.
    pub fn pending(&self) -> Result<Vec<PathBuf>, BridgeError> {
        let read_dir = fs::read_dir(&self.inbox).map_err(|source| BridgeError::Io {
            path: self.inbox.clone(),
            source,
        })?;
        let mut found: Vec<(SystemTime, PathBuf)> = Vec::new();
        for entry in read_dir.flatten() {
            let path = entry.path();
            if path.extension() != Some(OsStr::new("json")) {
                continue;
            }
            let Ok(meta) = entry.metadata() else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let stamp = meta
                .created()
                .or_else(|_| meta.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((stamp, path));
        }
        found.sort();
        Ok(found.into_iter().map(|(_, path)| path).collect())
    }

    pub fn read(&self, request: &Path) -> Inbound {
        match fs::read_to_string(request) {
            Ok(text) => match Command::from_json(&text) {
                Ok(command) => Inbound::Command(command),
                Err(err) => Inbound::Malformed(err),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Inbound::Gone,
            Err(err) => Inbound::Malformed(KernelError::MalformedCommand(format!(
                "unreadable request: {err}"
            ))),
        }
    }

    pub fn response_path(&self, request: &Path) -> PathBuf {
        let name = request
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.outbox.join(format!("{RESPONSE_PREFIX}{name}"))
    }

    /// Writes the response next to its final name, then renames it in place.
    pub fn respond(&self, request: &Path, body: &Value) -> io::Result<PathBuf> {
        let target = self.response_path(request);
        let mut tmp = tempfile::NamedTempFile::new_in(&self.outbox)?;
        serde_json::to_writer(&mut tmp, body).map_err(io::Error::other)?;
        tmp.write_all(b"\n")?;
        tmp.persist(&target).map_err(|err| err.error)?;
        Ok(target)
    }

    pub fn consume(&self, request: &Path) -> io::Result<()> {
        match fs::remove_file(request) {
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    }
}
