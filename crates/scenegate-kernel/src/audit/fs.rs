use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::{AuditEntry, AuditStore, LedgerError};

/// Newline-delimited JSON log, one [`AuditEntry`] per line.
#[derive(Debug)]
pub struct FsAuditStore {
    path: PathBuf,
}

impl FsAuditStore {
    /// Opens (or creates) the log at `path`. A partial last line left by an
    /// interrupted append is cut off so the chain resumes from the last
    /// complete entry; corrupt lines anywhere else are an error.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if !path.exists() {
            File::create(&path)?;
        }
        repair_tail(&path)?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStore for FsAuditStore {
    fn append(&mut self, entry: &AuditEntry) -> Result<(), LedgerError> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.sync_data()?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<AuditEntry>, LedgerError> {
        read_log(&self.path)
    }
}

/// How the last line of a log ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tail {
    Clean,
    /// The last entry parsed but its newline never made it to disk.
    Unterminated,
    /// The last line is a fragment; the good data ends at `offset`.
    Torn { line: usize, offset: u64 },
}

fn scan(path: &Path) -> Result<(Vec<AuditEntry>, Tail), LedgerError> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok((Vec::new(), Tail::Clean)),
        Err(err) => return Err(err.into()),
    };
    let mut reader = BufReader::new(file);
    let mut entries = Vec::new();
    let mut buf = Vec::new();
    let mut offset = 0u64;
    let mut line = 0usize;
    loop {
        buf.clear();
        let read = reader.read_until(b'\n', &mut buf)?;
        if read == 0 {
            return Ok((entries, Tail::Clean));
        }
        line += 1;
        let terminated = buf.last() == Some(&b'\n');
        if buf.iter().all(u8::is_ascii_whitespace) {
            offset += read as u64;
            continue;
        }
        match serde_json::from_slice::<AuditEntry>(&buf) {
            Ok(entry) => {
                entries.push(entry);
                if !terminated {
                    return Ok((entries, Tail::Unterminated));
                }
            }
            Err(_) if !terminated => return Ok((entries, Tail::Torn { line, offset })),
            Err(err) => {
                return Err(LedgerError::Corrupt {
                    line,
                    reason: err.to_string(),
                });
            }
        }
        offset += read as u64;
    }
}

fn repair_tail(path: &Path) -> Result<(), LedgerError> {
    let (entries, tail) = scan(path)?;
    match tail {
        Tail::Clean => {}
        Tail::Unterminated => {
            let mut file = OpenOptions::new().append(true).open(path)?;
            file.write_all(b"\n")?;
            file.sync_data()?;
        }
        Tail::Torn { line, offset } => {
            log::warn!(
                "audit log {}: discarding partial line {line} left by an interrupted write; \
                 resuming after entry {}",
                path.display(),
                entries.len()
            );
            let file = OpenOptions::new().write(true).open(path)?;
            file.set_len(offset)?;
            file.sync_data()?;
        }
    }
    Ok(())
}

/// Reads every entry of an NDJSON audit log without modifying it. A missing
/// file is an empty log and blank lines are skipped. A partial last line is
/// left out, the same way [`FsAuditStore::open`] would cut it.
pub fn read_log(path: &Path) -> Result<Vec<AuditEntry>, LedgerError> {
    let (entries, tail) = scan(path)?;
    if let Tail::Torn { line, .. } = tail {
        log::warn!("audit log {}: ignoring partial line {line}", path.display());
    }
    Ok(entries)
}
