//! Append-only file mirror for ledger entries
//!
//! One JSON line per entry, fsynced on append. After a backend wipe the
//! mirror is the authoritative source for replay.

use crate::entry::LedgerEntry;
use crate::{LedgerError, LedgerResult};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Append-only JSON-lines mirror
pub struct LedgerMirror {
    path: PathBuf,
}

fn io_err(e: std::io::Error) -> LedgerError {
    LedgerError::Mirror(e.to_string())
}

impl LedgerMirror {
    /// Open (or create) the mirror file
    pub fn open<P: AsRef<Path>>(path: P) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err)?;
        Ok(Self { path })
    }

    /// Append one entry as a JSON line and fsync
    pub fn append(&self, entry: &LedgerEntry) -> LedgerResult<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| LedgerError::Serialization(format!("Entry serialization error: {}", e)))?;
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        writeln!(file, "{}", line).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        Ok(())
    }

    /// Read every mirrored entry in append order
    pub fn read_all(&self) -> LedgerResult<Vec<LedgerEntry>> {
        let file = File::open(&self.path).map_err(io_err)?;
        let reader = BufReader::new(file);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(io_err)?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: LedgerEntry = serde_json::from_str(&line)
                .map_err(|e| LedgerError::Serialization(format!("Corrupt mirror line: {}", e)))?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Path of the mirror file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
