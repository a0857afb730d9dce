//! KeyJournal — append-only log of insert/remove events.
//!
//! # Record grammar
//! ```text
//! line := 'I' ':' len ':' keybytes '\n'
//!       | 'R' ':' len ':' keybytes '\n'
//! ```
//! `len` is the decimal byte count of the key, so keys may contain any
//! bytes (including newlines). Replaying the log in order yields the
//! active key set; malformed lines are skipped. A `DashSet` mirrors the
//! active set so `active_keys()` never re-reads the file.
//!
//! The journal is owned by the single writer; optimization reads the
//! cached set, and a read-only open of the database loads the file once
//! via [`KeyJournal::load_active_keys`].

use crate::error::{KilatError, Result};
use dashmap::DashSet;
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct KeyJournal {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    active: DashSet<Vec<u8>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JournalStats {
    pub active_keys: usize,
    pub journal_bytes: u64,
}

impl KeyJournal {
    /// Start a fresh journal at `path`, truncating any existing log.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(KilatError::Journal)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
            active: DashSet::new(),
        })
    }

    /// Open an existing journal (created if missing) and replay it into
    /// the active-set cache.
    pub fn open(path: &Path) -> Result<Self> {
        let active = DashSet::new();
        for key in Self::load_active_keys(path)? {
            active.insert(key);
        }
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .map_err(KilatError::Journal)?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Mutex::new(BufWriter::new(file)),
            active,
        })
    }

    /// Replay the log at `path` without opening a writer. A missing file
    /// is an empty set.
    pub fn load_active_keys(path: &Path) -> Result<Vec<Vec<u8>>> {
        let bytes = match std::fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KilatError::Journal(e)),
        };

        let active = DashSet::new();
        replay(&bytes, &active);
        Ok(active.into_iter().collect())
    }

    /// Record a successful insert. Line-buffered: flushed before return.
    pub fn record_insert(&self, key: &[u8]) -> Result<()> {
        self.append(b'I', key)?;
        self.active.insert(key.to_vec());
        Ok(())
    }

    /// Record a successful remove.
    pub fn record_remove(&self, key: &[u8]) -> Result<()> {
        self.append(b'R', key)?;
        self.active.remove(key);
        Ok(())
    }

    fn append(&self, tag: u8, key: &[u8]) -> Result<()> {
        let mut w = self.writer.lock();
        (|| -> std::io::Result<()> {
            w.write_all(&[tag, b':'])?;
            w.write_all(key.len().to_string().as_bytes())?;
            w.write_all(b":")?;
            w.write_all(key)?;
            w.write_all(b"\n")?;
            w.flush()
        })()
        .map_err(KilatError::Journal)
    }

    /// The current active key set. Order is unspecified.
    pub fn active_keys(&self) -> Vec<Vec<u8>> {
        self.active.iter().map(|k| k.key().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.active.contains(key)
    }

    pub fn stats(&self) -> JournalStats {
        let journal_bytes = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        JournalStats {
            active_keys: self.active.len(),
            journal_bytes,
        }
    }

    /// Rewrite the log as `I` records for the active set only, atomically
    /// via write-new-then-rename.
    pub fn compact(&self) -> Result<()> {
        let mut w = self.writer.lock();

        let tmp_path = self.path.with_extension("journal.tmp");
        let result = (|| -> std::io::Result<File> {
            let mut tmp = BufWriter::new(File::create(&tmp_path)?);
            for entry in self.active.iter() {
                let key = entry.key();
                tmp.write_all(&[b'I', b':'])?;
                tmp.write_all(key.len().to_string().as_bytes())?;
                tmp.write_all(b":")?;
                tmp.write_all(key)?;
                tmp.write_all(b"\n")?;
            }
            let tmp = tmp.into_inner().map_err(|e| e.into_error())?;
            tmp.sync_all()?;
            std::fs::rename(&tmp_path, &self.path)?;
            OpenOptions::new().append(true).open(&self.path)
        })();

        match result {
            Ok(file) => {
                *w = BufWriter::new(file);
                debug!(active = self.active.len(), "journal compacted");
                Ok(())
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(KilatError::Journal(e))
            }
        }
    }

    /// fsync the log.
    pub fn sync(&self) -> Result<()> {
        let mut w = self.writer.lock();
        (|| -> std::io::Result<()> {
            w.flush()?;
            w.get_ref().sync_all()
        })()
        .map_err(KilatError::Journal)
    }
}

/// Replay raw journal bytes into `active`, skipping malformed lines.
fn replay(bytes: &[u8], active: &DashSet<Vec<u8>>) {
    let mut pos = 0usize;
    while pos < bytes.len() {
        match parse_record(&bytes[pos..]) {
            Some((tag, key, consumed)) => {
                match tag {
                    b'I' => {
                        active.insert(key.to_vec());
                    }
                    _ => {
                        active.remove(key);
                    }
                }
                pos += consumed;
            }
            None => {
                // Malformed: resync at the next newline.
                match bytes[pos..].iter().position(|&b| b == b'\n') {
                    Some(nl) => pos += nl + 1,
                    None => break,
                }
            }
        }
    }
}

/// Parse one `tag:len:key\n` record at the start of `bytes`. Returns the
/// tag, the key and the total bytes consumed.
fn parse_record(bytes: &[u8]) -> Option<(u8, &[u8], usize)> {
    let tag = *bytes.first()?;
    if tag != b'I' && tag != b'R' {
        return None;
    }
    if bytes.get(1) != Some(&b':') {
        return None;
    }

    let mut pos = 2;
    let mut len = 0usize;
    let mut digits = 0;
    while let Some(&b) = bytes.get(pos) {
        if b == b':' {
            break;
        }
        if !b.is_ascii_digit() || digits >= 10 {
            return None;
        }
        len = len * 10 + (b - b'0') as usize;
        digits += 1;
        pos += 1;
    }
    if digits == 0 || bytes.get(pos) != Some(&b':') {
        return None;
    }
    pos += 1;

    let key = bytes.get(pos..pos + len)?;
    if bytes.get(pos + len) != Some(&b'\n') {
        return None;
    }
    Some((tag, key, pos + len + 1))
}
