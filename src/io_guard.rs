//! In-process IO exclusion table (spec.md §5, §1 `IOManager`).
//!
//! A file being WRITTEN cannot be READ or WRITTEN concurrently; a file being
//! READ can be READ by additional readers but not WRITTEN. Entries are
//! reference-counted for READ. spec.md lists the real `IOManager` as an
//! external collaborator owned by the host application; this is the minimal
//! concrete implementation needed to exercise `SendFileOrder`/
//! `FileAgglomerator` end-to-end within this crate.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use dashmap::DashMap;
use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoMode {
    Incoming,
    Outgoing,
}

#[derive(Debug, Default)]
struct Entry {
    readers: u32,
    writer: bool,
}

/// Guard returned by [`IoExclusionTable::acquire`]; releases the reservation
/// on drop so callers can't forget to release it on an error path.
pub struct IoGuard {
    table: IoExclusionTable,
    path: PathBuf,
    mode: IoMode,
    released: bool,
}

impl IoGuard {
    pub fn release(mut self) {
        self.do_release();
    }

    fn do_release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.table.release(&self.path, self.mode);
    }
}

impl Drop for IoGuard {
    fn drop(&mut self) {
        self.do_release();
    }
}

/// Concurrent path-keyed exclusion table.
#[derive(Debug, Clone, Default)]
pub struct IoExclusionTable {
    entries: std::sync::Arc<DashMap<PathBuf, Mutex<Entry>>>,
}

impl IoExclusionTable {
    pub fn new() -> Self {
        Self { entries: Default::default() }
    }

    fn key(path: &Path) -> PathBuf {
        path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
    }

    /// Attempt to reserve `path` for `mode`. Returns `None` (denied) if the
    /// reservation would violate the read/write exclusion invariant.
    pub fn acquire(&self, path: &Path, mode: IoMode) -> Option<IoGuard> {
        let key = Self::key(path);
        let slot = self.entries.entry(key.clone()).or_insert_with(|| Mutex::new(Entry::default()));
        let mut entry = slot.lock().unwrap();
        match mode {
            IoMode::Outgoing => {
                // OUTGOING == reading the local file to send it.
                if entry.writer {
                    return None;
                }
                entry.readers += 1;
            }
            IoMode::Incoming => {
                // INCOMING == writing the local file as it's received.
                if entry.writer || entry.readers > 0 {
                    return None;
                }
                entry.writer = true;
            }
        }
        drop(entry);
        Some(IoGuard {
            table: self.clone(),
            path: key,
            mode,
            released: false,
        })
    }

    fn release(&self, key: &Path, mode: IoMode) {
        if let Some(slot) = self.entries.get(key) {
            let mut entry = slot.lock().unwrap();
            match mode {
                IoMode::Outgoing => entry.readers = entry.readers.saturating_sub(1),
                IoMode::Incoming => entry.writer = false,
            }
        }
    }
}

/// Process-wide shared exclusion table (spec.md §5 "IOManager... a shared
/// resource across the whole process", matching the `GLOBAL_CLIENT_POOL`/
/// `GLOBAL_SERVER_POOL` per-role singletons in `delivery.rs`, except this one
/// is not per-role: the same local filesystem is reachable from either side
/// of any connection in this process). `server.rs`/`client.rs` hand the same
/// clone of this table into every `Connection` they spawn.
pub static GLOBAL_IO_TABLE: Lazy<IoExclusionTable> = Lazy::new(IoExclusionTable::new);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_reads_allowed() {
        let table = IoExclusionTable::new();
        let p = PathBuf::from("/tmp/linkwire-test-read");
        let g1 = table.acquire(&p, IoMode::Outgoing);
        let g2 = table.acquire(&p, IoMode::Outgoing);
        assert!(g1.is_some());
        assert!(g2.is_some());
    }

    #[test]
    fn write_excludes_read_and_write() {
        let table = IoExclusionTable::new();
        let p = PathBuf::from("/tmp/linkwire-test-write");
        let write_guard = table.acquire(&p, IoMode::Incoming).unwrap();
        assert!(table.acquire(&p, IoMode::Outgoing).is_none());
        assert!(table.acquire(&p, IoMode::Incoming).is_none());
        write_guard.release();
        assert!(table.acquire(&p, IoMode::Outgoing).is_some());
    }

    #[test]
    fn read_excludes_write() {
        let table = IoExclusionTable::new();
        let p = PathBuf::from("/tmp/linkwire-test-readexcl");
        let read_guard = table.acquire(&p, IoMode::Outgoing).unwrap();
        assert!(table.acquire(&p, IoMode::Incoming).is_none());
        drop(read_guard);
        assert!(table.acquire(&p, IoMode::Incoming).is_some());
    }
}
