//! File sets exchanged during a sync round and the errors of the sync collaborators.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

/// Default unix mode for files without one.
pub const DEFAULT_MODE: u32 = 0o640;

/// One synchronized file. `path` is relative to the sync directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub contents: Vec<u8>,
    pub mode: u32,
}

impl FileEntry {
    pub fn new(path: impl Into<PathBuf>, contents: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            contents,
            mode: DEFAULT_MODE,
        }
    }
}

/// Files keyed by relative path. Ordered so archives come out deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    entries: BTreeMap<PathBuf, FileEntry>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a file, replacing any previous entry with the same path.
    pub fn insert(&mut self, entry: FileEntry) -> Result<(), SyncError> {
        check_relative(&entry.path)?;
        self.entries.insert(entry.path.clone(), entry);
        Ok(())
    }

    pub fn get(&self, path: &Path) -> Option<&FileEntry> {
        self.entries.get(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Reject absolute paths and anything that climbs out of the sync directory.
pub fn check_relative(path: &Path) -> Result<(), SyncError> {
    let ok = !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if ok {
        Ok(())
    } else {
        Err(SyncError::UnsafePath(path.to_path_buf()))
    }
}

/// Result of applying a client's files on the master.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// Compressed archive sent back to the client.
    pub archive: Vec<u8>,
    /// The push changed files on the master.
    pub restart_required: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("archive error: {0}")]
    Archive(String),
    #[error("unsafe path in file set: {0}")]
    UnsafePath(PathBuf),
    #[error("no master node reachable")]
    NoMaster,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote node error: {0}")]
    Remote(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_accepted() {
        assert!(check_relative(Path::new("etc/client.keys")).is_ok());
        assert!(check_relative(Path::new("./shared/agent.conf")).is_ok());
    }

    #[test]
    fn escaping_paths_rejected() {
        for p in ["/etc/passwd", "../outside", "a/../../b", ""] {
            assert!(
                matches!(check_relative(Path::new(p)), Err(SyncError::UnsafePath(_))),
                "{p} should be rejected"
            );
        }
    }

    #[test]
    fn insert_replaces_same_path() {
        let mut set = FileSet::new();
        set.insert(FileEntry::new("a.txt", b"one".to_vec())).unwrap();
        set.insert(FileEntry::new("a.txt", b"two".to_vec())).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(Path::new("a.txt")).unwrap().contents, b"two");
    }
}
