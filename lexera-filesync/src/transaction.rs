/// Save transaction log.
///
/// A snapshot of a document's state is recorded before every save attempt,
/// keyed by absolute path, so a failed save can restore it.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveSnapshot {
    pub content: String,
    pub baseline: String,
    pub has_file_system_changes: bool,
    pub last_modified: Option<SystemTime>,
    pub last_size: Option<u64>,
}

#[derive(Debug, Default)]
pub struct SaveTransactionLog {
    open: Mutex<HashMap<PathBuf, SaveSnapshot>>,
}

impl SaveTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pre-save state. A stale entry for the same path (left by a
    /// save that never finished) is replaced.
    pub fn begin(&self, path: &Path, snapshot: SaveSnapshot) {
        let mut open = self.open.lock().unwrap_or_else(|e| e.into_inner());
        if open.insert(path.to_path_buf(), snapshot).is_some() {
            log::warn!(
                "[lexera.filesync.txn] Replacing unfinished save transaction for {:?}",
                path
            );
        }
    }

    /// Drop the snapshot after a successful save.
    pub fn commit(&self, path: &Path) {
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path);
    }

    /// Take the snapshot back out so the caller can restore it.
    pub fn rollback(&self, path: &Path) -> Option<SaveSnapshot> {
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(path)
    }

    pub fn is_open(&self, path: &Path) -> bool {
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(content: &str) -> SaveSnapshot {
        SaveSnapshot {
            content: content.to_string(),
            baseline: "base".to_string(),
            has_file_system_changes: false,
            last_modified: None,
            last_size: None,
        }
    }

    #[test]
    fn test_begin_and_rollback() {
        let log = SaveTransactionLog::new();
        let path = Path::new("/tmp/board.md");
        log.begin(path, snapshot("draft"));
        assert!(log.is_open(path));

        let restored = log.rollback(path).unwrap();
        assert_eq!(restored.content, "draft");
        assert!(!log.is_open(path));
        assert!(log.rollback(path).is_none());
    }

    #[test]
    fn test_commit_discards_snapshot() {
        let log = SaveTransactionLog::new();
        let path = Path::new("/tmp/board.md");
        log.begin(path, snapshot("draft"));
        log.commit(path);
        assert!(log.rollback(path).is_none());
    }

    #[test]
    fn test_paths_are_independent() {
        let log = SaveTransactionLog::new();
        log.begin(Path::new("/a.md"), snapshot("a"));
        log.begin(Path::new("/b.md"), snapshot("b"));
        log.commit(Path::new("/a.md"));
        assert_eq!(log.rollback(Path::new("/b.md")).unwrap().content, "b");
    }
}
