use std::fmt;
use std::path::PathBuf;

use crate::access::FsErrorCode;

/// What a post-failure re-read of the disk told us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Disk holds the content we tried to write.
    Saved,
    /// Disk still holds the previous baseline.
    Unchanged,
    /// Disk holds something else entirely.
    Diverged,
    /// Disk could not be read.
    Unknown,
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ReconcileOutcome::Saved => "saved",
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Diverged => "diverged",
            ReconcileOutcome::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Where the content of a failed save ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Managed(PathBuf),
    Temporary(PathBuf),
    Failed { managed: String, temporary: String },
}

impl BackupOutcome {
    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            BackupOutcome::Managed(p) | BackupOutcome::Temporary(p) => Some(p),
            BackupOutcome::Failed { .. } => None,
        }
    }
}

impl fmt::Display for BackupOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupOutcome::Managed(p) => write!(f, "content saved to backup {}", p.display()),
            BackupOutcome::Temporary(p) => {
                write!(f, "content saved to emergency backup {}", p.display())
            }
            BackupOutcome::Failed { managed, temporary } => write!(
                f,
                "backup failed ({}) and emergency backup failed ({})",
                managed, temporary
            ),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("Validation failed for {path:?}: {}", errors.join("; "))]
    Validation { path: PathBuf, errors: Vec<String> },

    #[error("Cannot write {path:?}: {code}")]
    Access { path: PathBuf, code: FsErrorCode },

    #[error("Write failed for {path:?}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Verification failed for {path:?}: disk content did not match after {attempts} attempts")]
    Verification { path: PathBuf, attempts: u32 },

    #[error("Save failed for {path:?}: {reason}{}; {backup}", diverged_note(*reconciliation))]
    SaveFailed {
        path: PathBuf,
        reason: Box<SyncError>,
        reconciliation: ReconcileOutcome,
        backup: BackupOutcome,
    },

    #[error("Watch error on {path:?}: {message}")]
    Watch { path: PathBuf, message: String },

    #[error("Document disposed: {0:?}")]
    Disposed(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn diverged_note(outcome: ReconcileOutcome) -> &'static str {
    match outcome {
        ReconcileOutcome::Diverged => " (disk content diverged)",
        _ => "",
    }
}

impl SyncError {
    /// Path of the backup holding the unsaved content, if a save failed and
    /// a backup was written.
    pub fn backup_path(&self) -> Option<&PathBuf> {
        match self {
            SyncError::SaveFailed { backup, .. } => backup.path(),
            _ => None,
        }
    }

    pub fn reconciliation(&self) -> Option<ReconcileOutcome> {
        match self {
            SyncError::SaveFailed { reconciliation, .. } => Some(*reconciliation),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_failed_message_names_backup() {
        let err = SyncError::SaveFailed {
            path: PathBuf::from("/tmp/board.md"),
            reason: Box::new(SyncError::Verification {
                path: PathBuf::from("/tmp/board.md"),
                attempts: 3,
            }),
            reconciliation: ReconcileOutcome::Diverged,
            backup: BackupOutcome::Temporary(PathBuf::from("/tmp/lexera-emergency/board.md")),
        };
        let msg = err.to_string();
        assert!(msg.contains("diverged"));
        assert!(msg.contains("/tmp/lexera-emergency/board.md"));
        assert_eq!(
            err.backup_path(),
            Some(&PathBuf::from("/tmp/lexera-emergency/board.md"))
        );
    }

    #[test]
    fn test_save_failed_message_names_both_backup_failures() {
        let err = SyncError::SaveFailed {
            path: PathBuf::from("/tmp/board.md"),
            reason: Box::new(SyncError::Verification {
                path: PathBuf::from("/tmp/board.md"),
                attempts: 3,
            }),
            reconciliation: ReconcileOutcome::Unchanged,
            backup: BackupOutcome::Failed {
                managed: "disk full".to_string(),
                temporary: "read-only".to_string(),
            },
        };
        let msg = err.to_string();
        assert!(msg.contains("disk full"));
        assert!(msg.contains("read-only"));
        assert!(!msg.contains("diverged"));
        assert!(err.backup_path().is_none());
    }
}
