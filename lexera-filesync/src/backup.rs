/// Backups for content that could not be saved.
///
/// `BackupFacility` is the managed backup call contract. `LocalBackupStore`
/// writes hidden timestamped siblings (or into a configured directory) and
/// visible conflict files. `emergency_backup` is the failure floor of the
/// save pipeline: managed backup first, then a process-wide temp directory.
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::BackupOutcome;

const CONFLICT_FILE_ATTEMPTS: u32 = 20;

#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub label: String,
    /// Write even when the file on disk already holds this content.
    pub force_create: bool,
}

impl BackupOptions {
    pub fn save_failed() -> Self {
        Self {
            label: "save-failed".to_string(),
            force_create: true,
        }
    }
}

pub trait BackupFacility: Send + Sync {
    /// Back up `content` for the document at `path`. `Ok(None)` means no
    /// backup was needed or produced.
    fn create_backup_from_content(
        &self,
        path: &Path,
        content: &str,
        options: &BackupOptions,
    ) -> io::Result<Option<PathBuf>>;
}

#[derive(Debug, Clone, Default)]
pub struct LocalBackupStore {
    backup_dir: Option<PathBuf>,
}

impl LocalBackupStore {
    pub fn new(backup_dir: Option<PathBuf>) -> Self {
        Self { backup_dir }
    }

    /// Write `content` to a visible sibling `<stem>-conflict-<timestamp>.<ext>`.
    /// Name collisions are retried with a numeric suffix.
    pub fn create_conflict_file(&self, path: &Path, content: &str) -> io::Result<PathBuf> {
        let (stem, ext) = split_name(path);
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let timestamp = file_timestamp();

        for attempt in 0..CONFLICT_FILE_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{}-conflict-{}{}", stem, timestamp, ext)
            } else {
                format!("{}-conflict-{}-{}{}", stem, timestamp, attempt, ext)
            };
            let candidate = dir.join(name);
            match write_exclusive(&candidate, content) {
                Ok(()) => {
                    log::info!(
                        "[lexera.filesync.backup] Conflict copy written to {:?}",
                        candidate
                    );
                    return Ok(candidate);
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }

        Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!(
                "no free conflict file name for {:?} after {} attempts",
                path, CONFLICT_FILE_ATTEMPTS
            ),
        ))
    }
}

impl BackupFacility for LocalBackupStore {
    fn create_backup_from_content(
        &self,
        path: &Path,
        content: &str,
        options: &BackupOptions,
    ) -> io::Result<Option<PathBuf>> {
        if !options.force_create {
            if let Ok(existing) = fs::read_to_string(path) {
                if crate::fingerprint::same_content(&existing, content) {
                    return Ok(None);
                }
            }
        }

        let (stem, ext) = split_name(path);
        let name = format!(
            "{}-{}-{}{}",
            stem,
            sanitize_name(&options.label),
            file_timestamp(),
            ext
        );
        let target = match &self.backup_dir {
            Some(dir) => {
                fs::create_dir_all(dir)?;
                dir.join(name)
            }
            None => path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(format!(".{}", name)),
        };

        write_exclusive(&target, content)?;
        Ok(Some(target))
    }
}

/// Preserve `content` somewhere. Never panics, never gives up silently: the
/// outcome names the path that worked or both failure reasons.
pub fn emergency_backup(
    facility: &dyn BackupFacility,
    emergency_dir: &Path,
    path: &Path,
    content: &str,
) -> BackupOutcome {
    let managed_error = match facility.create_backup_from_content(
        path,
        content,
        &BackupOptions::save_failed(),
    ) {
        Ok(Some(backup)) => {
            log::warn!(
                "[lexera.filesync.backup] Unsaved content of {:?} backed up to {:?}",
                path,
                backup
            );
            return BackupOutcome::Managed(backup);
        }
        Ok(None) => "backup facility returned no path".to_string(),
        Err(e) => e.to_string(),
    };

    match write_temp_backup(emergency_dir, path, content) {
        Ok(backup) => {
            log::warn!(
                "[lexera.filesync.backup] Managed backup failed for {:?} ({}), emergency copy at {:?}",
                path,
                managed_error,
                backup
            );
            BackupOutcome::Temporary(backup)
        }
        Err(e) => {
            log::error!(
                "[lexera.filesync.backup] All backups failed for {:?}: managed: {}, temp: {}",
                path,
                managed_error,
                e
            );
            BackupOutcome::Failed {
                managed: managed_error,
                temporary: e.to_string(),
            }
        }
    }
}

fn write_temp_backup(emergency_dir: &Path, path: &Path, content: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(emergency_dir)?;
    let (stem, ext) = split_name(path);
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let name = format!(
        "{}-{}-{}{}",
        sanitize_name(&stem),
        file_timestamp(),
        &suffix[..8],
        ext
    );
    let target = emergency_dir.join(name);
    write_exclusive(&target, content)?;
    Ok(target)
}

fn write_exclusive(path: &Path, content: &str) -> io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(content.as_bytes())?;
    file.sync_all()
}

/// ISO-8601 basic format, safe in file names.
fn file_timestamp() -> String {
    chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ").to_string()
}

fn split_name(path: &Path) -> (String, String) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    (stem, ext)
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "document".to_string()
    } else {
        cleaned
    }
}
