/// Write-access probing.
///
/// Predicts permission failures before a save pipeline starts. When the
/// target does not exist yet, the nearest existing ancestor directory is
/// checked instead, since the writer creates missing parents.
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;

use serde::Serialize;

#[cfg(unix)]
const RAW_ENOTDIR: i32 = 20;
#[cfg(unix)]
const RAW_EROFS: i32 = 30;

/// Filesystem error code in errno spelling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FsErrorCode {
    PermissionDenied,
    ReadOnlyFilesystem,
    NotFound,
    NotADirectory,
    Other(String),
}

impl FsErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            FsErrorCode::PermissionDenied => "EACCES",
            FsErrorCode::ReadOnlyFilesystem => "EROFS",
            FsErrorCode::NotFound => "ENOENT",
            FsErrorCode::NotADirectory => "ENOTDIR",
            FsErrorCode::Other(code) => code,
        }
    }

    pub fn from_io(err: &io::Error) -> Self {
        if let Some(code) = Self::from_raw_os(err) {
            return code;
        }
        match err.kind() {
            io::ErrorKind::PermissionDenied => FsErrorCode::PermissionDenied,
            io::ErrorKind::NotFound => FsErrorCode::NotFound,
            _ => match err.raw_os_error() {
                Some(code) => FsErrorCode::Other(format!("E{}", code)),
                None => FsErrorCode::Other(format!("{:?}", err.kind())),
            },
        }
    }

    #[cfg(unix)]
    fn from_raw_os(err: &io::Error) -> Option<Self> {
        match err.raw_os_error() {
            Some(RAW_EROFS) => Some(FsErrorCode::ReadOnlyFilesystem),
            Some(RAW_ENOTDIR) => Some(FsErrorCode::NotADirectory),
            _ => None,
        }
    }

    #[cfg(not(unix))]
    fn from_raw_os(_err: &io::Error) -> Option<Self> {
        None
    }
}

impl fmt::Display for FsErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the error code a write to `path` would most likely fail with, or
/// `None` when the path looks writable.
pub fn probe_write_access(path: &Path) -> Option<FsErrorCode> {
    match fs::metadata(path) {
        Ok(meta) => {
            if meta.is_dir() {
                return Some(FsErrorCode::Other("EISDIR".to_string()));
            }
            if meta.permissions().readonly() {
                return Some(FsErrorCode::PermissionDenied);
            }
            // Opening for append neither truncates nor creates.
            match OpenOptions::new().append(true).open(path) {
                Ok(_) => None,
                Err(e) => Some(FsErrorCode::from_io(&e)),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => probe_nearest_ancestor(path),
        Err(e) => Some(FsErrorCode::from_io(&e)),
    }
}

fn probe_nearest_ancestor(path: &Path) -> Option<FsErrorCode> {
    for ancestor in path.ancestors().skip(1) {
        if ancestor.as_os_str().is_empty() {
            continue;
        }
        match fs::metadata(ancestor) {
            Ok(meta) if !meta.is_dir() => return Some(FsErrorCode::NotADirectory),
            Ok(meta) if meta.permissions().readonly() => {
                return Some(FsErrorCode::PermissionDenied)
            }
            Ok(_) => return None,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Some(FsErrorCode::from_io(&e)),
        }
    }
    Some(FsErrorCode::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_existing_writable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.md");
        fs::write(&path, "x").unwrap();
        assert_eq!(probe_write_access(&path), None);
    }

    #[test]
    fn test_readonly_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.md");
        fs::write(&path, "x").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&path, perms).unwrap();

        assert_eq!(
            probe_write_access(&path),
            Some(FsErrorCode::PermissionDenied)
        );
    }

    #[test]
    fn test_missing_file_walks_up_to_existing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/board.md");
        assert_eq!(probe_write_access(&path), None);
    }

    #[test]
    fn test_missing_file_under_a_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").unwrap();
        let path = blocker.join("board.md");
        assert_eq!(probe_write_access(&path), Some(FsErrorCode::NotADirectory));
    }

    #[test]
    fn test_error_code_spelling() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(FsErrorCode::from_io(&err).as_str(), "EACCES");
        let err = io::Error::from(io::ErrorKind::NotFound);
        assert_eq!(FsErrorCode::from_io(&err).to_string(), "ENOENT");
    }
}
