/// Blocking disk primitives shared by the document kinds.
///
/// Callers on the async side run these through `spawn_blocking`.
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

/// Observed size and modification time of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub modified: Option<SystemTime>,
    pub size: u64,
}

/// Read a UTF-8 text file. `Ok(None)` means the file does not exist.
pub fn read_text(path: &Path) -> io::Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

pub fn file_stat(path: &Path) -> Option<FileStat> {
    let meta = fs::metadata(path).ok()?;
    Some(FileStat {
        modified: meta.modified().ok(),
        size: meta.len(),
    })
}

/// Canonical form of `path`, also for files that do not exist yet: the
/// nearest existing ancestor is canonicalized and the remaining components
/// are appended with `.` and `..` resolved lexically.
pub fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(canonical) = fs::canonicalize(path) {
        return canonical;
    }
    let normalized = lexical_normalize(path);
    let mut existing = normalized.as_path();
    let mut missing = Vec::new();
    loop {
        if let Ok(mut base) = fs::canonicalize(existing) {
            base.extend(missing.iter().rev());
            return base;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                missing.push(name.to_os_string());
                existing = parent;
            }
            _ => return normalized,
        }
    }
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(".."),
            },
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Atomic write with fsync: write to a sibling temp file, fsync, rename,
/// fsync the directory. Creates missing parent directories.
pub fn atomic_write(path: &Path, content: &str) -> io::Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)?;
        }
    }

    let tmp_path = temp_sibling(path);
    let result = (|| {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result?;

    if let Some(dir) = path.parent() {
        if let Ok(d) = fs::File::open(dir) {
            let _ = d.sync_all();
        }
    }
    Ok(())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    path.with_file_name(format!(".{}.lexera-sync.tmp", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_text(&dir.path().join("nope.md")).unwrap().is_none());
    }

    #[test]
    fn test_atomic_write_creates_parents_and_leaves_no_temp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/board.md");
        atomic_write(&path, "## Todo\n").unwrap();

        assert_eq!(read_text(&path).unwrap().as_deref(), Some("## Todo\n"));
        let leftovers: Vec<_> = fs::read_dir(dir.path().join("sub"))
            .unwrap()
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_empty_content_replaces_non_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("slide.md");
        fs::write(&path, "# slide\n").unwrap();

        atomic_write(&path, "").unwrap();
        assert_eq!(read_text(&path).unwrap().as_deref(), Some(""));
    }

    #[test]
    fn test_canonical_path_of_missing_file_resolves_dot_dot() {
        let dir = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(dir.path()).unwrap();
        fs::create_dir(root.join("boards")).unwrap();

        let path = root.join("boards/../shared/./inc.md");
        assert_eq!(canonical_path(&path), root.join("shared/inc.md"));

        fs::create_dir(root.join("shared")).unwrap();
        fs::write(root.join("shared/inc.md"), "x").unwrap();
        assert_eq!(canonical_path(&path), root.join("shared/inc.md"));
    }

    #[test]
    fn test_lexical_normalize_keeps_leading_parent() {
        assert_eq!(
            lexical_normalize(Path::new("../a/../../b/./c.md")),
            PathBuf::from("../../b/c.md")
        );
        assert_eq!(lexical_normalize(Path::new("/../a.md")), PathBuf::from("/a.md"));
    }

    #[test]
    fn test_file_stat_tracks_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("board.md");
        assert!(file_stat(&path).is_none());
        fs::write(&path, "12345").unwrap();
        assert_eq!(file_stat(&path).unwrap().size, 5);
    }
}
