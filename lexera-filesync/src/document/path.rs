use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::include::resolver::{display_relative_path, normalize_relative_path, resolve_include_path};
use crate::storage::canonical_path;

/// Identity of a tracked document.
///
/// Equality and hashing use the normalized relative path only.
#[derive(Debug, Clone)]
pub struct DocumentPath {
    absolute: PathBuf,
    relative: String,
    normalized: String,
}

impl DocumentPath {
    pub fn new(absolute: PathBuf, relative: &str) -> Self {
        Self {
            absolute,
            relative: display_relative_path(relative),
            normalized: normalize_relative_path(relative),
        }
    }

    /// Main board file: canonicalized, displayed by file name.
    pub fn for_main(path: &Path) -> Self {
        let absolute = canonical_path(path);
        let name = absolute
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        Self::new(absolute, &name)
    }

    /// Include fragment referenced from a board living in `board_dir`.
    pub fn for_include(raw_path: &str, board_dir: &Path) -> Self {
        Self::new(resolve_include_path(raw_path, board_dir), raw_path)
    }

    pub fn absolute(&self) -> &Path {
        &self.absolute
    }

    /// Relative path in its original casing, for display.
    pub fn relative(&self) -> &str {
        &self.relative
    }

    pub fn normalized(&self) -> &str {
        &self.normalized
    }
}

impl PartialEq for DocumentPath {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for DocumentPath {}

impl Hash for DocumentPath {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}
