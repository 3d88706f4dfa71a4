/// Include path resolution and normalization.
///
/// Raw include paths (URL-encoded, relative, `./`-prefixed, backslashes) are
/// resolved against the main board file's directory. Lookups and equality
/// use the normalized form: lowercase, forward slashes, no leading `./`.
use std::path::{Path, PathBuf};

use super::syntax::decode_include_path;
use crate::storage::canonical_path;

/// Resolve a raw include path relative to the board's directory.
pub fn resolve_include_path(raw_path: &str, board_dir: &Path) -> PathBuf {
    let decoded = decode_include_path(raw_path).replace('\\', "/");
    let cleaned = strip_dot_prefix(&decoded);

    canonical_path(&board_dir.join(cleaned))
}

/// Display form of a relative path: decoded, forward slashes, no leading
/// `./`, original casing.
pub fn display_relative_path(raw_path: &str) -> String {
    let decoded = decode_include_path(raw_path).replace('\\', "/");
    strip_dot_prefix(&decoded).to_string()
}

/// Lookup key for a relative path.
pub fn normalize_relative_path(raw_path: &str) -> String {
    display_relative_path(raw_path).to_lowercase()
}

fn strip_dot_prefix(path: &str) -> &str {
    let mut cleaned = path;
    while let Some(rest) = cleaned.strip_prefix("./") {
        cleaned = rest;
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_relative_path() {
        assert_eq!(normalize_relative_path("./Root/File.md"), "root/file.md");
        assert_eq!(normalize_relative_path(".\\Root\\File.md"), "root/file.md");
        assert_eq!(normalize_relative_path("././a%20b.md"), "a b.md");
    }

    #[test]
    fn test_display_keeps_casing() {
        assert_eq!(display_relative_path("./Root/File.md"), "Root/File.md");
    }

    #[test]
    fn test_resolve_against_board_dir() {
        let dir = tempfile::tempdir().unwrap();
        let canonical_dir = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir(canonical_dir.join("sub")).unwrap();
        std::fs::write(canonical_dir.join("sub/a b.md"), "x").unwrap();

        let resolved = resolve_include_path("./sub/a%20b.md", &canonical_dir);
        assert_eq!(resolved, canonical_dir.join("sub/a b.md"));

        // missing files still resolve to the joined path
        let missing = resolve_include_path("nope.md", &canonical_dir);
        assert_eq!(missing, canonical_dir.join("nope.md"));
    }

    #[test]
    fn test_resolve_missing_file_outside_board_dir() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        std::fs::create_dir(root.join("boards")).unwrap();

        let resolved = resolve_include_path("../x/inc.md", &root.join("boards"));
        assert_eq!(resolved, root.join("x/inc.md"));

        // Once created, the file is reported under the same path.
        std::fs::create_dir(root.join("x")).unwrap();
        std::fs::write(root.join("x/inc.md"), "# slide\n").unwrap();
        assert_eq!(std::fs::canonicalize(root.join("x/inc.md")).unwrap(), resolved);
    }
}
