/// Include directive detection.
///
/// Column headings reference fragment files with `!!!include(path)!!!`.
/// Paths may be URL-encoded (%20) and may carry tags after the closing `!!!`.
use regex::Regex;
use std::sync::LazyLock;

static INCLUDE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"!!!include\(([^)]+)\)!!!").unwrap());

pub fn is_include(title: &str) -> bool {
    INCLUDE_RE.is_match(title)
}

/// Raw path from an include directive, `None` when the title has none.
pub fn extract_include_path(title: &str) -> Option<String> {
    INCLUDE_RE.captures(title).map(|caps| caps[1].trim().to_string())
}

/// Decode URL-encoded path components (%20 -> space, etc).
pub fn decode_include_path(raw: &str) -> String {
    percent_encoding::percent_decode_str(raw)
        .decode_utf8_lossy()
        .to_string()
}

/// Raw include paths referenced by the column headings (`## ...`) of a
/// board document, in document order, duplicates kept.
pub fn scan_column_includes(board: &str) -> Vec<String> {
    board
        .lines()
        .filter_map(|line| line.trim_end().strip_prefix("## "))
        .filter_map(extract_include_path)
        .collect()
}
