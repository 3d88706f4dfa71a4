/// The two document kinds of a board: the main file and include fragments.
use super::path::DocumentPath;
use super::{DocumentKind, Validation};
use crate::events::ExternalImpact;

const BOARD_MARKER: &str = "kanban-plugin: board";

/// The main board file (YAML header + `##` columns).
#[derive(Debug, Clone, Copy, Default)]
pub struct MainDocument;

impl DocumentKind for MainDocument {
    fn label(&self) -> &'static str {
        "main"
    }

    fn validate(&self, content: &str) -> Validation {
        let mut errors = Vec::new();
        if content.contains('\0') {
            errors.push("content contains NUL bytes".to_string());
        }
        match yaml_header(content) {
            None => errors.push("missing YAML header".to_string()),
            Some(header) if !header.contains(BOARD_MARKER) => {
                errors.push(format!("YAML header does not contain `{}`", BOARD_MARKER))
            }
            Some(_) => {}
        }
        Validation::from_errors(errors)
    }

    fn handle_external_change(&self, path: &DocumentPath) -> ExternalImpact {
        log::debug!(
            "[lexera.filesync.external] Board {} changed on disk, structure must be re-derived",
            path.relative()
        );
        ExternalImpact::Structural
    }
}

/// A slide-format fragment pulled into a column by `!!!include(...)!!!`.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncludeDocument;

impl DocumentKind for IncludeDocument {
    fn label(&self) -> &'static str {
        "include"
    }

    fn validate(&self, content: &str) -> Validation {
        if content.contains('\0') {
            Validation::invalid("content contains NUL bytes")
        } else {
            Validation::ok()
        }
    }

    fn handle_external_change(&self, _path: &DocumentPath) -> ExternalImpact {
        ExternalImpact::Fragment
    }
}

/// The front-matter block, from the opening `---` line through the closing
/// one. `None` when the document does not open with one or never closes it.
fn yaml_header(content: &str) -> Option<String> {
    let normalized = crate::fingerprint::normalize_newlines(content);
    let mut lines = normalized
        .trim_start_matches('\u{feff}')
        .split('\n')
        .skip_while(|l| l.trim().is_empty());

    let first = lines.next()?;
    if !first.starts_with("---") {
        return None;
    }

    let mut header = vec![first];
    for line in lines {
        header.push(line);
        if line.starts_with("---") {
            return Some(header.join("\n"));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_main_accepts_board() {
        let v = MainDocument.validate("---\nkanban-plugin: board\n---\n\n## Todo\n- [ ] A\n");
        assert!(v.valid, "{:?}", v.errors);
    }

    #[test]
    fn test_main_accepts_crlf_board() {
        let v = MainDocument.validate("---\r\nkanban-plugin: board\r\n---\r\n");
        assert!(v.valid);
    }

    #[test]
    fn test_main_rejects_missing_or_foreign_header() {
        assert!(!MainDocument.validate("## Todo\n- [ ] A\n").valid);
        assert!(!MainDocument.validate("---\ntitle: notes\n---\n").valid);
        // unterminated header
        assert!(!MainDocument.validate("---\nkanban-plugin: board\n").valid);
    }

    #[test]
    fn test_include_rejects_only_binary() {
        assert!(IncludeDocument.validate("# slide\n\n---\n\n# next").valid);
        assert!(IncludeDocument.validate("").valid);
        assert!(!IncludeDocument.validate("a\0b").valid);
    }
}
