/// A board file and the include fragments its columns pull in, tracked as
/// one unit.
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::context::SyncContext;
use crate::document::kinds::{IncludeDocument, MainDocument};
use crate::document::{DocumentKind, DocumentPath, FileState, SaveOptions, TrackedDocument};
use crate::error::SyncError;
use crate::include::resolver::normalize_relative_path;
use crate::include::syntax::scan_column_includes;

/// Fragments opened and disposed by one `sync_includes` call, by display path.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IncludeChanges {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

impl IncludeChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

pub struct BoardSession {
    ctx: SyncContext,
    board_dir: PathBuf,
    main: TrackedDocument<MainDocument>,
    /// Keyed by normalized relative path.
    includes: Mutex<BTreeMap<String, TrackedDocument<IncludeDocument>>>,
    watching: AtomicBool,
}

impl BoardSession {
    pub async fn open(ctx: SyncContext, path: &Path) -> Result<Self, SyncError> {
        let main_path = DocumentPath::for_main(path);
        let board_dir = main_path
            .absolute()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let main = TrackedDocument::open(ctx.clone(), main_path, MainDocument).await?;

        let session = Self {
            ctx,
            board_dir,
            main,
            includes: Mutex::new(BTreeMap::new()),
            watching: AtomicBool::new(false),
        };
        session.sync_includes().await?;
        log::info!(
            "[lexera.filesync.session] Opened board {:?} with {} include(s)",
            session.main.path().absolute(),
            session.lock_includes().len()
        );
        Ok(session)
    }

    pub fn main(&self) -> &TrackedDocument<MainDocument> {
        &self.main
    }

    pub fn board_dir(&self) -> &Path {
        &self.board_dir
    }

    /// Look up a fragment by relative path; casing and `./` are ignored.
    pub fn include(&self, relative: &str) -> Option<TrackedDocument<IncludeDocument>> {
        self.lock_includes()
            .get(&normalize_relative_path(relative))
            .cloned()
    }

    pub fn includes(&self) -> Vec<TrackedDocument<IncludeDocument>> {
        self.lock_includes().values().cloned().collect()
    }

    /// Bring the set of tracked fragments in line with the include
    /// directives currently in the main document's content.
    pub async fn sync_includes(&self) -> Result<IncludeChanges, SyncError> {
        let mut wanted: BTreeMap<String, DocumentPath> = BTreeMap::new();
        for raw in scan_column_includes(&self.main.content()) {
            let path = DocumentPath::for_include(&raw, &self.board_dir);
            wanted.entry(path.normalized().to_string()).or_insert(path);
        }

        let mut changes = IncludeChanges::default();
        let (stale, missing) = {
            let mut includes = self.lock_includes();
            let stale_keys: Vec<String> = includes
                .keys()
                .filter(|k| !wanted.contains_key(*k))
                .cloned()
                .collect();
            let stale: Vec<_> = stale_keys
                .iter()
                .filter_map(|k| includes.remove(k))
                .collect();
            let present: BTreeSet<String> = includes.keys().cloned().collect();
            let missing: Vec<DocumentPath> = wanted
                .into_iter()
                .filter(|(k, _)| !present.contains(k))
                .map(|(_, p)| p)
                .collect();
            (stale, missing)
        };

        for doc in stale {
            log::info!(
                "[lexera.filesync.session] Include {} no longer referenced",
                doc.path().relative()
            );
            doc.dispose();
            changes.removed.push(doc.path().relative().to_string());
        }

        for path in missing {
            let relative = path.relative().to_string();
            let doc = match TrackedDocument::open(self.ctx.clone(), path, IncludeDocument).await {
                Ok(doc) => doc,
                Err(e) => {
                    log::warn!(
                        "[lexera.filesync.session] Cannot open include {}: {}",
                        relative,
                        e
                    );
                    continue;
                }
            };
            if self.watching.load(Ordering::SeqCst) {
                watch_include(&doc);
            }
            if !doc.exists() {
                log::warn!(
                    "[lexera.filesync.session] Include {} does not exist yet",
                    relative
                );
            }

            let key = doc.path().normalized().to_string();
            let replaced = self.lock_includes().insert(key, doc);
            // A concurrent sync opened the same fragment first.
            if let Some(previous) = replaced {
                previous.dispose();
            }
            changes.added.push(relative);
        }

        Ok(changes)
    }

    /// Attach every document to the shared watch registry. Fragments opened
    /// later by `sync_includes` are attached as they arrive.
    pub fn start_watching(&self) -> Result<(), SyncError> {
        self.watching.store(true, Ordering::SeqCst);
        self.main.start_watching()?;
        for doc in self.includes() {
            watch_include(&doc);
        }
        Ok(())
    }

    /// Display paths of documents whose content differs from their baseline.
    pub fn unsaved_documents(&self) -> Vec<String> {
        self.collect_paths(|doc| doc.has_unsaved_changes(), |doc| doc.has_unsaved_changes())
    }

    /// Display paths of documents with local changes and an unresolved
    /// external change.
    pub fn conflicted_documents(&self) -> Vec<String> {
        self.collect_paths(|doc| doc.has_conflict(), |doc| doc.has_conflict())
    }

    pub fn file_states(&self) -> Vec<FileState> {
        let mut states = vec![self.main.file_state()];
        states.extend(self.includes().iter().map(TrackedDocument::file_state));
        states
    }

    /// Save every document with unsaved changes, fragments first so the
    /// board never references content that failed to land. One failure does
    /// not stop the others.
    pub async fn save_all(&self, options: SaveOptions) -> Vec<(String, Result<(), SyncError>)> {
        let mut results = Vec::new();
        for doc in self.includes() {
            if doc.has_unsaved_changes() {
                results.push(save_one(&doc, options).await);
            }
        }
        if self.main.has_unsaved_changes() {
            results.push(save_one(&self.main, options).await);
        }
        results
    }

    pub fn dispose(&self) {
        self.watching.store(false, Ordering::SeqCst);
        let includes = std::mem::take(&mut *self.lock_includes());
        for doc in includes.into_values() {
            doc.dispose();
        }
        self.main.dispose();
        log::info!(
            "[lexera.filesync.session] Closed board {:?}",
            self.main.path().absolute()
        );
    }

    fn collect_paths(
        &self,
        main: impl Fn(&TrackedDocument<MainDocument>) -> bool,
        include: impl Fn(&TrackedDocument<IncludeDocument>) -> bool,
    ) -> Vec<String> {
        let mut paths = Vec::new();
        if main(&self.main) {
            paths.push(self.main.path().relative().to_string());
        }
        paths.extend(
            self.includes()
                .iter()
                .filter(|doc| include(*doc))
                .map(|doc| doc.path().relative().to_string()),
        );
        paths
    }

    fn lock_includes(&self) -> MutexGuard<'_, BTreeMap<String, TrackedDocument<IncludeDocument>>> {
        self.includes.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A fragment that cannot be watched (e.g. its directory does not exist yet)
/// stays tracked; it just will not see external changes.
fn watch_include(doc: &TrackedDocument<IncludeDocument>) {
    if let Err(e) = doc.start_watching() {
        log::warn!(
            "[lexera.filesync.session] Not watching include {}: {}",
            doc.path().relative(),
            e
        );
    }
}

async fn save_one<K: DocumentKind>(
    doc: &TrackedDocument<K>,
    options: SaveOptions,
) -> (String, Result<(), SyncError>) {
    let result = doc.save(options).await;
    if let Err(e) = &result {
        log::error!("[lexera.filesync.session] {}", e);
    }
    (doc.path().relative().to_string(), result)
}

impl std::fmt::Debug for BoardSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardSession")
            .field("main", &self.main.path().absolute())
            .field("includes", &self.lock_includes().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;
    use crate::config::SyncSettings;
    use crate::watcher::types::FileChangeKind;

    const BOARD: &str = "---\nkanban-plugin: board\n---\n\n\
        ## Todo\n- [ ] card\n\n\
        ## !!!include(./Notes.md)!!!\n\n\
        ## !!!include(notes.md)!!! #stack\n\n\
        ## !!!include(sub/slides%201.md)!!!\n";

    fn board_dir() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("board.md"), BOARD).unwrap();
        fs::write(dir.path().join("Notes.md"), "# notes\n").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/slides 1.md"), "# one\n\n---\n\n# two\n").unwrap();
        dir
    }

    fn context(dir: &TempDir) -> SyncContext {
        SyncContext::manual(&SyncSettings {
            emergency_dir: Some(dir.path().join("emergency")),
            ..SyncSettings::default()
        })
    }

    #[tokio::test]
    async fn test_open_tracks_distinct_includes() {
        let dir = board_dir();
        let session = BoardSession::open(context(&dir), &dir.path().join("board.md"))
            .await
            .unwrap();

        assert_eq!(session.includes().len(), 2);
        let notes = session.include("NOTES.md").unwrap();
        assert_eq!(notes.content(), "# notes\n");
        let slides = session.include("./sub/slides 1.md").unwrap();
        assert!(slides.content().contains("# two"));
        assert!(session.unsaved_documents().is_empty());
    }

    #[tokio::test]
    async fn test_sync_includes_follows_main_content() {
        let dir = board_dir();
        fs::write(dir.path().join("extra.md"), "extra").unwrap();
        let session = BoardSession::open(context(&dir), &dir.path().join("board.md"))
            .await
            .unwrap();
        let notes = session.include("notes.md").unwrap();

        session
            .main()
            .set_content("---\nkanban-plugin: board\n---\n\n## !!!include(extra.md)!!!\n");
        let changes = session.sync_includes().await.unwrap();

        assert_eq!(changes.added, vec!["extra.md".to_string()]);
        assert_eq!(changes.removed.len(), 2);
        assert!(notes.is_disposed());
        assert!(session.include("notes.md").is_none());
        assert_eq!(session.include("extra.md").unwrap().content(), "extra");

        assert!(session.sync_includes().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_all_saves_only_dirty_documents() {
        let dir = board_dir();
        let session = BoardSession::open(context(&dir), &dir.path().join("board.md"))
            .await
            .unwrap();

        session.include("notes.md").unwrap().set_content("# notes\nedited\n");
        assert_eq!(session.unsaved_documents(), vec!["Notes.md".to_string()]);

        let results = session.save_all(SaveOptions::default()).await;
        assert_eq!(results.len(), 1);
        assert!(results[0].1.is_ok());
        assert_eq!(
            fs::read_to_string(dir.path().join("Notes.md")).unwrap(),
            "# notes\nedited\n"
        );
        assert!(session.unsaved_documents().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_board_is_reported_without_blocking_fragments() {
        let dir = board_dir();
        let session = BoardSession::open(context(&dir), &dir.path().join("board.md"))
            .await
            .unwrap();

        session.main().set_content("## no header\n");
        session.include("notes.md").unwrap().set_content("changed");
        let results = session.save_all(SaveOptions::default()).await;

        assert_eq!(results.len(), 2);
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(SyncError::Validation { .. })));
        assert_eq!(fs::read_to_string(dir.path().join("board.md")).unwrap(), BOARD);
    }

    #[tokio::test]
    async fn test_sessions_share_include_watch() {
        let dir = board_dir();
        let ctx = context(&dir);
        let board = dir.path().join("board.md");
        let first = BoardSession::open(ctx.clone(), &board).await.unwrap();
        let second = BoardSession::open(ctx.clone(), &board).await.unwrap();

        first.start_watching().unwrap();
        second.start_watching().unwrap();
        let notes = first.include("notes.md").unwrap();
        assert_eq!(ctx.registry.refcount(notes.path().absolute()), 2);
        assert_eq!(ctx.registry.watched_paths().len(), 3);

        first.dispose();
        assert_eq!(ctx.registry.refcount(notes.path().absolute()), 1);
        second.dispose();
        assert!(ctx.registry.watched_paths().is_empty());
    }

    #[tokio::test]
    async fn test_conflicted_documents_lists_fragment() {
        let dir = board_dir();
        let session = BoardSession::open(context(&dir), &dir.path().join("board.md"))
            .await
            .unwrap();
        let notes = session.include("notes.md").unwrap();

        notes.set_content("local");
        fs::write(dir.path().join("Notes.md"), "remote").unwrap();
        notes.handle_file_change(FileChangeKind::Modified).await;

        assert_eq!(session.conflicted_documents(), vec!["Notes.md".to_string()]);
        let states = session.file_states();
        assert_eq!(states.len(), 3);
        assert!(states.iter().any(|s| s.has_conflict && s.kind == "include"));
    }
}
