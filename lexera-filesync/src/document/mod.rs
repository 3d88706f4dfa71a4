/// Tracked documents.
///
/// A `TrackedDocument` is the in-memory copy of one on-disk text file (the
/// main board or an include fragment) plus everything needed to keep it
/// consistent with the disk:
/// - `content` vs `baseline` (last content known to match disk); unsaved
///   changes are always derived from the two, never stored
/// - disk observations (existence, last access error, mtime/size)
/// - `has_file_system_changes`, raised by unmatched watcher events
/// - a self-save ledger so our own writes are not mistaken for external ones
/// - a reload generation for cooperative cancellation
///
/// The pipelines live in `save`, `reload` and `external`. Per-kind behavior
/// (disk I/O, validation, external-change impact) comes from `DocumentKind`.
pub mod kinds;
pub mod path;

mod external;
mod reload;
mod save;


use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::SystemTime;

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::access::FsErrorCode;
use crate::context::SyncContext;
use crate::error::SyncError;
use crate::events::{ChangeType, DocumentChange, ExternalImpact};
use crate::fingerprint::SelfSaveLedger;
use crate::storage::{self, FileStat};
use crate::transaction::SaveSnapshot;
use crate::watcher::registry::WatchHandle;
use crate::watcher::types::FileChangeKind;

pub use external::ChangeDisposition;
pub use path::DocumentPath;
pub use reload::{Generation, ReloadOutcome};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Result of a kind-specific format check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<String>,
}

impl Validation {
    pub fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            errors: vec![error.into()],
        }
    }

    pub fn from_errors(errors: Vec<String>) -> Self {
        Self {
            valid: errors.is_empty(),
            errors,
        }
    }
}

/// Per-kind behavior plugged into the shared state machine.
///
/// Disk methods are blocking; the document runs them on the blocking pool.
pub trait DocumentKind: Send + Sync + 'static {
    fn label(&self) -> &'static str;

    /// `Ok(None)` means the file does not exist, which is distinct from
    /// empty content.
    fn read_from_disk(&self, path: &Path) -> io::Result<Option<String>> {
        storage::read_text(path)
    }

    fn write_to_disk(&self, path: &Path, content: &str) -> io::Result<()> {
        storage::atomic_write(path, content)
    }

    fn validate(&self, content: &str) -> Validation;

    /// Decide how far an external change reaches into derived state.
    fn handle_external_change(&self, path: &DocumentPath) -> ExternalImpact;

    /// Fold the value captured from an interrupted edit session into the
    /// baseline. Defaults to taking the captured value as the new baseline.
    fn apply_captured_edit(&self, _baseline: &str, captured: String) -> String {
        captured
    }
}

/// The interactive editor collaborating with a document.
pub trait EditSession: Send + Sync {
    /// Close the session and return its in-progress value, if any.
    fn request_stop_editing(&self) -> Option<String>;
}

#[derive(Debug, Clone, Copy)]
pub struct SaveOptions {
    pub skip_validation: bool,
    /// Register a self-save marker so the watcher event caused by this write
    /// is absorbed instead of reported as external.
    pub skip_reload_detection: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            skip_validation: false,
            skip_reload_detection: true,
        }
    }
}

/// Serializable view of a document's state for display layers.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileState {
    pub relative_path: String,
    pub kind: &'static str,
    pub exists: bool,
    pub has_unsaved_changes: bool,
    pub has_file_system_changes: bool,
    pub is_in_edit_mode: bool,
    pub has_conflict: bool,
    pub needs_reload: bool,
    pub last_access_error: Option<String>,
    pub last_modified_ms: Option<u64>,
}

#[derive(Debug, Default)]
struct DocumentState {
    content: String,
    baseline: String,
    /// A baseline was established by a read or a save.
    has_baseline: bool,
    exists: bool,
    last_access_error: Option<FsErrorCode>,
    last_modified: Option<SystemTime>,
    last_size: Option<u64>,
    has_file_system_changes: bool,
    is_in_edit_mode: bool,
    preserve_raw_content: bool,
}

impl DocumentState {
    fn has_unsaved_changes(&self) -> bool {
        self.content != self.baseline
    }

    fn has_conflict(&self) -> bool {
        (self.has_unsaved_changes() || self.is_in_edit_mode) && self.has_file_system_changes
    }

    fn needs_reload(&self) -> bool {
        self.has_file_system_changes && !self.is_in_edit_mode && !self.has_unsaved_changes()
    }

    fn snapshot(&self) -> SaveSnapshot {
        SaveSnapshot {
            content: self.content.clone(),
            baseline: self.baseline.clone(),
            has_file_system_changes: self.has_file_system_changes,
            last_modified: self.last_modified,
            last_size: self.last_size,
        }
    }

    fn restore(&mut self, snapshot: &SaveSnapshot) {
        self.content = snapshot.content.clone();
        self.baseline = snapshot.baseline.clone();
        self.has_file_system_changes = snapshot.has_file_system_changes;
        self.last_modified = snapshot.last_modified;
        self.last_size = snapshot.last_size;
    }

    fn observe(&mut self, stat: Option<FileStat>) {
        self.last_modified = stat.and_then(|s| s.modified);
        self.last_size = stat.map(|s| s.size);
    }
}

struct WatchAttachment {
    _handle: WatchHandle,
    listener: JoinHandle<()>,
}

impl Drop for WatchAttachment {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

struct DocumentInner<K> {
    path: DocumentPath,
    kind: Arc<K>,
    ctx: SyncContext,
    state: Mutex<DocumentState>,
    ledger: Mutex<SelfSaveLedger>,
    reload_generation: AtomicU64,
    events: broadcast::Sender<DocumentChange>,
    edit_session: Mutex<Option<Arc<dyn EditSession>>>,
    watch: Mutex<Option<WatchAttachment>>,
    disposed: AtomicBool,
}

pub struct TrackedDocument<K: DocumentKind> {
    inner: Arc<DocumentInner<K>>,
}

impl<K: DocumentKind> Clone for TrackedDocument<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: DocumentKind> TrackedDocument<K> {
    /// A document with no baseline yet. Most callers want `open`.
    pub fn new(ctx: SyncContext, path: DocumentPath, kind: K) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(DocumentInner {
                path,
                kind: Arc::new(kind),
                ctx,
                state: Mutex::new(DocumentState::default()),
                ledger: Mutex::new(SelfSaveLedger::new()),
                reload_generation: AtomicU64::new(0),
                events,
                edit_session: Mutex::new(None),
                watch: Mutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Create the document and read its initial content. A missing file
    /// opens as an empty, non-existent document.
    pub async fn open(ctx: SyncContext, path: DocumentPath, kind: K) -> Result<Self, SyncError> {
        let doc = Self::new(ctx, path, kind);
        let stat = doc.stat_disk().await;
        match doc.read_disk().await {
            Ok(Some(text)) => doc.with_state(|s| {
                s.content = text.clone();
                s.baseline = text;
                s.has_baseline = true;
                s.exists = true;
                s.last_access_error = None;
                s.observe(stat);
            }),
            Ok(None) => doc.with_state(|s| {
                s.exists = false;
                s.last_access_error = None;
            }),
            Err(e) => {
                doc.note_access_error(&e);
                return Err(SyncError::Io(e));
            }
        }
        log::info!(
            "[lexera.filesync.open] Tracking {} document {:?}",
            doc.inner.kind.label(),
            doc.inner.path.absolute()
        );
        Ok(doc)
    }

    pub fn path(&self) -> &DocumentPath {
        &self.inner.path
    }

    pub fn kind(&self) -> &K {
        &self.inner.kind
    }

    pub fn content(&self) -> String {
        self.with_state(|s| s.content.clone())
    }

    pub fn baseline(&self) -> String {
        self.with_state(|s| s.baseline.clone())
    }

    pub fn has_unsaved_changes(&self) -> bool {
        self.with_state(|s| s.has_unsaved_changes())
    }

    pub fn has_file_system_changes(&self) -> bool {
        self.with_state(|s| s.has_file_system_changes)
    }

    pub fn has_conflict(&self) -> bool {
        self.with_state(|s| s.has_conflict())
    }

    pub fn needs_reload(&self) -> bool {
        self.with_state(|s| s.needs_reload())
    }

    pub fn exists(&self) -> bool {
        self.with_state(|s| s.exists)
    }

    pub fn is_in_edit_mode(&self) -> bool {
        self.with_state(|s| s.is_in_edit_mode)
    }

    pub fn preserve_raw_content(&self) -> bool {
        self.with_state(|s| s.preserve_raw_content)
    }

    pub fn last_access_error(&self) -> Option<FsErrorCode> {
        self.with_state(|s| s.last_access_error.clone())
    }

    pub fn last_modified(&self) -> Option<SystemTime> {
        self.with_state(|s| s.last_modified)
    }

    pub fn file_state(&self) -> FileState {
        let label = self.inner.kind.label();
        let relative_path = self.inner.path.relative().to_string();
        self.with_state(|s| FileState {
            relative_path,
            kind: label,
            exists: s.exists,
            has_unsaved_changes: s.has_unsaved_changes(),
            has_file_system_changes: s.has_file_system_changes,
            is_in_edit_mode: s.is_in_edit_mode,
            has_conflict: s.has_conflict(),
            needs_reload: s.needs_reload(),
            last_access_error: s.last_access_error.as_ref().map(|c| c.to_string()),
            last_modified_ms: s
                .last_modified
                .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64),
        })
    }

    /// Replace the in-memory content (an edit from the board layer).
    pub fn set_content(&self, content: impl Into<String>) {
        let content = content.into();
        let (changed, conflict_began) = self.with_state(|s| {
            if s.content == content {
                return (false, false);
            }
            let was_conflicted = s.has_conflict();
            s.content = content;
            (true, !was_conflicted && s.has_conflict())
        });
        if changed {
            self.emit(ChangeType::Content);
        }
        if conflict_began {
            self.emit(ChangeType::Conflict);
        }
    }

    /// Drop unsaved edits: content reverts to baseline, disk is untouched.
    /// Returns whether anything changed.
    pub fn discard_changes(&self) -> bool {
        let changed = self.with_state(|s| {
            if !s.has_unsaved_changes() {
                return false;
            }
            s.content = s.baseline.clone();
            s.preserve_raw_content = false;
            true
        });
        if changed {
            self.emit(ChangeType::Content);
        }
        changed
    }

    /// Adopt `content` as both content and baseline without touching disk,
    /// e.g. after another component wrote the file on this document's behalf.
    pub fn force_sync_baseline(&self, content: impl Into<String>) {
        let content = content.into();
        self.with_state(|s| {
            s.content = content.clone();
            s.baseline = content;
            s.has_baseline = true;
            s.has_file_system_changes = false;
        });
        self.emit(ChangeType::Content);
    }

    pub fn set_edit_mode(&self, editing: bool) {
        self.with_state(|s| s.is_in_edit_mode = editing);
    }

    pub fn set_preserve_raw_content(&self, preserve: bool) {
        self.with_state(|s| s.preserve_raw_content = preserve);
    }

    pub fn set_edit_session(&self, session: Option<Arc<dyn EditSession>>) {
        *lock(&self.inner.edit_session) = session;
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DocumentChange> {
        self.inner.events.subscribe()
    }

    /// Check writability of the target path and remember the result.
    pub async fn probe_write_access(&self) -> Option<FsErrorCode> {
        let path = self.inner.path.absolute().to_path_buf();
        let code = tokio::task::spawn_blocking(move || crate::access::probe_write_access(&path))
            .await
            .unwrap_or_else(|e| Some(FsErrorCode::Other(e.to_string())));
        self.with_state(|s| s.last_access_error = code.clone());
        code
    }

    /// Attach to the shared watch for this path and start reacting to its
    /// events. Idempotent. The listener runs as a task, so this fails with
    /// `SyncError::Watch` outside a tokio runtime.
    pub fn start_watching(&self) -> Result<(), SyncError> {
        self.ensure_live()?;
        let mut watch = lock(&self.inner.watch);
        if watch.is_some() {
            return Ok(());
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|e| SyncError::Watch {
            path: self.inner.path.absolute().to_path_buf(),
            message: e.to_string(),
        })?;
        let handle = self.inner.ctx.registry.attach(self.inner.path.absolute())?;
        let rx = handle.subscribe();
        let listener = runtime.spawn(listen(rx, Arc::downgrade(&self.inner)));
        *watch = Some(WatchAttachment {
            _handle: handle,
            listener,
        });
        Ok(())
    }

    /// Drop this document's subscription and its reference on the shared
    /// watch. Other documents watching the same path are unaffected.
    pub fn stop_watching(&self) {
        let attachment = lock(&self.inner.watch).take();
        drop(attachment);
    }

    pub fn is_watching(&self) -> bool {
        lock(&self.inner.watch).is_some()
    }

    /// End of life: cancels in-flight reloads, detaches from the watcher and
    /// forgets pending self-save markers. Later saves and reloads fail with
    /// `SyncError::Disposed`.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.next_generation();
        self.stop_watching();
        self.set_edit_session(None);
        lock(&self.inner.ledger).clear();
        log::info!(
            "[lexera.filesync.open] Disposed {:?}",
            self.inner.path.absolute()
        );
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), SyncError> {
        if self.is_disposed() {
            Err(SyncError::Disposed(self.inner.path.absolute().to_path_buf()))
        } else {
            Ok(())
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut DocumentState) -> R) -> R {
        f(&mut lock(&self.inner.state))
    }

    fn ledger(&self) -> MutexGuard<'_, SelfSaveLedger> {
        lock(&self.inner.ledger)
    }

    fn emit(&self, change_type: ChangeType) {
        self.emit_change(self.change(change_type));
    }

    fn change(&self, change_type: ChangeType) -> DocumentChange {
        DocumentChange::new(
            self.inner.path.absolute().to_path_buf(),
            self.inner.path.relative().to_string(),
            change_type,
        )
    }

    fn emit_change(&self, change: DocumentChange) {
        if self.inner.events.send(change).is_err() {
            log::trace!(
                "[lexera.filesync.events] No subscribers for {:?}",
                self.inner.path.absolute()
            );
        }
    }

    fn note_access_error(&self, err: &io::Error) {
        let code = FsErrorCode::from_io(err);
        log::warn!(
            "[lexera.filesync.io] Cannot read {:?}: {} ({})",
            self.inner.path.absolute(),
            err,
            code
        );
        self.with_state(|s| s.last_access_error = Some(code));
    }

    async fn read_disk(&self) -> io::Result<Option<String>> {
        let kind = Arc::clone(&self.inner.kind);
        let path = self.inner.path.absolute().to_path_buf();
        run_blocking(move || kind.read_from_disk(&path)).await
    }

    async fn write_disk(&self, content: &str) -> io::Result<()> {
        let kind = Arc::clone(&self.inner.kind);
        let path = self.inner.path.absolute().to_path_buf();
        let content = content.to_string();
        run_blocking(move || kind.write_to_disk(&path, &content)).await
    }

    async fn stat_disk(&self) -> Option<FileStat> {
        let path = self.inner.path.absolute().to_path_buf();
        run_blocking(move || Ok(storage::file_stat(&path)))
            .await
            .ok()
            .flatten()
    }
}

impl<K: DocumentKind> std::fmt::Debug for TrackedDocument<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedDocument")
            .field("kind", &self.inner.kind.label())
            .field("path", &self.inner.path.absolute())
            .finish()
    }
}

async fn listen<K: DocumentKind>(
    mut rx: broadcast::Receiver<crate::watcher::types::WatchEvent>,
    inner: Weak<DocumentInner<K>>,
) {
    use broadcast::error::RecvError;

    loop {
        let kind = match rx.recv().await {
            Ok(event) => event.kind,
            Err(RecvError::Lagged(skipped)) => {
                log::debug!(
                    "[lexera.filesync.watch] Listener lagged by {} events, treating as one change",
                    skipped
                );
                FileChangeKind::Modified
            }
            Err(RecvError::Closed) => break,
        };
        let Some(inner) = inner.upgrade() else {
            break;
        };
        TrackedDocument { inner }.handle_file_change(kind).await;
    }
}

async fn run_blocking<T, F>(f: F) -> io::Result<T>
where
    F: FnOnce() -> io::Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
