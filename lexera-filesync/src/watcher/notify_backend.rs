/// OS watch backend using notify-debouncer-full.
///
/// Parent directories are watched non-recursively so atomic replaces
/// (write temp, rename over) keep producing events for the file. Debounced
/// events are bridged into the tokio side through an unbounded channel and
/// dispatched into the registry from there.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebouncedEvent, Debouncer, RecommendedCache};
use tokio::sync::mpsc;

use super::registry::{SharedWatchRegistry, WatchBackend};
use super::types::{FileChangeKind, WatchEvent};
use crate::error::SyncError;

pub struct NotifyWatchBackend {
    debouncer: Mutex<Debouncer<notify::RecommendedWatcher, RecommendedCache>>,
    /// watched parent directory -> number of watched files inside it
    watched_dirs: Mutex<HashMap<PathBuf, usize>>,
}

impl NotifyWatchBackend {
    pub fn new(
        debounce: Duration,
        sink: mpsc::UnboundedSender<WatchEvent>,
    ) -> Result<Self, SyncError> {
        let debouncer = new_debouncer(
            debounce,
            None,
            move |result: Result<Vec<DebouncedEvent>, Vec<notify::Error>>| match result {
                Ok(events) => {
                    for event in coalesce(&events) {
                        if sink.send(event).is_err() {
                            log::warn!("[lexera.filesync.watch] Event pump closed, dropping event");
                            return;
                        }
                    }
                }
                Err(errors) => {
                    for e in errors {
                        log::error!("[lexera.filesync.watch] Watch error: {}", e);
                    }
                }
            },
        )
        .map_err(|e| SyncError::Watch {
            path: PathBuf::new(),
            message: e.to_string(),
        })?;

        Ok(Self {
            debouncer: Mutex::new(debouncer),
            watched_dirs: Mutex::new(HashMap::new()),
        })
    }
}

impl WatchBackend for NotifyWatchBackend {
    fn watch(&self, path: &Path) -> Result<(), SyncError> {
        let Some(parent) = path.parent() else {
            return Err(SyncError::Watch {
                path: path.to_path_buf(),
                message: "path has no parent directory".to_string(),
            });
        };

        let mut dirs = self.watched_dirs.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = dirs.get_mut(parent) {
            *count += 1;
            return Ok(());
        }

        self.debouncer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .watch(parent, RecursiveMode::NonRecursive)
            .map_err(|e| SyncError::Watch {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        dirs.insert(parent.to_path_buf(), 1);
        Ok(())
    }

    fn unwatch(&self, path: &Path) {
        let Some(parent) = path.parent() else {
            return;
        };
        let mut dirs = self.watched_dirs.lock().unwrap_or_else(|e| e.into_inner());
        let remove = match dirs.get_mut(parent) {
            Some(count) if *count > 1 => {
                *count -= 1;
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            dirs.remove(parent);
            if let Err(e) = self
                .debouncer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .unwatch(parent)
            {
                log::warn!(
                    "[lexera.filesync.watch] Failed to unwatch {:?}: {}",
                    parent,
                    e
                );
            }
        }
    }
}

/// Build a registry backed by OS notifications. Must be called inside a
/// tokio runtime: the event pump runs as a task.
pub fn notify_registry(debounce: Duration) -> Result<Arc<SharedWatchRegistry>, SyncError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let backend = NotifyWatchBackend::new(debounce, tx)?;
    let registry = SharedWatchRegistry::new(Box::new(backend));
    tokio::spawn(pump_events(rx, Arc::downgrade(&registry)));
    Ok(registry)
}

async fn pump_events(
    mut rx: mpsc::UnboundedReceiver<WatchEvent>,
    registry: Weak<SharedWatchRegistry>,
) {
    while let Some(event) = rx.recv().await {
        let Some(registry) = registry.upgrade() else {
            break;
        };
        registry.dispatch(&event.path, event.kind);
    }
    log::debug!("[lexera.filesync.watch] Event pump stopped");
}

/// Collapse one debounced batch to a single event per path, in first-seen
/// order. An atomic replace arrives as several raw events for the same file
/// (remove + create, or a rename) and must reach documents as one change.
fn coalesce(events: &[DebouncedEvent]) -> Vec<WatchEvent> {
    let mut merged: Vec<WatchEvent> = Vec::new();
    for event in events {
        let Some(kind) = change_kind(&event.kind) else {
            continue;
        };
        for path in &event.paths {
            let path = crate::storage::canonical_path(path);
            match merged.iter_mut().find(|e| e.path == path) {
                Some(existing) => existing.kind = merge_kinds(existing.kind, kind),
                None => merged.push(WatchEvent { path, kind }),
            }
        }
    }
    merged
}

fn change_kind(kind: &EventKind) -> Option<FileChangeKind> {
    match kind {
        EventKind::Remove(_) => Some(FileChangeKind::Deleted),
        EventKind::Create(_) => Some(FileChangeKind::Created),
        EventKind::Modify(_) | EventKind::Any | EventKind::Other => Some(FileChangeKind::Modified),
        EventKind::Access(_) => None,
    }
}

/// Net effect of `earlier` followed by `later` on the same path.
fn merge_kinds(earlier: FileChangeKind, later: FileChangeKind) -> FileChangeKind {
    use FileChangeKind::*;
    match (earlier, later) {
        (_, Deleted) => Deleted,
        (Created, _) => Created,
        (Deleted, _) | (Modified, _) => Modified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use notify::Event;

    fn raw(kind: EventKind, path: &Path) -> DebouncedEvent {
        DebouncedEvent::new(Event::new(kind).add_path(path.to_path_buf()), std::time::Instant::now())
    }

    #[test]
    fn test_atomic_replace_collapses_to_one_modify() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let path = root.join("board.md");
        std::fs::write(&path, "x").unwrap();

        let events = coalesce(&[
            raw(EventKind::Remove(RemoveKind::File), &path),
            raw(EventKind::Create(CreateKind::File), &path),
            raw(EventKind::Modify(ModifyKind::Any), &root.join(".board.md.lexera-sync.tmp")),
        ]);

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].path, path);
        assert_eq!(events[0].kind, FileChangeKind::Modified);
    }

    #[test]
    fn test_merge_kinds_keeps_net_effect() {
        use FileChangeKind::*;
        assert_eq!(merge_kinds(Created, Modified), Created);
        assert_eq!(merge_kinds(Modified, Deleted), Deleted);
        assert_eq!(merge_kinds(Deleted, Created), Modified);
        assert_eq!(merge_kinds(Created, Deleted), Deleted);
    }

    #[tokio::test]
    async fn test_external_write_reaches_subscriber() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = std::fs::canonicalize(dir.path()).unwrap();
        let path = dir_path.join("board.md");
        std::fs::write(&path, "one").unwrap();

        let registry = notify_registry(Duration::from_millis(50)).unwrap();
        let handle = registry.attach(&path).unwrap();
        let mut rx = handle.subscribe();

        std::fs::write(&path, "two").unwrap();
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no watcher event within timeout")
            .unwrap();
        assert_eq!(event.path, path);
    }
}
