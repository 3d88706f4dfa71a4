/// Shared watch registry.
///
/// One underlying watch per absolute path, reference-counted across every
/// tracked document observing it. Each attach returns a `WatchHandle`; the
/// handle gives its owner its own event subscription and releases one
/// reference when dropped. The backend watch is removed only when the last
/// handle for the path goes away.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;

use super::types::{FileChangeKind, WatchEvent};
use crate::error::SyncError;

const PATH_CHANNEL_CAPACITY: usize = 64;

/// OS-level watch primitive behind the registry.
pub trait WatchBackend: Send + Sync {
    fn watch(&self, path: &Path) -> Result<(), SyncError>;
    fn unwatch(&self, path: &Path);
}

/// Backend without OS subscriptions. Events arrive only through
/// `SharedWatchRegistry::dispatch` (polling callers, tests).
#[derive(Debug, Default)]
pub struct ManualWatchBackend {
    watched: Mutex<Vec<PathBuf>>,
}

impl ManualWatchBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths currently holding a backend watch.
    pub fn watched(&self) -> Vec<PathBuf> {
        self.watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl WatchBackend for ManualWatchBackend {
    fn watch(&self, path: &Path) -> Result<(), SyncError> {
        self.watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(path.to_path_buf());
        Ok(())
    }

    fn unwatch(&self, path: &Path) {
        self.watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|p| p != path);
    }
}

impl<T: WatchBackend + ?Sized> WatchBackend for Arc<T> {
    fn watch(&self, path: &Path) -> Result<(), SyncError> {
        (**self).watch(path)
    }

    fn unwatch(&self, path: &Path) {
        (**self).unwatch(path)
    }
}

struct WatchEntry {
    refcount: usize,
    tx: broadcast::Sender<WatchEvent>,
}

pub struct SharedWatchRegistry {
    entries: Mutex<HashMap<PathBuf, WatchEntry>>,
    /// Held across refcount changes and the backend call they imply, so an
    /// attach never shares an entry whose backend watch is still pending.
    /// `dispatch` does not take it.
    membership: Mutex<()>,
    backend: Box<dyn WatchBackend>,
}

impl SharedWatchRegistry {
    pub fn new(backend: Box<dyn WatchBackend>) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(HashMap::new()),
            membership: Mutex::new(()),
            backend,
        })
    }

    pub fn manual() -> Arc<Self> {
        Self::new(Box::new(ManualWatchBackend::new()))
    }

    /// Attach to the watch for `path`, creating it on first use.
    pub fn attach(self: &Arc<Self>, path: &Path) -> Result<WatchHandle, SyncError> {
        let _membership = self.lock_membership();
        let first = {
            let mut entries = self.lock_entries();
            match entries.get_mut(path) {
                Some(entry) => {
                    entry.refcount += 1;
                    false
                }
                None => {
                    let (tx, _) = broadcast::channel(PATH_CHANNEL_CAPACITY);
                    entries.insert(path.to_path_buf(), WatchEntry { refcount: 1, tx });
                    true
                }
            }
        };

        // Backend calls happen outside the entries lock: its callback
        // thread dispatches into this registry.
        if first {
            if let Err(e) = self.backend.watch(path) {
                self.release_locked(path, false);
                return Err(e);
            }
            log::info!("[lexera.filesync.watch] Watching {:?}", path);
        } else {
            log::debug!(
                "[lexera.filesync.watch] Shared watch on {:?} now has {} users",
                path,
                self.refcount(path)
            );
        }

        Ok(WatchHandle {
            registry: Arc::clone(self),
            path: path.to_path_buf(),
        })
    }

    /// Deliver a change notification to every subscriber of `path`.
    /// Returns the number of subscribers reached; unknown paths are ignored.
    pub fn dispatch(&self, path: &Path, kind: FileChangeKind) -> usize {
        let tx = {
            let entries = self.lock_entries();
            match entries.get(path) {
                Some(entry) => entry.tx.clone(),
                None => return 0,
            }
        };
        tx.send(WatchEvent {
            path: path.to_path_buf(),
            kind,
        })
        .unwrap_or(0)
    }

    pub fn refcount(&self, path: &Path) -> usize {
        self.lock_entries()
            .get(path)
            .map(|e| e.refcount)
            .unwrap_or(0)
    }

    pub fn watched_paths(&self) -> Vec<PathBuf> {
        self.lock_entries().keys().cloned().collect()
    }

    fn subscribe(&self, path: &Path) -> Option<broadcast::Receiver<WatchEvent>> {
        self.lock_entries().get(path).map(|e| e.tx.subscribe())
    }

    fn release(&self, path: &Path) {
        let _membership = self.lock_membership();
        self.release_locked(path, true);
    }

    fn release_locked(&self, path: &Path, unwatch_backend: bool) {
        let last = {
            let mut entries = self.lock_entries();
            match entries.get_mut(path) {
                Some(entry) if entry.refcount > 1 => {
                    entry.refcount -= 1;
                    false
                }
                Some(_) => {
                    entries.remove(path);
                    true
                }
                None => false,
            }
        };
        if last && unwatch_backend {
            self.backend.unwatch(path);
            log::info!("[lexera.filesync.watch] Stopped watching {:?}", path);
        }
    }

    fn lock_membership(&self) -> std::sync::MutexGuard<'_, ()> {
        self.membership.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_entries(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, WatchEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One reference on a shared watch. Dropping it detaches.
pub struct WatchHandle {
    registry: Arc<SharedWatchRegistry>,
    path: PathBuf,
}

impl WatchHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A new subscription owned by the caller. Dropping the receiver only
    /// removes this listener; the shared watch stays while handles remain.
    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        match self.registry.subscribe(&self.path) {
            Some(rx) => rx,
            // The entry lives as long as this handle, so this is unreachable
            // in practice; hand back a closed receiver rather than panic.
            None => broadcast::channel(1).1,
        }
    }

    /// Explicit detach, same as dropping the handle.
    pub fn detach(self) {}
}

impl Drop for WatchHandle {
    fn drop(&mut self) {
        self.registry.release(&self.path);
    }
}

impl std::fmt::Debug for WatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchHandle").field("path", &self.path).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;

    fn registry_with_backend() -> (Arc<SharedWatchRegistry>, Arc<ManualWatchBackend>) {
        let backend = Arc::new(ManualWatchBackend::new());
        let registry = SharedWatchRegistry::new(Box::new(Arc::clone(&backend)));
        (registry, backend)
    }

    #[test]
    fn test_one_backend_watch_per_path() {
        let (registry, backend) = registry_with_backend();
        let path = Path::new("/boards/include.md");

        let a = registry.attach(path).unwrap();
        let b = registry.attach(path).unwrap();
        assert_eq!(registry.refcount(path), 2);
        assert_eq!(backend.watched(), vec![path.to_path_buf()]);

        drop(a);
        assert_eq!(registry.refcount(path), 1);
        assert_eq!(backend.watched().len(), 1);

        b.detach();
        assert_eq!(registry.refcount(path), 0);
        assert!(backend.watched().is_empty());
        assert!(registry.watched_paths().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_reaches_every_subscriber() {
        let registry = SharedWatchRegistry::manual();
        let path = Path::new("/boards/include.md");
        let a = registry.attach(path).unwrap();
        let b = registry.attach(path).unwrap();
        let mut rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        assert_eq!(registry.dispatch(path, FileChangeKind::Modified), 2);
        assert_eq!(rx_a.recv().await.unwrap().kind, FileChangeKind::Modified);
        assert_eq!(rx_b.recv().await.unwrap().kind, FileChangeKind::Modified);
    }

    #[test]
    fn test_dropping_one_subscription_keeps_others() {
        let registry = SharedWatchRegistry::manual();
        let path = Path::new("/boards/include.md");
        let a = registry.attach(path).unwrap();
        let b = registry.attach(path).unwrap();
        let rx_a = a.subscribe();
        let mut rx_b = b.subscribe();

        drop(rx_a);
        drop(a);
        assert_eq!(registry.dispatch(path, FileChangeKind::Deleted), 1);
        assert_eq!(rx_b.try_recv().unwrap().kind, FileChangeKind::Deleted);
    }

    #[test]
    fn test_dispatch_to_unknown_path_is_ignored() {
        let registry = SharedWatchRegistry::manual();
        assert_eq!(
            registry.dispatch(Path::new("/nope.md"), FileChangeKind::Modified),
            0
        );
    }

    #[test]
    fn test_failed_backend_watch_leaves_no_entry() {
        struct Refusing;
        impl WatchBackend for Refusing {
            fn watch(&self, path: &Path) -> Result<(), SyncError> {
                Err(SyncError::Watch {
                    path: path.to_path_buf(),
                    message: "too many watches".to_string(),
                })
            }
            fn unwatch(&self, _path: &Path) {}
        }

        let registry = SharedWatchRegistry::new(Box::new(Refusing));
        let path = Path::new("/boards/main.md");
        assert!(registry.attach(path).is_err());
        assert_eq!(registry.refcount(path), 0);
    }

    /// Fails its first watch call, but only once the test lets it.
    struct SlowFirstFailure {
        calls: AtomicUsize,
        entered: Mutex<mpsc::Sender<()>>,
        proceed: Mutex<mpsc::Receiver<()>>,
    }

    impl WatchBackend for SlowFirstFailure {
        fn watch(&self, path: &Path) -> Result<(), SyncError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
                return Ok(());
            }
            self.entered.lock().unwrap().send(()).unwrap();
            self.proceed.lock().unwrap().recv().unwrap();
            Err(SyncError::Watch {
                path: path.to_path_buf(),
                message: "transient".to_string(),
            })
        }
        fn unwatch(&self, _path: &Path) {}
    }

    #[test]
    fn test_attach_during_failing_watch_gets_its_own_watch() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let backend = Arc::new(SlowFirstFailure {
            calls: AtomicUsize::new(0),
            entered: Mutex::new(entered_tx),
            proceed: Mutex::new(proceed_rx),
        });
        let registry = SharedWatchRegistry::new(Box::new(Arc::clone(&backend)));
        let path = PathBuf::from("/boards/main.md");

        let first = {
            let (registry, path) = (Arc::clone(&registry), path.clone());
            std::thread::spawn(move || registry.attach(&path).map(|_| ()))
        };
        entered_rx.recv().unwrap();
        let second = {
            let (registry, path) = (Arc::clone(&registry), path.clone());
            std::thread::spawn(move || registry.attach(&path))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        proceed_tx.send(()).unwrap();

        assert!(first.join().unwrap().is_err());
        let handle = second.join().unwrap().unwrap();
        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        assert_eq!(registry.refcount(&path), 1);
        drop(handle);
        assert_eq!(registry.refcount(&path), 0);
    }
}
