/// Per-path serialization of save and reload operations.
///
/// `start_operation` waits until no other operation holds the path; waiters
/// are served in FIFO order (tokio's mutex is fair). The returned guard
/// ends the operation when dropped, so early returns and errors always
/// release the path.
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Save,
    Reload,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Save => f.write_str("save"),
            OperationKind::Reload => f.write_str("reload"),
        }
    }
}

struct PathSlot {
    lock: Arc<tokio::sync::Mutex<()>>,
    active: Option<OperationKind>,
}

#[derive(Default)]
pub struct WatcherCoordinator {
    slots: Mutex<HashMap<PathBuf, PathSlot>>,
}

impl WatcherCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn start_operation(
        self: &Arc<Self>,
        path: &Path,
        kind: OperationKind,
    ) -> OperationGuard {
        let lock = {
            let mut slots = self.lock_slots();
            let slot = slots.entry(path.to_path_buf()).or_insert_with(|| PathSlot {
                lock: Arc::new(tokio::sync::Mutex::new(())),
                active: None,
            });
            if let Some(active) = slot.active {
                log::debug!(
                    "[lexera.filesync.coord] {} on {:?} queued behind {}",
                    kind,
                    path,
                    active
                );
            }
            Arc::clone(&slot.lock)
        };

        let guard = lock.lock_owned().await;
        if let Some(slot) = self.lock_slots().get_mut(path) {
            slot.active = Some(kind);
        }

        OperationGuard {
            coordinator: Arc::clone(self),
            path: path.to_path_buf(),
            kind,
            started: Instant::now(),
            guard: Some(guard),
        }
    }

    /// End an operation explicitly. Equivalent to dropping the guard.
    pub fn end_operation(&self, guard: OperationGuard) {
        drop(guard);
    }

    /// The operation currently holding `path`, if any.
    pub fn active_operation(&self, path: &Path) -> Option<OperationKind> {
        self.lock_slots().get(path).and_then(|s| s.active)
    }

    fn finish(&self, path: &Path, guard: OwnedMutexGuard<()>) {
        let mut slots = self.lock_slots();
        if let Some(slot) = slots.get_mut(path) {
            slot.active = None;
            // map + the guard being released: nobody is waiting.
            if Arc::strong_count(&slot.lock) <= 2 {
                slots.remove(path);
            }
        }
        drop(guard);
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<PathBuf, PathSlot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }
}

pub struct OperationGuard {
    coordinator: Arc<WatcherCoordinator>,
    path: PathBuf,
    kind: OperationKind,
    started: Instant,
    guard: Option<OwnedMutexGuard<()>>,
}

impl OperationGuard {
    pub fn kind(&self) -> OperationKind {
        self.kind
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            log::trace!(
                "[lexera.filesync.coord] {} on {:?} finished after {:?}",
                self.kind,
                self.path,
                self.started.elapsed()
            );
            self.coordinator.finish(&self.path, guard);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_operations_on_same_path_run_in_fifo_order() {
        let coord = Arc::new(WatcherCoordinator::new());
        let path = PathBuf::from("/boards/main.md");
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = coord.start_operation(&path, OperationKind::Save).await;
        assert_eq!(coord.active_operation(&path), Some(OperationKind::Save));

        let mut tasks = Vec::new();
        for i in 0..3 {
            let coord = Arc::clone(&coord);
            let path = path.clone();
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let _op = coord.start_operation(&path, OperationKind::Reload).await;
                order.lock().unwrap().push(i);
            }));
            // let each task enqueue before the next one starts
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert!(order.lock().unwrap().is_empty());
        coord.end_operation(first);
        for t in tasks {
            t.await.unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(coord.active_operation(&path), None);
    }

    #[tokio::test]
    async fn test_different_paths_do_not_block() {
        let coord = Arc::new(WatcherCoordinator::new());
        let _a = coord
            .start_operation(Path::new("/a.md"), OperationKind::Save)
            .await;
        let b = tokio::time::timeout(
            Duration::from_millis(200),
            coord.start_operation(Path::new("/b.md"), OperationKind::Save),
        )
        .await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn test_slot_removed_when_idle() {
        let coord = Arc::new(WatcherCoordinator::new());
        let op = coord
            .start_operation(Path::new("/a.md"), OperationKind::Reload)
            .await;
        drop(op);
        assert!(coord.lock_slots().is_empty());
    }
}
