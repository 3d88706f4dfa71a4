/// Process-wide services injected into every tracked document.
use std::path::PathBuf;
use std::sync::Arc;

use crate::backup::{BackupFacility, LocalBackupStore};
use crate::config::SyncSettings;
use crate::transaction::SaveTransactionLog;
use crate::watcher::coordinator::WatcherCoordinator;
use crate::watcher::registry::SharedWatchRegistry;

#[derive(Clone)]
pub struct SyncContext {
    pub registry: Arc<SharedWatchRegistry>,
    pub coordinator: Arc<WatcherCoordinator>,
    pub transactions: Arc<SaveTransactionLog>,
    pub backups: Arc<dyn BackupFacility>,
    pub emergency_dir: PathBuf,
}

impl SyncContext {
    pub fn new(registry: Arc<SharedWatchRegistry>, settings: &SyncSettings) -> Self {
        Self {
            registry,
            coordinator: Arc::new(WatcherCoordinator::new()),
            transactions: Arc::new(SaveTransactionLog::new()),
            backups: Arc::new(LocalBackupStore::new(settings.backup_dir.clone())),
            emergency_dir: settings.emergency_dir(),
        }
    }

    /// Context whose watch events only arrive through `registry.dispatch`.
    pub fn manual(settings: &SyncSettings) -> Self {
        Self::new(SharedWatchRegistry::manual(), settings)
    }

    /// Context backed by OS file notifications. Needs a tokio runtime.
    #[cfg(feature = "file-watcher")]
    pub fn with_file_watcher(settings: &SyncSettings) -> Result<Self, crate::error::SyncError> {
        let registry = crate::watcher::notify_backend::notify_registry(
            std::time::Duration::from_millis(settings.debounce_ms),
        )?;
        Ok(Self::new(registry, settings))
    }

    pub fn with_backups(mut self, backups: Arc<dyn BackupFacility>) -> Self {
        self.backups = backups;
        self
    }
}
