/// Reload pipeline.
///
/// Every call takes a new `Generation`. After each await the call checks it
/// is still the newest one; a superseded reload finishes its I/O but never
/// touches document state.
use std::sync::atomic::Ordering;

use super::{DocumentKind, TrackedDocument};
use crate::error::SyncError;
use crate::events::ChangeType;
use crate::fingerprint::same_content;
use crate::watcher::coordinator::OperationKind;

/// Identity of one reload call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(u64);

impl Generation {
    pub fn value(self) -> u64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Disk differed from baseline; content and baseline were replaced.
    Reloaded,
    /// Full read matched the baseline (e.g. a touch); only the flag cleared.
    Unchanged,
    /// Modification time and size unchanged; nothing was read.
    Skipped,
    /// A newer reload started before this one finished.
    Superseded,
    /// The file does not exist. `exists` is cleared and so is the external
    /// change flag: there is nothing left to pull in.
    Missing,
}

impl<K: DocumentKind> TrackedDocument<K> {
    pub fn current_generation(&self) -> Generation {
        Generation(self.inner.reload_generation.load(Ordering::SeqCst))
    }

    pub(super) fn next_generation(&self) -> Generation {
        Generation(self.inner.reload_generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn is_current(&self, generation: Generation) -> bool {
        self.current_generation() == generation
    }

    /// Pull disk content into memory.
    pub async fn reload(&self) -> Result<ReloadOutcome, SyncError> {
        self.ensure_live()?;
        let generation = self.next_generation();
        let path = self.inner.path.absolute().to_path_buf();

        let _op = self
            .inner
            .ctx
            .coordinator
            .start_operation(&path, OperationKind::Reload)
            .await;
        if !self.is_current(generation) {
            return Ok(self.superseded(generation));
        }

        let stat = self.stat_disk().await;
        if !self.is_current(generation) {
            return Ok(self.superseded(generation));
        }

        if let Some(stat) = stat {
            let unchanged = self.with_state(|s| {
                s.has_baseline
                    && s.last_modified.is_some()
                    && s.last_modified == stat.modified
                    && s.last_size == Some(stat.size)
            });
            if unchanged {
                self.with_state(|s| s.has_file_system_changes = false);
                log::trace!(
                    "[lexera.filesync.reload] {:?} unchanged by mtime/size, skipping read",
                    path
                );
                return Ok(ReloadOutcome::Skipped);
            }
        }

        let read = self.read_disk().await;
        if !self.is_current(generation) {
            return Ok(self.superseded(generation));
        }

        let disk = match read {
            Ok(Some(disk)) => disk,
            Ok(None) => {
                self.with_state(|s| {
                    s.exists = false;
                    s.has_file_system_changes = false;
                    s.last_access_error = None;
                    s.observe(None);
                });
                log::info!("[lexera.filesync.reload] {:?} no longer exists", path);
                return Ok(ReloadOutcome::Missing);
            }
            Err(e) => {
                self.note_access_error(&e);
                return Err(SyncError::Io(e));
            }
        };

        let reloaded = self.with_state(|s| {
            let changed = !s.has_baseline || !same_content(&disk, &s.baseline);
            if changed {
                s.content = disk.clone();
                s.baseline = disk;
                s.preserve_raw_content = false;
            }
            s.has_baseline = true;
            s.has_file_system_changes = false;
            s.exists = true;
            s.last_access_error = None;
            s.observe(stat);
            changed
        });

        if reloaded {
            log::info!("[lexera.filesync.reload] Reloaded {:?} from disk", path);
            self.emit(ChangeType::Reloaded);
            Ok(ReloadOutcome::Reloaded)
        } else {
            Ok(ReloadOutcome::Unchanged)
        }
    }

    fn superseded(&self, generation: Generation) -> ReloadOutcome {
        log::debug!(
            "[lexera.filesync.reload] Reload #{} of {:?} superseded, discarding result",
            generation.value(),
            self.inner.path.absolute()
        );
        ReloadOutcome::Superseded
    }
}
