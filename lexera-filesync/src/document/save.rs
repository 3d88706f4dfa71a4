/// Save pipeline: validate -> write -> verify -> commit.
///
/// Failures after validation roll the in-memory state back to the
/// transaction snapshot, then re-read the disk to find out what actually
/// happened. If the write did land the save is committed anyway. Otherwise
/// the attempted content goes to an emergency backup and the error names
/// where it went.
use std::sync::Arc;
use std::time::Duration;

use super::{DocumentKind, SaveOptions, TrackedDocument};
use crate::backup::emergency_backup;
use crate::error::{BackupOutcome, ReconcileOutcome, SyncError};
use crate::events::ChangeType;
use crate::fingerprint::{same_content, MarkerId};
use crate::transaction::SaveSnapshot;
use crate::watcher::coordinator::OperationKind;

pub(super) const VERIFY_ATTEMPTS: u32 = 3;
const VERIFY_DELAY: Duration = Duration::from_millis(50);

impl<K: DocumentKind> TrackedDocument<K> {
    pub async fn save(&self, options: SaveOptions) -> Result<(), SyncError> {
        self.ensure_live()?;
        let path = self.inner.path.absolute().to_path_buf();
        let _op = self
            .inner
            .ctx
            .coordinator
            .start_operation(&path, OperationKind::Save)
            .await;
        self.ensure_live()?;

        let (snapshot, existed) = self.with_state(|s| (s.snapshot(), s.exists));
        let content = snapshot.content.clone();
        let transactions = Arc::clone(&self.inner.ctx.transactions);
        transactions.begin(&path, snapshot.clone());

        if !options.skip_validation {
            let validation = self.inner.kind.validate(&content);
            if !validation.valid {
                transactions.rollback(&path);
                log::warn!(
                    "[lexera.filesync.save] Refusing to save {:?}: {}",
                    path,
                    validation.errors.join("; ")
                );
                return Err(SyncError::Validation {
                    path,
                    errors: validation.errors,
                });
            }
        }

        if let Some(code) = self.probe_write_access().await {
            transactions.rollback(&path);
            return Err(SyncError::Access { path, code });
        }

        let marker = if options.skip_reload_detection {
            Some(self.ledger().register(&content))
        } else {
            None
        };

        let result = match self.write_disk(&content).await {
            Ok(()) => self.verify_written(&content).await,
            Err(source) => Err(SyncError::Write {
                path: path.clone(),
                source,
            }),
        };

        match result {
            Ok(()) => {
                transactions.commit(&path);
                self.commit_save(&content).await;
                Ok(())
            }
            Err(err) => {
                self.recover_failed_save(err, snapshot, existed, marker)
                    .await
            }
        }
    }

    /// Re-read the disk until it shows what we wrote.
    async fn verify_written(&self, expected: &str) -> Result<(), SyncError> {
        for attempt in 1..=VERIFY_ATTEMPTS {
            match self.read_disk().await {
                Ok(Some(disk)) if same_content(&disk, expected) => return Ok(()),
                Ok(_) => {}
                Err(e) => log::debug!(
                    "[lexera.filesync.save] Verify read {} of {:?} failed: {}",
                    attempt,
                    self.inner.path.absolute(),
                    e
                ),
            }
            if attempt < VERIFY_ATTEMPTS {
                tokio::time::sleep(VERIFY_DELAY).await;
            }
        }
        log::warn!(
            "[lexera.filesync.save] {:?} does not hold the written content after {} reads",
            self.inner.path.absolute(),
            VERIFY_ATTEMPTS
        );
        Err(SyncError::Verification {
            path: self.inner.path.absolute().to_path_buf(),
            attempts: VERIFY_ATTEMPTS,
        })
    }

    async fn commit_save(&self, written: &str) {
        let stat = self.stat_disk().await;
        self.with_state(|s| {
            s.baseline = written.to_string();
            s.has_baseline = true;
            s.has_file_system_changes = false;
            s.exists = true;
            s.last_access_error = None;
            s.preserve_raw_content = false;
            s.observe(stat);
        });
        log::info!(
            "[lexera.filesync.save] Saved {:?}",
            self.inner.path.absolute()
        );
        self.emit(ChangeType::Saved);
    }

    async fn recover_failed_save(
        &self,
        err: SyncError,
        snapshot: SaveSnapshot,
        existed: bool,
        marker: Option<MarkerId>,
    ) -> Result<(), SyncError> {
        let path = self.inner.path.absolute().to_path_buf();
        let snapshot = self
            .inner
            .ctx
            .transactions
            .rollback(&path)
            .unwrap_or(snapshot);
        self.with_state(|s| s.restore(&snapshot));

        let attempted = snapshot.content;
        let outcome = self.reconcile(&attempted, &snapshot.baseline, existed).await;
        match outcome {
            ReconcileOutcome::Saved => {
                log::warn!(
                    "[lexera.filesync.save] {:?}: {}, but disk holds the written content; committing",
                    path,
                    err
                );
                self.commit_save(&attempted).await;
                return Ok(());
            }
            ReconcileOutcome::Diverged => {
                log::warn!(
                    "[lexera.filesync.save] {:?} diverged from both baseline and attempted save",
                    path
                );
                self.mark_external_change(false);
            }
            ReconcileOutcome::Unchanged | ReconcileOutcome::Unknown => {}
        }

        if let Some(id) = marker {
            self.ledger().remove(id);
        }

        let backup = self.write_emergency_backup(&attempted).await;
        Err(SyncError::SaveFailed {
            path,
            reason: Box::new(err),
            reconciliation: outcome,
            backup,
        })
    }

    async fn reconcile(&self, attempted: &str, baseline: &str, existed: bool) -> ReconcileOutcome {
        match self.read_disk().await {
            Ok(Some(disk)) if same_content(&disk, attempted) => ReconcileOutcome::Saved,
            Ok(Some(disk)) if existed && same_content(&disk, baseline) => {
                ReconcileOutcome::Unchanged
            }
            Ok(Some(_)) => ReconcileOutcome::Diverged,
            Ok(None) if existed => ReconcileOutcome::Diverged,
            Ok(None) => ReconcileOutcome::Unchanged,
            Err(e) => {
                self.note_access_error(&e);
                ReconcileOutcome::Unknown
            }
        }
    }

    async fn write_emergency_backup(&self, content: &str) -> BackupOutcome {
        let facility = Arc::clone(&self.inner.ctx.backups);
        let emergency_dir = self.inner.ctx.emergency_dir.clone();
        let path = self.inner.path.absolute().to_path_buf();
        let content = content.to_string();
        tokio::task::spawn_blocking(move || {
            emergency_backup(facility.as_ref(), &emergency_dir, &path, &content)
        })
        .await
        .unwrap_or_else(|e| BackupOutcome::Failed {
            managed: e.to_string(),
            temporary: "not attempted".to_string(),
        })
    }
}
