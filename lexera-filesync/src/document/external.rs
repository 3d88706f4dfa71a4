/// Watcher event handling: self-save absorption and external changes.
use std::time::Duration;

use super::{lock, DocumentKind, TrackedDocument};
use crate::events::ChangeType;
use crate::fingerprint::ContentFingerprint;
use crate::watcher::types::FileChangeKind;

const SELF_SAVE_MATCH_ATTEMPTS: u32 = 3;
const SELF_SAVE_MATCH_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeDisposition {
    /// The event was our own write; nothing changed.
    Absorbed,
    /// Marked as an external change.
    External,
    /// The document is disposed.
    Ignored,
}

impl<K: DocumentKind> TrackedDocument<K> {
    /// React to a raw watcher notification for this document's path.
    /// Never fails: read errors during matching are logged and retried.
    pub async fn handle_file_change(&self, kind: FileChangeKind) -> ChangeDisposition {
        if self.is_disposed() {
            return ChangeDisposition::Ignored;
        }

        // A remove event can belong to an atomic replace; only a file that
        // is really gone counts as deleted.
        let gone = kind == FileChangeKind::Deleted && self.stat_disk().await.is_none();
        if gone {
            self.with_state(|s| {
                s.exists = false;
                s.observe(None);
            });
        } else if self.matches_self_save().await {
            log::debug!(
                "[lexera.filesync.watch] Absorbed own write to {:?}",
                self.inner.path.absolute()
            );
            return ChangeDisposition::Absorbed;
        }

        if self.is_disposed() {
            return ChangeDisposition::Ignored;
        }
        log::info!(
            "[lexera.filesync.watch] External change ({:?}) to {:?}",
            kind,
            self.inner.path.absolute()
        );
        self.mark_external_change(true);
        ChangeDisposition::External
    }

    /// Read the file (retrying while a write may still be settling) and try
    /// to consume a matching self-save marker.
    async fn matches_self_save(&self) -> bool {
        if !self.ledger().has_pending() {
            return false;
        }

        for attempt in 1..=SELF_SAVE_MATCH_ATTEMPTS {
            match self.read_disk().await {
                Ok(Some(disk)) => {
                    let fingerprint = ContentFingerprint::from_content(&disk);
                    if self.ledger().consume_match(&fingerprint).is_some() {
                        return true;
                    }
                }
                Ok(None) => {}
                Err(e) => log::debug!(
                    "[lexera.filesync.watch] Self-save check read {} of {:?} failed: {}",
                    attempt,
                    self.inner.path.absolute(),
                    e
                ),
            }
            if attempt < SELF_SAVE_MATCH_ATTEMPTS {
                tokio::time::sleep(SELF_SAVE_MATCH_DELAY).await;
            }
        }
        false
    }

    /// Raise `has_file_system_changes` and notify subscribers. With
    /// `stop_editing`, an open edit session is closed first and its value
    /// folded into the baseline so it is not lost.
    pub(super) fn mark_external_change(&self, stop_editing: bool) {
        let session = if stop_editing && self.is_in_edit_mode() {
            lock(&self.inner.edit_session).clone()
        } else {
            None
        };
        // Called without any lock held: the session may call back in.
        let captured = session.and_then(|s| s.request_stop_editing());

        let impact = self.inner.kind.handle_external_change(&self.inner.path);
        let kind = &self.inner.kind;
        let conflict = self.with_state(|s| {
            if let Some(captured) = captured {
                s.baseline = kind.apply_captured_edit(&s.baseline, captured);
            }
            s.has_file_system_changes = true;
            s.has_conflict()
        });

        self.emit_change(self.change(ChangeType::External).with_impact(impact));
        if conflict {
            log::warn!(
                "[lexera.filesync.watch] Conflict on {:?}: local changes and external change",
                self.inner.path.absolute()
            );
            self.emit(ChangeType::Conflict);
        }
    }
}
