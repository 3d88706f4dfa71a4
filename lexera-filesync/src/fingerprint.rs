/// Content fingerprints and the per-document self-save ledger.
///
/// Before a save that should not look like an external change, the document
/// registers the fingerprint of the content it is about to write.
/// On a watcher event the document reads the file, fingerprints it and asks
/// the ledger for a match. A match consumes the marker (our own write); no
/// match means somebody else touched the file.
/// Markers live for 10s and are pruned lazily on every access.
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

pub const SELF_SAVE_TTL: Duration = Duration::from_secs(10);

/// Normalize line endings to `\n` (CRLF and lone CR).
pub fn normalize_newlines(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\r', "\n")
}

/// Compare two texts after newline normalization.
pub fn same_content(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    normalize_newlines(a) == normalize_newlines(b)
}

/// SHA-256 of newline-normalized content plus its normalized byte length.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentFingerprint {
    pub hash: String,
    pub length: usize,
}

impl ContentFingerprint {
    pub fn from_content(content: &str) -> Self {
        let normalized = normalize_newlines(content);
        let mut hasher = Sha256::new();
        hasher.update(normalized.as_bytes());
        Self {
            hash: hex::encode(hasher.finalize()),
            length: normalized.len(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MarkerId(u64);

#[derive(Debug, Clone)]
pub struct SelfSaveMarker {
    pub id: MarkerId,
    pub fingerprint: ContentFingerprint,
    pub expires_at: Instant,
}

/// Ordered list of pending self-save markers for one document.
#[derive(Debug, Default)]
pub struct SelfSaveLedger {
    markers: Vec<SelfSaveMarker>,
    next_id: u64,
}

impl SelfSaveLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the content we are about to write. Returns the marker id so a
    /// failed write can withdraw it.
    pub fn register(&mut self, content: &str) -> MarkerId {
        self.prune();
        self.next_id += 1;
        let id = MarkerId(self.next_id);
        self.markers.push(SelfSaveMarker {
            id,
            fingerprint: ContentFingerprint::from_content(content),
            expires_at: Instant::now() + SELF_SAVE_TTL,
        });
        id
    }

    /// Consume the first live marker matching `fingerprint`.
    pub fn consume_match(&mut self, fingerprint: &ContentFingerprint) -> Option<MarkerId> {
        self.prune();
        let pos = self
            .markers
            .iter()
            .position(|m| &m.fingerprint == fingerprint)?;
        Some(self.markers.remove(pos).id)
    }

    /// Withdraw a marker whose write never landed.
    pub fn remove(&mut self, id: MarkerId) -> bool {
        self.prune();
        let before = self.markers.len();
        self.markers.retain(|m| m.id != id);
        self.markers.len() != before
    }

    pub fn has_pending(&mut self) -> bool {
        self.prune();
        !self.markers.is_empty()
    }

    pub fn pending_count(&mut self) -> usize {
        self.prune();
        self.markers.len()
    }

    pub fn clear(&mut self) {
        self.markers.clear();
    }

    fn prune(&mut self) {
        let now = Instant::now();
        self.markers.retain(|m| now <= m.expires_at);
    }
}
