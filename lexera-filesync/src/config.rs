/// Shared configuration types for the sync engine and its hosts.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A board entry in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardEntry {
    pub file: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// Engine settings. Retry bounds and the self-save TTL are constants and
/// deliberately not part of this.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default = "default_watch")]
    pub watch: bool,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    /// Managed backups go here; hidden sibling files when unset.
    #[serde(default)]
    pub backup_dir: Option<PathBuf>,
    /// Last-resort backups; `<temp>/lexera-emergency` when unset.
    #[serde(default)]
    pub emergency_dir: Option<PathBuf>,
}

fn default_watch() -> bool {
    true
}

fn default_debounce_ms() -> u64 {
    500
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            watch: default_watch(),
            debounce_ms: default_debounce_ms(),
            backup_dir: None,
            emergency_dir: None,
        }
    }
}

impl SyncSettings {
    pub fn emergency_dir(&self) -> PathBuf {
        self.emergency_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("lexera-emergency"))
    }
}
