/// Configuration for the sync daemon.
/// Reads filesync.json from ~/.config/lexera/filesync.json (or platform equivalent).

use lexera_filesync::config::{BoardEntry, SyncSettings};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub boards: Vec<BoardEntry>,
    #[serde(default)]
    pub sync: SyncSettings,
}

/// Default config path: ~/.config/lexera/filesync.json
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lexera")
        .join("filesync.json")
}

/// Load config from path. Returns default if file doesn't exist.
pub fn load_config(path: &Path) -> DaemonConfig {
    match fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
            log::warn!("Failed to parse config {}: {}", path.display(), e);
            DaemonConfig::default()
        }),
        Err(_) => {
            log::info!("No config at {}, using defaults", path.display());
            DaemonConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(&dir.path().join("absent.json"));
        assert!(config.boards.is_empty());
        assert!(config.sync.watch);
    }

    #[test]
    fn test_load_boards_and_sync_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filesync.json");
        fs::write(
            &path,
            r#"{
                "boards": [{"file": "/boards/work.md", "name": "Work"}],
                "sync": {"debounceMs": 250, "watch": false}
            }"#,
        )
        .unwrap();

        let config = load_config(&path);
        assert_eq!(config.boards.len(), 1);
        assert_eq!(config.boards[0].name.as_deref(), Some("Work"));
        assert_eq!(config.sync.debounce_ms, 250);
        assert!(!config.sync.watch);
    }

    #[test]
    fn test_malformed_config_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filesync.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(load_config(&path).boards.is_empty());
    }
}
