/// Change events emitted by tracked documents.
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeType {
    /// In-memory content changed.
    Content,
    /// The file changed on disk for a reason other than our own write.
    External,
    Saved,
    Reloaded,
    /// Local changes now coexist with an external change.
    Conflict,
}

/// How far an external change reaches into derived board state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExternalImpact {
    /// Board structure (columns, include list) must be re-derived.
    Structural,
    /// Only the cards of the column that includes this fragment.
    Fragment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentChange {
    #[serde(serialize_with = "serialize_path", deserialize_with = "deserialize_path")]
    pub path: PathBuf,
    /// Display path, original casing.
    pub relative_path: String,
    pub change_type: ChangeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<ExternalImpact>,
    pub timestamp_ms: i64,
}

impl DocumentChange {
    pub fn new(path: PathBuf, relative_path: String, change_type: ChangeType) -> Self {
        Self {
            path,
            relative_path,
            change_type,
            impact: None,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_impact(mut self, impact: ExternalImpact) -> Self {
        self.impact = Some(impact);
        self
    }
}

fn serialize_path<S: serde::Serializer>(path: &PathBuf, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&path.to_string_lossy())
}

fn deserialize_path<'de, D: serde::Deserializer<'de>>(d: D) -> Result<PathBuf, D::Error> {
    let s = String::deserialize(d)?;
    Ok(PathBuf::from(s))
}
