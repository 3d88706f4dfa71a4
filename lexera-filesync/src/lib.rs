/// Per-document file synchronization for Lexera boards: tracked documents,
/// the save and reload pipelines, self-save detection and shared watches.
pub mod access;
pub mod backup;
pub mod config;
pub mod context;
pub mod document;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod include;
pub mod session;
pub mod storage;
pub mod transaction;
pub mod watcher;

pub use context::SyncContext;
pub use document::kinds::{IncludeDocument, MainDocument};
pub use document::{DocumentKind, SaveOptions, TrackedDocument};
pub use error::SyncError;
pub use events::{ChangeType, DocumentChange};
pub use session::BoardSession;
