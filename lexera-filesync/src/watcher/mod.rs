pub mod coordinator;
#[cfg(feature = "file-watcher")]
pub mod notify_backend;
pub mod registry;
pub mod types;
