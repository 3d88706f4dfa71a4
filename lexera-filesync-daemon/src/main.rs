/// Lexera filesync daemon: keeps the configured boards and their include
/// fragments in sync with the disk and logs every document change.
mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lexera_filesync::document::ReloadOutcome;
use lexera_filesync::{
    BoardSession, ChangeType, DocumentChange, DocumentKind, SyncContext, SyncError,
    TrackedDocument,
};
use tokio::sync::{broadcast, watch};

/// How often a fragment follower checks whether its document was dropped
/// from the board.
const DISPOSED_POLL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
enum DaemonError {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("Signal handling failed: {0}")]
    Signal(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Board,
    Fragment,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("[lexera.filesync.daemon] {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), DaemonError> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_config_path);
    let config = config::load_config(&config_path);

    let ctx = if config.sync.watch {
        SyncContext::with_file_watcher(&config.sync)?
    } else {
        SyncContext::manual(&config.sync)
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut sessions = Vec::new();
    for entry in &config.boards {
        let label = entry.name.as_deref().unwrap_or(&entry.file);
        match BoardSession::open(ctx.clone(), Path::new(&entry.file)).await {
            Ok(session) => {
                let session = Arc::new(session);
                if config.sync.watch {
                    if let Err(e) = session.start_watching() {
                        log::warn!(
                            "[lexera.filesync.daemon] Failed to watch board {}: {}",
                            label,
                            e
                        );
                    }
                }
                follow(
                    session.main().clone(),
                    Role::Board,
                    Arc::clone(&session),
                    shutdown_rx.clone(),
                );
                for include in session.includes() {
                    follow(include, Role::Fragment, Arc::clone(&session), shutdown_rx.clone());
                }
                log::info!("[lexera.filesync.daemon] Syncing board {}", label);
                sessions.push(session);
            }
            Err(e) => log::warn!(
                "[lexera.filesync.daemon] Failed to open board {}: {}",
                label,
                e
            ),
        }
    }
    if sessions.is_empty() {
        log::warn!(
            "[lexera.filesync.daemon] No boards configured in {}",
            config_path.display()
        );
    }

    tokio::signal::ctrl_c().await?;
    log::info!("[lexera.filesync.daemon] Shutdown signal received");
    let _ = shutdown_tx.send(true);
    for session in &sessions {
        let unsaved = session.unsaved_documents();
        if !unsaved.is_empty() {
            log::warn!(
                "[lexera.filesync.daemon] Discarding unsaved changes in {}",
                unsaved.join(", ")
            );
        }
        session.dispose();
    }
    Ok(())
}

/// Log every change of `doc` and reload it when it changed on disk while
/// clean. A reloaded board re-derives its include set.
fn follow<K: DocumentKind>(
    doc: TrackedDocument<K>,
    role: Role,
    session: Arc<BoardSession>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rx = doc.subscribe();
    tokio::spawn(async move {
        let mut poll = tokio::time::interval(DISPOSED_POLL);
        loop {
            tokio::select! {
                result = rx.recv() => match result {
                    Ok(change) => {
                        log_change(&change);
                        if change.change_type == ChangeType::External && doc.needs_reload() {
                            reload(&doc, role, &session, &shutdown).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("[lexera.filesync.daemon] Lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = poll.tick() => {
                    if doc.is_disposed() {
                        break;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
    });
}

async fn reload<K: DocumentKind>(
    doc: &TrackedDocument<K>,
    role: Role,
    session: &Arc<BoardSession>,
    shutdown: &watch::Receiver<bool>,
) {
    match doc.reload().await {
        Ok(ReloadOutcome::Reloaded) if role == Role::Board => match session.sync_includes().await {
            Ok(changes) => {
                for relative in &changes.added {
                    if let Some(include) = session.include(relative) {
                        follow(include, Role::Fragment, Arc::clone(session), shutdown.clone());
                    }
                }
                if !changes.is_empty() {
                    log::info!(
                        "[lexera.filesync.daemon] Includes of {}: +{:?} -{:?}",
                        doc.path().relative(),
                        changes.added,
                        changes.removed
                    );
                }
            }
            Err(e) => log::warn!(
                "[lexera.filesync.daemon] Failed to update includes of {}: {}",
                doc.path().relative(),
                e
            ),
        },
        Ok(outcome) => log::debug!(
            "[lexera.filesync.daemon] Reload of {}: {:?}",
            doc.path().relative(),
            outcome
        ),
        Err(e) => log::warn!(
            "[lexera.filesync.daemon] Failed to reload {}: {}",
            doc.path().relative(),
            e
        ),
    }
}

fn log_change(change: &DocumentChange) {
    match serde_json::to_string(change) {
        Ok(json) if change.change_type == ChangeType::Conflict => {
            log::warn!("[lexera.filesync.daemon] {}", json)
        }
        Ok(json) => log::info!("[lexera.filesync.daemon] {}", json),
        Err(e) => log::warn!("[lexera.filesync.daemon] Unserializable change: {}", e),
    }
}
