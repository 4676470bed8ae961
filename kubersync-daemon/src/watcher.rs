//! Local filesystem change notifications.
//!
//! Events are pure triggers: the reported paths are not trusted to be
//! complete or accurate, so every notification leads to a full re-walk.

use std::fs;
use std::path::{Path, PathBuf};

use notify::event::{AccessKind, AccessMode};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::error::DaemonError;

/// "Something changed under the root."
#[derive(Debug, Clone)]
pub struct LocalChange {
    pub kind: EventKind,
    pub paths: Vec<PathBuf>,
}

/// Recursive subscription on the mirrored directory.
pub struct LocalWatch {
    watcher: RecommendedWatcher,
    root: PathBuf,
}

impl LocalWatch {
    pub fn subscribe(
        root: &Path,
    ) -> Result<(Self, mpsc::UnboundedReceiver<LocalChange>), DaemonError> {
        // Canonicalize so backends that report real paths (FSEvents on macOS)
        // agree with the root we unwatch later.
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

        let (change_tx, change_rx) = mpsc::unbounded_channel();
        let mut watcher = recommended_watcher(move |event: notify::Result<Event>| match event {
            Ok(event) if is_relevant_event_kind(&event.kind) => {
                let _ = change_tx.send(LocalChange {
                    kind: event.kind,
                    paths: event.paths,
                });
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "watcher event error"),
        })?;
        watcher.watch(&root, RecursiveMode::Recursive)?;
        tracing::debug!(path = %root.display(), "watching local directory");

        Ok((Self { watcher, root }, change_rx))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn unsubscribe(mut self) -> Result<(), DaemonError> {
        self.watcher.unwatch(&self.root)?;
        tracing::debug!(path = %self.root.display(), "stopped watching local directory");
        Ok(())
    }
}

/// Reads do not change the tree; everything else (including close-after-write)
/// may have.
fn is_relevant_event_kind(kind: &EventKind) -> bool {
    match kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => true,
        EventKind::Access(_) => false,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn reads_are_not_relevant() {
        assert!(!is_relevant_event_kind(&EventKind::Access(AccessKind::Read)));
        assert!(!is_relevant_event_kind(&EventKind::Access(AccessKind::Close(
            AccessMode::Read
        ))));
    }

    #[test]
    fn mutations_are_relevant() {
        assert!(is_relevant_event_kind(&EventKind::Create(CreateKind::File)));
        assert!(is_relevant_event_kind(&EventKind::Modify(ModifyKind::Any)));
        assert!(is_relevant_event_kind(&EventKind::Remove(RemoveKind::File)));
        assert!(is_relevant_event_kind(&EventKind::Access(AccessKind::Close(
            AccessMode::Write
        ))));
    }

    #[tokio::test]
    async fn file_write_under_root_is_delivered() {
        let root = TempDir::new().unwrap();
        let (watch, mut changes) = LocalWatch::subscribe(root.path()).expect("subscribe");
        assert_eq!(watch.root(), fs::canonicalize(root.path()).unwrap());

        fs::create_dir_all(root.path().join("nested")).unwrap();
        fs::write(root.path().join("nested").join("file"), "x").unwrap();

        let change = tokio::time::timeout(Duration::from_secs(5), changes.recv())
            .await
            .expect("change within timeout")
            .expect("channel open");
        assert!(!change.paths.is_empty());

        watch.unsubscribe().expect("unsubscribe");
    }
}
