use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use kubersync_core::{ObjectRef, TreeError};

/// Error surface for the daemon runtime, watchers and cluster client.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("notify error: {0}")]
    Notify(#[from] notify::Error),

    #[error("sync error: {0}")]
    Sync(#[from] kubersync_sync::SyncError),

    #[error("local tree error: {0}")]
    Tree(#[from] TreeError),

    #[error("kubernetes client error: {0}")]
    Kube(#[from] kube::Error),

    #[error("cannot create kubernetes config: {0}")]
    KubeConfig(String),

    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    #[error("timed out after {waited:?} waiting for caches to sync")]
    SyncTimeout { waited: Duration },

    #[error("tracked secret {target} was deleted; stopped mirroring")]
    RemoteDeleted { target: ObjectRef },

    #[error("{task} task join failure: {reason}")]
    Join { task: &'static str, reason: String },
}

pub(crate) fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> DaemonError {
    DaemonError::Io {
        path: path.into(),
        source,
    }
}
