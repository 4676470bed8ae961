//! Error types for kubersync-sync.

use thiserror::Error;

use kubersync_core::{ObjectRef, TreeError};

/// Failures reported by a [`crate::RemoteStore`] implementation.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The object is not (or no longer) present in the client cache.
    #[error("remote object {target} not found")]
    NotFound { target: ObjectRef },

    /// The backend rejected or failed the request.
    #[error("remote backend error: {0}")]
    Backend(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// All errors that can abort a reconciliation pass.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Walking, reading, writing or deleting under the local root failed.
    #[error("local tree error: {0}")]
    Tree(#[from] TreeError),

    /// Writing the merged state back to the remote object failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A blocking tree task panicked or was cancelled.
    #[error("{0}")]
    Join(String),
}
