//! Error types for kubersync-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise while reading or mutating the local tree.
#[derive(Debug, Error)]
pub enum TreeError {
    /// An I/O error, with annotated path for context.
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A remote entry key that cannot be mapped to a path under the root.
    #[error("invalid entry key '{key}': {reason}")]
    InvalidKey { key: String, reason: &'static str },

    /// A walked path that does not live under the mirrored root.
    #[error("path {path} is outside the mirrored root")]
    OutsideRoot { path: PathBuf },

    /// A local file whose relative path cannot be used as an entry key.
    #[error("path is not valid UTF-8: {path}")]
    NonUtf8Path { path: PathBuf },
}

/// Convenience constructor for [`TreeError::Io`].
pub fn io_err(path: impl Into<PathBuf>, source: std::io::Error) -> TreeError {
    TreeError::Io {
        path: path.into(),
        source,
    }
}
