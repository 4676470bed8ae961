//! Mirroring daemon: cluster client, local watcher and the task runtime
//! that feeds both into the reconciliation engine.

mod error;
mod runtime;
pub mod secrets;
pub mod watcher;

pub use error::DaemonError;
pub use runtime::{run, run_with, start_blocking, DaemonConfig, DEFAULT_RESYNC_PERIOD};
pub use secrets::{connect, ClientSettings, KubeSecrets};
pub use watcher::{LocalChange, LocalWatch};
