//! # kubersync-sync
//!
//! Bidirectional reconciliation between one remote object and one local
//! directory.
//!
//! [`Engine`] owns the merge gate and runs the two directional passes:
//! [`Engine::on_remote_event`] mirrors remote entries onto disk and
//! [`Engine::on_local_change`] pushes the local tree back to the remote
//! object through a [`RemoteStore`].

pub mod engine;
pub mod error;
pub mod memory;
pub mod remote;
pub mod writer;

pub use engine::{
    Engine, EngineStats, EventOutcome, Phase, PushOutcome, RemoteApplyReport, StopReason,
};
pub use error::{RemoteError, SyncError};
pub use memory::MemoryRemote;
pub use remote::{RemoteEvent, RemoteFeed, RemoteStore};
pub use writer::WriteResult;
