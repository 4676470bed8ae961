//! The remote-object seam the engine writes through.

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use kubersync_core::{Entries, ObjectRef, RemoteObject};

use crate::error::RemoteError;

/// Change notification for a watched remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEvent {
    Created(RemoteObject),
    Updated { old: RemoteObject, new: RemoteObject },
    Deleted(RemoteObject),
}

impl RemoteEvent {
    /// The object the event is about (the new state for updates).
    pub fn object(&self) -> &RemoteObject {
        match self {
            RemoteEvent::Created(obj) | RemoteEvent::Deleted(obj) => obj,
            RemoteEvent::Updated { new, .. } => new,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            RemoteEvent::Created(_) => "created",
            RemoteEvent::Updated { .. } => "updated",
            RemoteEvent::Deleted(_) => "deleted",
        }
    }
}

/// Read/replace access to the remote key/value object.
///
/// `get` answers from the client-side cache kept current by the watch; it
/// never blocks on the network. `replace` overwrites the whole mapping.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn get(&self, target: &ObjectRef) -> Option<Entries>;

    async fn replace(&self, target: &ObjectRef, entries: Entries) -> Result<(), RemoteError>;
}

/// Inbound side of a remote watch: change events plus the one-shot
/// "initial replay complete" signal.
pub struct RemoteFeed {
    pub events: mpsc::UnboundedReceiver<RemoteEvent>,
    pub synced: watch::Receiver<bool>,
}
