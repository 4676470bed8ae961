//! In-process [`RemoteStore`] with watch semantics.
//!
//! Behaves like a watched cluster object: every mutation, including the
//! engine's own `replace`, is echoed as a [`RemoteEvent`] on the feed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use kubersync_core::{Entries, ObjectRef, RemoteObject};

use crate::error::RemoteError;
use crate::remote::{RemoteEvent, RemoteFeed, RemoteStore};

pub struct MemoryRemote {
    objects: Mutex<HashMap<ObjectRef, Entries>>,
    events: mpsc::UnboundedSender<RemoteEvent>,
    synced: watch::Sender<bool>,
    replaces: AtomicUsize,
    fail_replace: AtomicBool,
}

impl MemoryRemote {
    pub fn new() -> (Self, RemoteFeed) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (synced_tx, synced_rx) = watch::channel(false);
        let remote = Self {
            objects: Mutex::new(HashMap::new()),
            events: events_tx,
            synced: synced_tx,
            replaces: AtomicUsize::new(0),
            fail_replace: AtomicBool::new(false),
        };
        let feed = RemoteFeed {
            events: events_rx,
            synced: synced_rx,
        };
        (remote, feed)
    }

    /// Create or overwrite an object, emitting `Created` or `Updated`.
    pub async fn insert(&self, target: ObjectRef, entries: Entries) {
        let mut objects = self.objects.lock().await;
        let new = RemoteObject::new(target.clone(), entries.clone());
        let event = match objects.insert(target.clone(), entries) {
            Some(old) => RemoteEvent::Updated {
                old: RemoteObject::new(target, old),
                new,
            },
            None => RemoteEvent::Created(new),
        };
        let _ = self.events.send(event);
    }

    /// Remove an object, emitting `Deleted` if it existed.
    pub async fn delete(&self, target: &ObjectRef) {
        let mut objects = self.objects.lock().await;
        if let Some(entries) = objects.remove(target) {
            let _ = self
                .events
                .send(RemoteEvent::Deleted(RemoteObject::new(target.clone(), entries)));
        }
    }

    /// Flip the initial-replay signal.
    pub fn mark_synced(&self) {
        self.synced.send_replace(true);
    }

    /// Number of successful `replace` calls so far.
    pub fn replace_count(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }

    /// Make subsequent `replace` calls fail until reset.
    pub fn fail_replaces(&self, fail: bool) {
        self.fail_replace.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn get(&self, target: &ObjectRef) -> Option<Entries> {
        self.objects.lock().await.get(target).cloned()
    }

    async fn replace(&self, target: &ObjectRef, entries: Entries) -> Result<(), RemoteError> {
        if self.fail_replace.load(Ordering::SeqCst) {
            return Err(RemoteError::Backend("replace rejected".into()));
        }
        let mut objects = self.objects.lock().await;
        let Some(old) = objects.get(target).cloned() else {
            return Err(RemoteError::NotFound {
                target: target.clone(),
            });
        };
        objects.insert(target.clone(), entries.clone());
        self.replaces.fetch_add(1, Ordering::SeqCst);
        let _ = self.events.send(RemoteEvent::Updated {
            old: RemoteObject::new(target.clone(), old),
            new: RemoteObject::new(target.clone(), entries),
        });
        Ok(())
    }
}
