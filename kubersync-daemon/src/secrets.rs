//! Kubernetes secret backend for the remote mirror.
//!
//! A [`KubeSecrets`] watches the tracked secret, keeps full `Secret` objects
//! in a client-side cache, and turns watch traffic into [`RemoteEvent`]s:
//!
//! - during a (re)list every object is reported as created or updated;
//! - objects missing from a completed re-list are reported as deleted;
//! - the first completed list flips the "synced" signal;
//! - every `resync_period` each cached object is re-delivered as an update.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, Config, ResourceExt};
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tokio::task::JoinHandle;

use kubersync_core::{Entries, ObjectRef, RemoteObject};
use kubersync_sync::{RemoteError, RemoteEvent, RemoteFeed, RemoteStore};

use crate::error::DaemonError;

/// How to reach the cluster.
#[derive(Debug, Clone, Default)]
pub struct ClientSettings {
    /// Explicit kubeconfig file; otherwise the usual inference applies
    /// (`$KUBECONFIG`, `~/.kube/config`, then in-cluster service account).
    pub kubeconfig: Option<PathBuf>,
    /// Overrides the API server URL from the kubeconfig.
    pub master: Option<String>,
}

/// Build a kube client from [`ClientSettings`].
pub async fn connect(settings: &ClientSettings) -> Result<Client, DaemonError> {
    let mut config = match &settings.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|err| {
                DaemonError::KubeConfig(format!("cannot read {}: {err}", path.display()))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|err| DaemonError::KubeConfig(err.to_string()))?
        }
        None => Config::infer()
            .await
            .map_err(|err| DaemonError::KubeConfig(err.to_string()))?,
    };
    if let Some(master) = &settings.master {
        config.cluster_url = master
            .parse()
            .map_err(|err| DaemonError::KubeConfig(format!("invalid master url {master}: {err}")))?;
    }
    Ok(Client::try_from(config)?)
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

pub(crate) fn object_ref(secret: &Secret) -> ObjectRef {
    ObjectRef::new(secret.namespace().unwrap_or_default(), secret.name_any())
}

pub(crate) fn entries_of(secret: &Secret) -> Entries {
    secret
        .data
        .as_ref()
        .map(|data| {
            data.iter()
                .map(|(key, value)| (key.clone(), value.0.clone()))
                .collect()
        })
        .unwrap_or_default()
}

fn remote_object(secret: &Secret) -> RemoteObject {
    RemoteObject::new(object_ref(secret), entries_of(secret))
}

/// Client-side store of watched secrets plus re-list bookkeeping.
#[derive(Default)]
pub(crate) struct SecretCache {
    objects: HashMap<ObjectRef, Secret>,
    relisting: Option<HashSet<ObjectRef>>,
    synced: bool,
}

impl SecretCache {
    /// Fold one watch event into the cache.
    ///
    /// Returns the resulting change notifications and whether this event
    /// completed the very first list.
    pub(crate) fn apply(&mut self, event: watcher::Event<Secret>) -> (Vec<RemoteEvent>, bool) {
        match event {
            watcher::Event::Init => {
                self.relisting = Some(HashSet::new());
                (Vec::new(), false)
            }
            watcher::Event::InitApply(secret) => {
                let key = object_ref(&secret);
                if let Some(seen) = self.relisting.as_mut() {
                    seen.insert(key);
                }
                (vec![self.upsert(secret)], false)
            }
            watcher::Event::InitDone => {
                let mut events = Vec::new();
                if let Some(seen) = self.relisting.take() {
                    let mut gone: Vec<ObjectRef> = self
                        .objects
                        .keys()
                        .filter(|key| !seen.contains(*key))
                        .cloned()
                        .collect();
                    gone.sort_by_key(|key| key.to_string());
                    for key in gone {
                        if let Some(secret) = self.objects.remove(&key) {
                            events.push(RemoteEvent::Deleted(remote_object(&secret)));
                        }
                    }
                }
                let first = !self.synced;
                self.synced = true;
                (events, first)
            }
            watcher::Event::Apply(secret) => (vec![self.upsert(secret)], false),
            watcher::Event::Delete(secret) => {
                let key = object_ref(&secret);
                let removed = self.objects.remove(&key).unwrap_or(secret);
                (vec![RemoteEvent::Deleted(remote_object(&removed))], false)
            }
        }
    }

    fn upsert(&mut self, secret: Secret) -> RemoteEvent {
        let new = remote_object(&secret);
        match self.objects.insert(new.target.clone(), secret) {
            Some(old) => RemoteEvent::Updated {
                old: remote_object(&old),
                new,
            },
            None => RemoteEvent::Created(new),
        }
    }

    /// Periodic re-delivery of everything cached, as no-change updates.
    pub(crate) fn resync_events(&self) -> Vec<RemoteEvent> {
        let mut objects: Vec<RemoteObject> = self.objects.values().map(remote_object).collect();
        objects.sort_by_key(|obj| obj.target.to_string());
        objects
            .into_iter()
            .map(|obj| RemoteEvent::Updated {
                old: obj.clone(),
                new: obj,
            })
            .collect()
    }

    pub(crate) fn get(&self, target: &ObjectRef) -> Option<&Secret> {
        self.objects.get(target)
    }

    /// Store the server's answer to our own write.
    pub(crate) fn record_replaced(&mut self, secret: Secret) {
        self.objects.insert(object_ref(&secret), secret);
    }
}

// ---------------------------------------------------------------------------
// KubeSecrets
// ---------------------------------------------------------------------------

/// Watched, cached access to one secret through the Kubernetes API.
pub struct KubeSecrets {
    client: Client,
    api: Api<Secret>,
    target: ObjectRef,
    cache: Arc<RwLock<SecretCache>>,
}

impl KubeSecrets {
    pub fn new(client: Client, target: ObjectRef) -> Self {
        let api = Api::namespaced(client.clone(), &target.namespace);
        Self {
            client,
            api,
            target,
            cache: Arc::new(RwLock::new(SecretCache::default())),
        }
    }

    /// Start watching the tracked secret.
    ///
    /// The task runs until `shutdown` fires. Watch errors are logged and the
    /// stream is retried with the default backoff.
    pub fn spawn_watch(
        &self,
        resync_period: Option<Duration>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> (RemoteFeed, JoinHandle<()>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (synced_tx, synced_rx) = watch::channel(false);

        let config = watcher::Config::default().fields(&format!("metadata.name={}", self.target.name));
        let mut stream = watcher(self.api.clone(), config).default_backoff().boxed();
        let cache = self.cache.clone();
        let target = self.target.clone();

        let handle = tokio::spawn(async move {
            let mut resync = resync_period.map(|period| {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                interval
            });

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tick(&mut resync) => {
                        let events = cache.read().await.resync_events();
                        tracing::debug!(object = %target, count = events.len(), "resync");
                        if !forward(&events_tx, events) {
                            break;
                        }
                    }
                    next = stream.next() => {
                        let Some(next) = next else { break };
                        let event = match next {
                            Ok(event) => event,
                            Err(err) => {
                                tracing::warn!(object = %target, error = %err, "secret watch error");
                                continue;
                            }
                        };
                        let (events, synced_now) = cache.write().await.apply(event);
                        if !forward(&events_tx, events) {
                            break;
                        }
                        if synced_now {
                            tracing::debug!(object = %target, "secret cache synced");
                            synced_tx.send_replace(true);
                        }
                    }
                }
            }
        });

        let feed = RemoteFeed {
            events: events_rx,
            synced: synced_rx,
        };
        (feed, handle)
    }
}

async fn tick(interval: &mut Option<tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn forward(tx: &mpsc::UnboundedSender<RemoteEvent>, events: Vec<RemoteEvent>) -> bool {
    events.into_iter().all(|event| tx.send(event).is_ok())
}

#[async_trait]
impl RemoteStore for KubeSecrets {
    async fn get(&self, target: &ObjectRef) -> Option<Entries> {
        self.cache.read().await.get(target).map(entries_of)
    }

    async fn replace(&self, target: &ObjectRef, entries: Entries) -> Result<(), RemoteError> {
        let cached = self.cache.read().await.get(target).cloned();
        let Some(mut secret) = cached else {
            return Err(RemoteError::NotFound {
                target: target.clone(),
            });
        };
        secret.data = Some(
            entries
                .into_iter()
                .map(|(key, value)| (key, ByteString(value)))
                .collect(),
        );
        secret.string_data = None;

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &target.namespace);
        let updated = api
            .replace(&target.name, &PostParams::default(), &secret)
            .await
            .map_err(|err| RemoteError::Backend(Box::new(err)))?;
        self.cache.write().await.record_replaced(updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn secret(name: &str, pairs: &[(&str, &str)]) -> Secret {
        let data: BTreeMap<String, ByteString> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect();
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        }
    }

    #[test]
    fn initial_list_reports_created_and_signals_once() {
        let mut cache = SecretCache::default();
        let (events, synced) = cache.apply(watcher::Event::Init);
        assert!(events.is_empty() && !synced);

        let (events, synced) = cache.apply(watcher::Event::InitApply(secret("app", &[("a", "1")])));
        assert!(matches!(events.as_slice(), [RemoteEvent::Created(_)]));
        assert!(!synced);

        let (events, synced) = cache.apply(watcher::Event::InitDone);
        assert!(events.is_empty());
        assert!(synced, "first completed list must flip the signal");

        cache.apply(watcher::Event::Init);
        let (_, synced) = cache.apply(watcher::Event::InitDone);
        assert!(!synced, "later re-lists must not signal again");
    }

    #[test]
    fn relist_reports_vanished_objects_as_deleted() {
        let mut cache = SecretCache::default();
        cache.apply(watcher::Event::Init);
        cache.apply(watcher::Event::InitApply(secret("app", &[("a", "1")])));
        cache.apply(watcher::Event::InitDone);

        cache.apply(watcher::Event::Init);
        let (events, _) = cache.apply(watcher::Event::InitDone);
        match events.as_slice() {
            [RemoteEvent::Deleted(obj)] => assert_eq!(obj.target, ObjectRef::new("default", "app")),
            other => panic!("expected one deletion, got {other:?}"),
        }
        assert!(cache.get(&ObjectRef::new("default", "app")).is_none());
    }

    #[test]
    fn apply_on_cached_object_reports_old_and_new() {
        let mut cache = SecretCache::default();
        cache.apply(watcher::Event::Apply(secret("app", &[("a", "1")])));
        let (events, _) = cache.apply(watcher::Event::Apply(secret("app", &[("a", "2")])));
        match events.as_slice() {
            [RemoteEvent::Updated { old, new }] => {
                assert_eq!(old.entries.get("a").map(Vec::as_slice), Some(&b"1"[..]));
                assert_eq!(new.entries.get("a").map(Vec::as_slice), Some(&b"2"[..]));
            }
            other => panic!("expected one update, got {other:?}"),
        }
    }

    #[test]
    fn delete_removes_from_cache() {
        let mut cache = SecretCache::default();
        cache.apply(watcher::Event::Apply(secret("app", &[("a", "1")])));
        let (events, _) = cache.apply(watcher::Event::Delete(secret("app", &[])));
        match events.as_slice() {
            // The cached copy is reported, not the tombstone.
            [RemoteEvent::Deleted(obj)] => assert_eq!(obj.entries.len(), 1),
            other => panic!("expected one deletion, got {other:?}"),
        }
        assert!(cache.get(&ObjectRef::new("default", "app")).is_none());
    }

    #[test]
    fn resync_redelivers_cached_objects_unchanged() {
        let mut cache = SecretCache::default();
        cache.apply(watcher::Event::Apply(secret("app", &[("a", "1")])));
        match cache.resync_events().as_slice() {
            [RemoteEvent::Updated { old, new }] => assert_eq!(old, new),
            other => panic!("expected one update, got {other:?}"),
        }
    }

    #[test]
    fn secret_without_data_has_no_entries() {
        let mut empty = secret("app", &[]);
        empty.data = None;
        assert!(entries_of(&empty).is_empty());
    }
}
