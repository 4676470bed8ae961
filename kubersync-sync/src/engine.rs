//! Reconciliation engine.
//!
//! Two directional passes converge the remote object and the local tree:
//!
//! - **remote → local** ([`Engine::apply_remote`]): write every remote entry
//!   to disk (skipping identical bytes), then delete local files the remote
//!   object no longer names. Deletion only happens once the initial sync has
//!   completed; before that the pass is a pure union.
//! - **local → remote** ([`Engine::on_local_change`]): snapshot the tree and
//!   overwrite the remote object with it, unless it is already deeply equal.
//!
//! Both passes run under one merge gate, so at most one pass executes at a
//! time. The gate also owns the "initial sync completed" flag.
//!
//! ```text
//! Uninitialized ──start_watching──▶ AwaitingInitialRemoteSync
//!        ──complete_initial_sync──▶ Steady ──(shutdown | remote deleted)──▶ Stopped
//! ```

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, Mutex};

use kubersync_core::{tree, Entries, ObjectRef};

use crate::error::SyncError;
use crate::remote::{RemoteEvent, RemoteStore};
use crate::writer::{self, WriteResult};

// ---------------------------------------------------------------------------
// Phase / outcomes
// ---------------------------------------------------------------------------

/// Why the engine stopped servicing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Process shutdown was requested.
    Shutdown,
    /// The tracked remote object was deleted.
    RemoteDeleted,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Shutdown => write!(f, "shutdown"),
            StopReason::RemoteDeleted => write!(f, "remote object deleted"),
        }
    }
}

/// Lifecycle of the engine as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Uninitialized,
    AwaitingInitialRemoteSync,
    Steady,
    Stopped(StopReason),
}

impl Phase {
    pub fn is_stopped(&self) -> bool {
        matches!(self, Phase::Stopped(_))
    }
}

/// Summary of one remote → local pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteApplyReport {
    pub written: usize,
    pub unchanged: usize,
    pub deleted: usize,
    /// Local-only files left in place because the initial sync is pending.
    pub deletions_deferred: usize,
}

/// Result of handing a remote event to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    /// Not the tracked object, or the engine has stopped.
    Ignored,
    Applied(RemoteApplyReport),
    /// The tracked object was deleted; the engine is now stopped.
    Stopped,
}

/// Result of one local → remote pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// The engine has stopped, or the initial sync already ran.
    Skipped,
    /// The remote object is not in the client cache.
    Missing,
    /// The local tree already equals the remote mapping.
    Unchanged,
    Replaced { entries: usize },
}

// ---------------------------------------------------------------------------
// Stats
// ---------------------------------------------------------------------------

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub remote_passes: usize,
    pub local_passes: usize,
    pub files_written: usize,
    pub files_deleted: usize,
    pub remote_replaces: usize,
    /// Highest number of passes ever observed inside the gate at once.
    pub peak_concurrent_passes: usize,
}

#[derive(Default)]
struct Counters {
    remote_passes: AtomicUsize,
    local_passes: AtomicUsize,
    files_written: AtomicUsize,
    files_deleted: AtomicUsize,
    remote_replaces: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Counters {
    fn enter(&self) -> PassGuard<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        PassGuard { counters: self }
    }

    fn bump(counter: &AtomicUsize, by: usize) {
        counter.fetch_add(by, Ordering::SeqCst);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            remote_passes: self.remote_passes.load(Ordering::SeqCst),
            local_passes: self.local_passes.load(Ordering::SeqCst),
            files_written: self.files_written.load(Ordering::SeqCst),
            files_deleted: self.files_deleted.load(Ordering::SeqCst),
            remote_replaces: self.remote_replaces.load(Ordering::SeqCst),
            peak_concurrent_passes: self.peak.load(Ordering::SeqCst),
        }
    }
}

struct PassGuard<'a> {
    counters: &'a Counters,
}

impl Drop for PassGuard<'_> {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// State guarded by the merge gate.
struct GateState {
    initial_sync_done: bool,
}

/// Mirrors one remote object onto one local directory, in both directions.
pub struct Engine<R: RemoteStore + ?Sized> {
    target: ObjectRef,
    root: PathBuf,
    remote: Arc<R>,
    gate: Mutex<GateState>,
    phase: watch::Sender<Phase>,
    counters: Counters,
}

impl<R: RemoteStore + ?Sized> Engine<R> {
    pub fn new(target: ObjectRef, root: PathBuf, remote: Arc<R>) -> Self {
        let (phase, _) = watch::channel(Phase::Uninitialized);
        Self {
            target,
            root,
            remote,
            gate: Mutex::new(GateState {
                initial_sync_done: false,
            }),
            phase,
            counters: Counters::default(),
        }
    }

    pub fn target(&self) -> &ObjectRef {
        &self.target
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    /// Uninitialized → AwaitingInitialRemoteSync. No-op in any other phase.
    pub fn start_watching(&self) {
        self.phase.send_if_modified(|phase| {
            if *phase == Phase::Uninitialized {
                *phase = Phase::AwaitingInitialRemoteSync;
                true
            } else {
                false
            }
        });
    }

    /// Move to Stopped. Returns false if the engine had already stopped.
    ///
    /// In-flight passes finish; later triggers are ignored.
    pub fn stop(&self, reason: StopReason) -> bool {
        let stopped = self.phase.send_if_modified(|phase| {
            if phase.is_stopped() {
                false
            } else {
                *phase = Phase::Stopped(reason);
                true
            }
        });
        if stopped {
            tracing::info!(object = %self.target, reason = %reason, "engine stopped");
        }
        stopped
    }

    fn is_stopped(&self) -> bool {
        self.phase.borrow().is_stopped()
    }

    /// Dispatch a remote change notification.
    pub async fn on_remote_event(&self, event: RemoteEvent) -> Result<EventOutcome, SyncError> {
        if self.is_stopped() {
            return Ok(EventOutcome::Ignored);
        }
        let object = &event.object().target;
        if !self.target.matches(&object.namespace, &object.name) {
            tracing::debug!(
                object = %event.object().target,
                kind = event.kind(),
                "ignoring event for untracked object",
            );
            return Ok(EventOutcome::Ignored);
        }

        match event {
            RemoteEvent::Created(object) | RemoteEvent::Updated { new: object, .. } => {
                self.apply_remote(&object.entries).await
            }
            RemoteEvent::Deleted(_) => {
                tracing::error!(
                    object = %self.target,
                    "tracked remote object was deleted; refusing to guess which side is authoritative",
                );
                self.stop(StopReason::RemoteDeleted);
                Ok(EventOutcome::Stopped)
            }
        }
    }

    /// Remote → local pass.
    ///
    /// Every remote entry is written unless the file already holds the same
    /// bytes. Files not named by `entries` are deleted only after the initial
    /// sync; before that they are left for the first local → remote pass to
    /// fold into the remote object. An I/O failure aborts the pass without
    /// rolling back files already written.
    pub async fn apply_remote(&self, entries: &Entries) -> Result<EventOutcome, SyncError> {
        let state = self.gate.lock().await;
        if self.is_stopped() {
            return Ok(EventOutcome::Ignored);
        }
        let _pass = self.counters.enter();
        Counters::bump(&self.counters.remote_passes, 1);
        let started = Instant::now();

        let root = self.root.clone();
        let remote = entries.clone();
        let delete = state.initial_sync_done;
        let report = blocking(move || mirror_onto_disk(&root, &remote, delete)).await?;
        Counters::bump(&self.counters.files_written, report.written);
        Counters::bump(&self.counters.files_deleted, report.deleted);

        tracing::info!(
            object = %self.target,
            written = report.written,
            unchanged = report.unchanged,
            deleted = report.deleted,
            deferred = report.deletions_deferred,
            duration_ms = started.elapsed().as_millis(),
            "remote → local pass completed",
        );
        Ok(EventOutcome::Applied(report))
    }

    /// Local → remote pass, triggered by any filesystem change notification.
    pub async fn on_local_change(&self) -> Result<PushOutcome, SyncError> {
        let _state = self.gate.lock().await;
        if self.is_stopped() {
            return Ok(PushOutcome::Skipped);
        }
        self.push_locked().await
    }

    /// Flip the initial-sync flag and run the first local → remote pass
    /// unconditionally, both under the gate. Runs at most once.
    pub async fn complete_initial_sync(&self) -> Result<PushOutcome, SyncError> {
        let mut state = self.gate.lock().await;
        if self.is_stopped() || state.initial_sync_done {
            return Ok(PushOutcome::Skipped);
        }
        state.initial_sync_done = true;
        let outcome = self.push_locked().await?;
        self.phase.send_if_modified(|phase| {
            if phase.is_stopped() {
                false
            } else {
                *phase = Phase::Steady;
                true
            }
        });
        tracing::info!(object = %self.target, outcome = ?outcome, "initial sync completed");
        Ok(outcome)
    }

    /// Caller must hold the gate.
    async fn push_locked(&self) -> Result<PushOutcome, SyncError> {
        let _pass = self.counters.enter();
        Counters::bump(&self.counters.local_passes, 1);
        let started = Instant::now();

        let Some(before) = self.remote.get(&self.target).await else {
            tracing::debug!(object = %self.target, "remote object not cached; skipping push");
            return Ok(PushOutcome::Missing);
        };

        let root = self.root.clone();
        let after = blocking(move || Ok(tree::snapshot(&root)?)).await?;
        if after == before {
            tracing::debug!(object = %self.target, "local tree matches remote object");
            return Ok(PushOutcome::Unchanged);
        }

        let entries = after.len();
        self.remote.replace(&self.target, after).await?;
        Counters::bump(&self.counters.remote_replaces, 1);

        tracing::info!(
            object = %self.target,
            entries,
            duration_ms = started.elapsed().as_millis(),
            "updated secret",
        );
        Ok(PushOutcome::Replaced { entries })
    }
}

// ---------------------------------------------------------------------------
// Blocking filesystem work
// ---------------------------------------------------------------------------

/// Run tree I/O on the blocking pool so watch and signal tasks keep running.
async fn blocking<T, F>(work: F) -> Result<T, SyncError>
where
    F: FnOnce() -> Result<T, SyncError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|err| SyncError::Join(format!("tree task join error: {err}")))?
}

/// Write every remote entry under `root`; remove orphans only when `delete`.
///
/// All keys are validated before the first write. An I/O failure aborts
/// the pass and leaves already-written files in place.
fn mirror_onto_disk(
    root: &Path,
    entries: &Entries,
    delete: bool,
) -> Result<RemoteApplyReport, SyncError> {
    let mut planned = Vec::with_capacity(entries.len());
    for (key, bytes) in entries {
        planned.push((tree::path_for_key(root, key)?, bytes));
    }

    let mut delete_candidates: HashMap<PathBuf, bool> = tree::list_files(root)?
        .into_iter()
        .map(|path| (path, true))
        .collect();

    let mut report = RemoteApplyReport::default();
    for (path, bytes) in planned {
        delete_candidates.insert(path.clone(), false);
        match writer::write_if_changed(&path, bytes)? {
            WriteResult::Written { .. } => report.written += 1,
            WriteResult::Unchanged { .. } => report.unchanged += 1,
        }
    }

    let mut doomed: Vec<PathBuf> = delete_candidates
        .into_iter()
        .filter_map(|(path, doomed)| doomed.then_some(path))
        .collect();
    doomed.sort();

    if delete {
        for path in &doomed {
            writer::remove_file(path)?;
            report.deleted += 1;
        }
    } else {
        report.deletions_deferred = doomed.len();
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRemote;
    use kubersync_core::RemoteObject;
    use std::fs;
    use tempfile::TempDir;

    fn target() -> ObjectRef {
        ObjectRef::new("default", "app")
    }

    fn entries(pairs: &[(&str, &str)]) -> Entries {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    fn setup(root: &TempDir) -> (Engine<MemoryRemote>, Arc<MemoryRemote>) {
        let (remote, _feed) = MemoryRemote::new();
        let remote = Arc::new(remote);
        let engine = Engine::new(target(), root.path().to_path_buf(), remote.clone());
        (engine, remote)
    }

    #[tokio::test]
    async fn phase_walks_through_lifecycle() {
        let root = TempDir::new().unwrap();
        let (engine, remote) = setup(&root);
        remote.insert(target(), Entries::new()).await;

        assert_eq!(engine.phase(), Phase::Uninitialized);
        engine.start_watching();
        assert_eq!(engine.phase(), Phase::AwaitingInitialRemoteSync);
        engine.complete_initial_sync().await.unwrap();
        assert_eq!(engine.phase(), Phase::Steady);
        assert!(engine.stop(StopReason::Shutdown));
        assert!(!engine.stop(StopReason::RemoteDeleted), "first reason sticks");
        assert_eq!(engine.phase(), Phase::Stopped(StopReason::Shutdown));
    }

    #[tokio::test]
    async fn events_for_other_objects_are_ignored() {
        let root = TempDir::new().unwrap();
        let (engine, _remote) = setup(&root);
        let other = RemoteObject::new(ObjectRef::new("default", "other"), entries(&[("x", "1")]));

        let outcome = engine
            .on_remote_event(RemoteEvent::Created(other.clone()))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Ignored);
        let outcome = engine
            .on_remote_event(RemoteEvent::Deleted(other))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Ignored);
        assert!(!root.path().join("x").exists());
        assert!(!engine.phase().is_stopped());
    }

    #[tokio::test]
    async fn deletions_are_deferred_until_initial_sync() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("local-only"), "keep me").unwrap();
        let (engine, _remote) = setup(&root);

        let outcome = engine.apply_remote(&entries(&[("a", "1")])).await.unwrap();
        let report = match outcome {
            EventOutcome::Applied(report) => report,
            other => panic!("expected applied, got {other:?}"),
        };
        assert_eq!(report.written, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(report.deletions_deferred, 1);
        assert!(root.path().join("local-only").exists());
    }

    #[tokio::test]
    async fn invalid_key_aborts_pass_before_any_write() {
        let root = TempDir::new().unwrap();
        let (engine, _remote) = setup(&root);

        let err = engine
            .apply_remote(&entries(&[("a", "1"), ("../escape", "x")]))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Tree(_)), "got: {err}");
        assert!(!root.path().join("a").exists(), "no partial write expected");
    }

    #[tokio::test]
    async fn push_without_cached_object_is_missing() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("a"), "1").unwrap();
        let (engine, remote) = setup(&root);

        let outcome = engine.on_local_change().await.unwrap();
        assert_eq!(outcome, PushOutcome::Missing);
        assert_eq!(remote.replace_count(), 0);
    }

    #[tokio::test]
    async fn complete_initial_sync_runs_once() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("b"), "2").unwrap();
        let (engine, remote) = setup(&root);
        remote.insert(target(), Entries::new()).await;

        let first = engine.complete_initial_sync().await.unwrap();
        assert_eq!(first, PushOutcome::Replaced { entries: 1 });
        let second = engine.complete_initial_sync().await.unwrap();
        assert_eq!(second, PushOutcome::Skipped);
        assert_eq!(remote.replace_count(), 1);
    }

    #[tokio::test]
    async fn replace_failure_surfaces_as_remote_error() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("a"), "1").unwrap();
        let (engine, remote) = setup(&root);
        remote.insert(target(), Entries::new()).await;
        remote.fail_replaces(true);

        let err = engine.on_local_change().await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(_)), "got: {err}");
        assert_eq!(engine.stats().remote_replaces, 0);
    }

    #[tokio::test]
    async fn panicking_tree_task_surfaces_as_join_error() {
        let err = blocking::<(), _>(|| panic!("tree walk blew up"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Join(_)), "got: {err}");
    }

    #[tokio::test(flavor = "current_thread")]
    async fn passes_complete_on_a_single_threaded_runtime() {
        let root = TempDir::new().unwrap();
        let (engine, remote) = setup(&root);
        remote.insert(target(), entries(&[("a", "1")])).await;

        engine.apply_remote(&entries(&[("a", "1")])).await.unwrap();
        let outcome = engine.complete_initial_sync().await.unwrap();
        assert_eq!(outcome, PushOutcome::Unchanged);
        assert_eq!(fs::read(root.path().join("a")).unwrap(), b"1");
    }

    #[tokio::test]
    async fn stopped_engine_ignores_all_triggers() {
        let root = TempDir::new().unwrap();
        let (engine, remote) = setup(&root);
        remote.insert(target(), Entries::new()).await;
        engine.stop(StopReason::Shutdown);

        let outcome = engine
            .on_remote_event(RemoteEvent::Created(RemoteObject::new(
                target(),
                entries(&[("a", "1")]),
            )))
            .await
            .unwrap();
        assert_eq!(outcome, EventOutcome::Ignored);
        assert_eq!(engine.on_local_change().await.unwrap(), PushOutcome::Skipped);
        assert!(!root.path().join("a").exists());
    }
}
