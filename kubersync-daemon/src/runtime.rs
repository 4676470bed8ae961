use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use kubersync_core::ObjectRef;
use kubersync_sync::{
    Engine, EventOutcome, Phase, RemoteEvent, RemoteFeed, RemoteStore, StopReason,
};

use crate::error::{io_err, DaemonError};
use crate::secrets::{self, ClientSettings, KubeSecrets};
use crate::watcher::{LocalChange, LocalWatch};

/// Everything the daemon needs to mirror one secret into one directory.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub target: ObjectRef,
    pub root: PathBuf,
    pub client: ClientSettings,
    /// Re-deliver the cached secret this often; `None` disables resync.
    pub resync_period: Option<Duration>,
    /// Give up on the initial cache sync after this long; `None` waits forever.
    pub sync_timeout: Option<Duration>,
    pub verbose: bool,
}

pub const DEFAULT_RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Start the daemon runtime and block the current thread until it exits.
pub fn start_blocking(config: DaemonConfig) -> Result<(), DaemonError> {
    init_tracing(config.verbose);
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| io_err("tokio-runtime", e))?;
    runtime.block_on(run(config))
}

/// Connect to the cluster, start both watchers and mirror until shutdown.
pub async fn run(config: DaemonConfig) -> Result<(), DaemonError> {
    ensure_root(&config.root)?;

    let client = secrets::connect(&config.client).await?;
    let secrets = Arc::new(KubeSecrets::new(client, config.target.clone()));

    let (shutdown_tx, _) = broadcast::channel::<()>(16);
    let (feed, watch_handle) = secrets.spawn_watch(config.resync_period, shutdown_tx.subscribe());

    let signal_handle = {
        let shutdown = shutdown_tx.clone();
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(signal_task(shutdown, shutdown_rx))
    };

    let engine = Arc::new(Engine::new(
        config.target.clone(),
        config.root.clone(),
        secrets,
    ));
    let result = run_with(engine, feed, shutdown_tx.clone(), config.sync_timeout).await;

    let _ = shutdown_tx.send(());
    let (watch_result, signal_result) = tokio::join!(watch_handle, signal_handle);
    handle_join("secret_watch", watch_result.map(Ok))?;
    handle_join("signal_handler", signal_result)?;
    result
}

/// Drive an engine from a remote feed and the local watcher until shutdown.
///
/// Blocks until the remote side reports its initial replay, runs the first
/// local → remote pass, then services both directions. Returns
/// [`DaemonError::RemoteDeleted`] if the tracked object disappears.
pub async fn run_with<R>(
    engine: Arc<Engine<R>>,
    feed: RemoteFeed,
    shutdown: broadcast::Sender<()>,
    sync_timeout: Option<Duration>,
) -> Result<(), DaemonError>
where
    R: RemoteStore + ?Sized + 'static,
{
    let RemoteFeed { events, synced } = feed;
    engine.start_watching();

    let (replayed_tx, replayed_rx) = oneshot::channel();
    let remote_handle = {
        let engine = engine.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(remote_event_task(engine, events, synced, replayed_tx, shutdown_rx))
    };

    let result = serve(&engine, replayed_rx, &shutdown, sync_timeout).await;

    engine.stop(StopReason::Shutdown);
    let _ = shutdown.send(());
    handle_join("remote_events", remote_handle.await)?;

    if engine.phase() == Phase::Stopped(StopReason::RemoteDeleted) {
        return Err(DaemonError::RemoteDeleted {
            target: engine.target().clone(),
        });
    }
    result
}

async fn serve<R>(
    engine: &Arc<Engine<R>>,
    replayed: oneshot::Receiver<()>,
    shutdown: &broadcast::Sender<()>,
    sync_timeout: Option<Duration>,
) -> Result<(), DaemonError>
where
    R: RemoteStore + ?Sized + 'static,
{
    let mut shutdown_rx = shutdown.subscribe();
    let mut phase_rx = engine.subscribe_phase();

    tracing::info!(object = %engine.target(), root = %engine.root().display(), "loading");
    let deadline = async {
        match sync_timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        replayed = replayed => {
            if replayed.is_err() {
                return Err(DaemonError::ChannelClosed("remote sync signal"));
            }
        }
        _ = deadline => {
            return Err(DaemonError::SyncTimeout {
                waited: sync_timeout.unwrap_or_default(),
            });
        }
        _ = shutdown_rx.recv() => return Ok(()),
        _ = phase_rx.wait_for(Phase::is_stopped) => return Ok(()),
    }

    engine.complete_initial_sync().await?;
    tracing::info!(object = %engine.target(), "ready");

    let (local_watch, changes) = LocalWatch::subscribe(engine.root())?;
    let local_handle = {
        let engine = engine.clone();
        let shutdown_rx = shutdown.subscribe();
        tokio::spawn(local_change_task(engine, changes, shutdown_rx))
    };

    tokio::select! {
        _ = shutdown_rx.recv() => {}
        _ = phase_rx.wait_for(Phase::is_stopped) => {}
    }

    let _ = shutdown.send(());
    if let Err(err) = local_watch.unsubscribe() {
        tracing::warn!(error = %err, "failed to unsubscribe local watcher");
    }
    handle_join("local_changes", local_handle.await)
}

/// Applies remote events in arrival order.
///
/// Once the remote side reports its initial replay, every event already
/// queued belongs to that replay; they are applied before `replayed` fires
/// so the first local → remote pass sees the full union.
async fn remote_event_task<R>(
    engine: Arc<Engine<R>>,
    mut events: mpsc::UnboundedReceiver<RemoteEvent>,
    mut synced: watch::Receiver<bool>,
    replayed: oneshot::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    R: RemoteStore + ?Sized + 'static,
{
    let mut replayed = Some(replayed);
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            open = wait_synced(&mut synced), if replayed.is_some() => {
                let notify = replayed.take();
                if !open {
                    continue;
                }
                let mut stopped = false;
                while let Ok(event) = events.try_recv() {
                    if !dispatch(&engine, event).await {
                        stopped = true;
                        break;
                    }
                }
                if stopped {
                    break;
                }
                if let Some(tx) = notify {
                    let _ = tx.send(());
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                if !dispatch(&engine, event).await {
                    break;
                }
            }
        }
    }
    Ok(())
}

async fn wait_synced(synced: &mut watch::Receiver<bool>) -> bool {
    synced.wait_for(|done| *done).await.is_ok()
}

/// Returns false once the engine has stopped for good.
async fn dispatch<R>(engine: &Engine<R>, event: RemoteEvent) -> bool
where
    R: RemoteStore + ?Sized,
{
    let kind = event.kind();
    match engine.on_remote_event(event).await {
        Ok(EventOutcome::Stopped) => false,
        Ok(_) => true,
        Err(err) => {
            tracing::error!(error = %err, kind, "remote → local pass failed");
            true
        }
    }
}

async fn local_change_task<R>(
    engine: Arc<Engine<R>>,
    mut changes: mpsc::UnboundedReceiver<LocalChange>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError>
where
    R: RemoteStore + ?Sized + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            change = changes.recv() => {
                let Some(change) = change else { break };
                tracing::debug!(kind = ?change.kind, paths = ?change.paths, "local change");
                if let Err(err) = engine.on_local_change().await {
                    tracing::error!(error = %err, "local → remote pass failed");
                }
            }
        }
    }
    Ok(())
}

async fn signal_task(
    shutdown: broadcast::Sender<()>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), DaemonError> {
    tokio::select! {
        _ = shutdown_rx.recv() => Ok(()),
        signal = wait_for_signal() => {
            match signal {
                Ok(name) => {
                    tracing::info!(signal = name, "received signal, shutting down");
                    let _ = shutdown.send(());
                    Ok(())
                }
                Err(err) => Err(io_err("signal handler", err)),
            }
        }
    }
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        interrupt = tokio::signal::ctrl_c() => interrupt.map(|()| "interrupt"),
        _ = terminate.recv() => Ok("terminate"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "interrupt")
}

fn ensure_root(root: &Path) -> Result<(), DaemonError> {
    if !root.exists() {
        fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
    }
    Ok(())
}

fn handle_join(
    task: &'static str,
    result: Result<Result<(), DaemonError>, tokio::task::JoinError>,
) -> Result<(), DaemonError> {
    match result {
        Ok(inner) => inner,
        Err(err) => Err(DaemonError::Join {
            task,
            reason: err.to_string(),
        }),
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}
