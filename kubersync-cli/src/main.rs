//! kubersync: mirror one Kubernetes secret into one local directory.
//!
//! # Usage
//!
//! ```text
//! kubersync --secret <name> --path <dir> [--namespace default]
//!           [--kubeconfig <file>] [--master <url>]
//!           [--resync-period <secs>] [--sync-timeout <secs>] [--verbose]
//! ```

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use kubersync_core::ObjectRef;
use kubersync_daemon::{start_blocking, ClientSettings, DaemonConfig, DEFAULT_RESYNC_PERIOD};

#[derive(Parser, Debug)]
#[command(
    name = "kubersync",
    version,
    about = "Keep a Kubernetes secret and a local directory in sync",
    long_about = None,
)]
struct Cli {
    /// Name of the secret to mirror.
    #[arg(long)]
    secret: String,

    /// Local directory holding one file per secret key.
    #[arg(long)]
    path: PathBuf,

    /// Namespace of the secret.
    #[arg(long, default_value = "default")]
    namespace: String,

    /// Path to a kubeconfig file. Defaults to the usual discovery rules.
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// API server URL, overriding the kubeconfig.
    #[arg(long)]
    master: Option<String>,

    /// Seconds between full re-deliveries of the cached secret; 0 disables.
    #[arg(long, default_value_t = DEFAULT_RESYNC_PERIOD.as_secs())]
    resync_period: u64,

    /// Give up if the initial secret listing takes longer than this many seconds.
    #[arg(long)]
    sync_timeout: Option<u64>,

    /// Log at debug level unless RUST_LOG says otherwise.
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> DaemonConfig {
        DaemonConfig {
            target: ObjectRef::new(self.namespace, self.secret),
            root: self.path,
            client: ClientSettings {
                kubeconfig: self.kubeconfig,
                master: self.master,
            },
            resync_period: (self.resync_period > 0).then(|| Duration::from_secs(self.resync_period)),
            sync_timeout: self.sync_timeout.map(Duration::from_secs),
            verbose: self.verbose,
        }
    }
}

fn main() -> Result<()> {
    let config = Cli::parse().into_config();
    let target = config.target.clone();
    start_blocking(config).with_context(|| format!("mirroring secret {target} failed"))
}
