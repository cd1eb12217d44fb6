use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::stream::StreamExt;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::SignalStream;
use tokio_stream::StreamMap;

use mds_converge::{CephCli, ClusterStatus, Config, ControlResult, ConvergenceController, ConvergenceReport, RetryPolicy, StatusReader, TargetConfig};

/// The application object for a single CLI invocation.
pub struct App {
    /// The application's runtime config.
    config: Arc<Config>,
    /// The control plane of the filesystem being operated on.
    ceph: Arc<CephCli>,

    /// A channel used for triggering graceful shutdown.
    shutdown_tx: broadcast::Sender<()>,
    /// The join handle of the signal watcher.
    signals: JoinHandle<()>,
}

impl App {
    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Result<Self> {
        // App shutdown channel.
        let (shutdown_tx, _) = broadcast::channel(10);

        let mut signals = StreamMap::new();
        signals.insert("sigterm", SignalStream::new(signal(SignalKind::terminate()).context("error building signal stream")?));
        signals.insert("sigint", SignalStream::new(signal(SignalKind::interrupt()).context("error building signal stream")?));
        let signals = tokio::spawn(Self::watch_signals(signals, shutdown_tx.clone()));

        let ceph = Arc::new(CephCli::new(&config));
        Ok(Self {
            config,
            ceph,
            shutdown_tx,
            signals,
        })
    }

    /// Read the current status of the filesystem.
    pub async fn status(&self) -> ControlResult<ClusterStatus> {
        self.ceph.read().await
    }

    /// Drive the filesystem to the given target, cancelling on SIGINT or SIGTERM.
    pub async fn converge(&self, target: &TargetConfig, poll_interval: Duration, deadline: Duration) -> ConvergenceReport {
        tracing::info!(
            fs = %self.config.fs_name,
            max_mds = target.max_mds(),
            allow_standby_replay = target.allow_standby_replay(),
            deadline_seconds = deadline.as_secs(),
            "starting convergence",
        );
        let retry = RetryPolicy::from_config(&self.config);
        let mut controller = ConvergenceController::new(self.ceph.clone(), self.ceph.clone(), retry).with_shutdown(self.shutdown_tx.subscribe());
        controller.converge(target, poll_interval, deadline).await
    }

    async fn watch_signals(mut signals: StreamMap<&'static str, SignalStream>, shutdown_tx: broadcast::Sender<()>) {
        if let Some((name, _)) = signals.next().await {
            tracing::info!(signal = name, "signal received, cancelling");
            let _ = shutdown_tx.send(());
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.signals.abort();
    }
}
