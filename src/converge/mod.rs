//! Convergence controller.
//!
//! The controller drives a filesystem towards a `TargetConfig` and blocks until the cluster's
//! map confirms it. Rank removal is asynchronous and multi-step: after `max_mds` is lowered, the
//! surplus ranks pass through `up:stopping` while their subtrees migrate, and only then leave the
//! map. A command returning successfully therefore says nothing about the cluster; only a
//! snapshot where the target holds with no transitional ranks does.
//!
//! The control flow is a simple two-phase loop:
//!
//! ```text
//! set_standby_replay(false)?  ->  set_max_ranks(n)  ->  read, check, correct drift, sleep  -> ...
//! ```
//!
//! Transient control plane faults are retried with backoff within a bounded budget. Every other
//! failure is terminal, and all outcomes are folded into a `ConvergenceReport`.


use std::future::Future;
use std::time::Duration;

use futures::stream::StreamExt;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::control::{ConfigCommander, StatusReader};
use crate::error::{ControlPlaneError, ControlResult};
use crate::models::{ClusterStatus, TargetConfig};
use crate::retry::RetryPolicy;

const METRIC_COMMANDS_ISSUED: &str = "mds_converge_commands_issued";
const METRIC_STATUS_POLLS: &str = "mds_converge_status_polls";
const METRIC_TRANSIENT_RETRIES: &str = "mds_converge_transient_retries";
const METRIC_DRIFT_CORRECTIONS: &str = "mds_converge_drift_corrections";

/// The smallest poll interval honored by the controller.
const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// The deadline used when the requested one cannot be represented as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The way in which a convergence attempt ended.
#[derive(Debug)]
pub enum ConvergenceOutcome {
    /// The cluster's map matches the target with no transitional ranks.
    Converged,
    /// The deadline elapsed before the cluster converged.
    Timeout,
    /// The caller cancelled the attempt. Issued commands are left in place.
    Cancelled,
    /// The control plane rejected a command, returned a malformed status, or stayed unavailable
    /// beyond the retry budget.
    Failed(ControlPlaneError),
}

impl ConvergenceOutcome {
    /// Check if this outcome indicates convergence.
    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }

    /// A short static label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::Failed(_) => "control_plane_error",
        }
    }
}

/// The result of a convergence attempt.
#[derive(Debug)]
pub struct ConvergenceReport {
    /// The way in which the attempt ended.
    pub outcome: ConvergenceOutcome,
    /// The last snapshot observed, if any read succeeded.
    pub last_status: Option<ClusterStatus>,
    /// The number of successful status reads.
    pub polls: u32,
    /// The time spent in the attempt.
    pub elapsed: Duration,
}

/// A controller which drives a cluster to a target configuration and confirms it.
pub struct ConvergenceController<R, C> {
    /// The source of cluster status snapshots.
    reader: R,
    /// The issuer of configuration commands.
    commander: C,
    /// The policy used for retrying transient faults.
    retry: RetryPolicy,
    /// An optional channel used for cancelling the attempt.
    shutdown: Option<BroadcastStream<()>>,
}

impl<R: StatusReader, C: ConfigCommander> ConvergenceController<R, C> {
    /// Create a new instance.
    pub fn new(reader: R, commander: C, retry: RetryPolicy) -> Self {
        metrics::register_counter!(METRIC_COMMANDS_ISSUED, metrics::Unit::Count, "configuration commands accepted by the control plane");
        metrics::register_counter!(METRIC_STATUS_POLLS, metrics::Unit::Count, "cluster status snapshots read");
        metrics::register_counter!(METRIC_TRANSIENT_RETRIES, metrics::Unit::Count, "control plane calls retried after a transient fault");
        metrics::register_counter!(METRIC_DRIFT_CORRECTIONS, metrics::Unit::Count, "commands reissued after observing drift");
        Self {
            reader,
            commander,
            retry,
            shutdown: None,
        }
    }

    /// Cancel any convergence attempt when the given channel yields or closes.
    ///
    /// Cancellation is observed while sleeping between polls and between retries.
    pub fn with_shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(BroadcastStream::new(shutdown));
        self
    }

    /// Drive the cluster to the given target, returning once it is observed, once `deadline` has
    /// elapsed, or on a terminal failure.
    #[tracing::instrument(
        level = "info",
        skip(self, target),
        fields(max_mds = target.max_mds(), allow_standby_replay = target.allow_standby_replay())
    )]
    pub async fn converge(&mut self, target: &TargetConfig, poll_interval: Duration, deadline: Duration) -> ConvergenceReport {
        let started = Instant::now();
        let deadline_at = started.checked_add(deadline).unwrap_or_else(|| started + FAR_FUTURE);
        let mut run = RunState::default();
        let outcome = match self.drive(target, poll_interval.max(MIN_POLL_INTERVAL), deadline_at, &mut run).await {
            Ok(outcome) | Err(outcome) => outcome,
        };
        let elapsed = started.elapsed();
        tracing::info!(outcome = outcome.label(), polls = run.polls, elapsed_ms = elapsed.as_millis() as u64, "convergence attempt finished");
        ConvergenceReport {
            outcome,
            last_status: run.last_status,
            polls: run.polls,
            elapsed,
        }
    }

    /// The convergence loop. Terminal outcomes which abort the loop early are returned as errors.
    async fn drive(
        &mut self, target: &TargetConfig, poll_interval: Duration, deadline_at: Instant, run: &mut RunState,
    ) -> Result<ConvergenceOutcome, ConvergenceOutcome> {
        let reader = &self.reader;
        let commander = &self.commander;
        let retry = &self.retry;
        let shutdown = &mut self.shutdown;

        if !target.allow_standby_replay() {
            tracing::info!("disabling standby-replay");
            attempt(retry, shutdown, "set_standby_replay", move || commander.set_standby_replay(false)).await?;
            metrics::increment_counter!(METRIC_COMMANDS_ISSUED);
        }
        tracing::info!(max_mds = target.max_mds(), "setting max_mds");
        attempt(retry, shutdown, "set_max_ranks", move || commander.set_max_ranks(target.max_mds())).await?;
        metrics::increment_counter!(METRIC_COMMANDS_ISSUED);

        loop {
            let status = attempt(retry, shutdown, "read_status", move || reader.read()).await?;
            run.polls += 1;
            metrics::increment_counter!(METRIC_STATUS_POLLS);

            let active = status.active_count();
            if active > status.max_mds {
                tracing::warn!(active, max_mds = status.max_mds, epoch = status.epoch, "map reports more active ranks than max_mds");
            }
            match status.divergence(target) {
                None => {
                    tracing::info!(epoch = status.epoch, active, "cluster converged to target");
                    run.last_status = Some(status);
                    return Ok(ConvergenceOutcome::Converged);
                }
                Some(divergence) => tracing::debug!(epoch = status.epoch, %divergence, "waiting on cluster"),
            }

            let observed_max_mds = status.max_mds;
            let max_mds_drifted = observed_max_mds != target.max_mds();
            let replay_drifted = !target.allow_standby_replay() && status.allow_standby_replay;
            run.last_status = Some(status);

            if replay_drifted {
                tracing::warn!("standby-replay was re-enabled externally, disabling it again");
                attempt(retry, shutdown, "set_standby_replay", move || commander.set_standby_replay(false)).await?;
                metrics::increment_counter!(METRIC_COMMANDS_ISSUED);
                metrics::increment_counter!(METRIC_DRIFT_CORRECTIONS);
            }
            if max_mds_drifted {
                tracing::warn!(observed = observed_max_mds, target = target.max_mds(), "max_mds drifted from target, reissuing");
                attempt(retry, shutdown, "set_max_ranks", move || commander.set_max_ranks(target.max_mds())).await?;
                metrics::increment_counter!(METRIC_COMMANDS_ISSUED);
                metrics::increment_counter!(METRIC_DRIFT_CORRECTIONS);
            }

            let now = Instant::now();
            if now >= deadline_at {
                tracing::warn!(polls = run.polls, "deadline elapsed before cluster converged");
                return Ok(ConvergenceOutcome::Timeout);
            }
            let wake = now.checked_add(poll_interval).map_or(deadline_at, |wake| wake.min(deadline_at));
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => (),
                _ = cancelled(shutdown) => {
                    tracing::info!("convergence cancelled by caller");
                    return Err(ConvergenceOutcome::Cancelled);
                }
            }
        }
    }
}

/// Per-attempt bookkeeping.
#[derive(Default)]
struct RunState {
    polls: u32,
    last_status: Option<ClusterStatus>,
}

/// Perform a control plane call, retrying transient faults per the given policy.
async fn attempt<T, F, Fut>(
    retry: &RetryPolicy, shutdown: &mut Option<BroadcastStream<()>>, op: &'static str, mut call: F,
) -> Result<T, ConvergenceOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ControlResult<T>>,
{
    let mut retries = 0;
    loop {
        let err = match call().await {
            Ok(val) => return Ok(val),
            Err(err) => err,
        };
        if !err.is_transient() {
            match &err {
                ControlPlaneError::MalformedStatus(_) => {
                    tracing::error!(error = %err, op, "control plane returned a status which could not be understood")
                }
                _ => tracing::error!(error = %err, op, "control plane call failed"),
            }
            return Err(ConvergenceOutcome::Failed(err));
        }
        if !retry.should_retry(retries) {
            tracing::error!(error = %err, op, retries, "control plane unavailable, retry budget exhausted");
            return Err(ConvergenceOutcome::Failed(err));
        }
        let delay = retry.delay(retries);
        retries += 1;
        metrics::increment_counter!(METRIC_TRANSIENT_RETRIES);
        tracing::warn!(error = %err, op, retry = retries, delay_ms = delay.as_millis() as u64, "transient control plane fault, retrying");
        tokio::select! {
            _ = tokio::time::sleep(delay) => (),
            _ = cancelled(shutdown) => {
                tracing::info!(op, "retry cancelled by caller");
                return Err(ConvergenceOutcome::Cancelled);
            }
        }
    }
}

/// Resolve once the shutdown channel yields or closes, or never if there is none.
async fn cancelled(shutdown: &mut Option<BroadcastStream<()>>) {
    match shutdown {
        Some(stream) => {
            let _ = stream.next().await;
        }
        None => futures::future::pending::<()>().await,
    }
}
