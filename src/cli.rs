use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use structopt::StructOpt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::app::App;
use mds_converge::{Config, ConvergenceOutcome, ConvergenceReport, TargetConfig};

/// Process exit code for a converged cluster.
pub const EXIT_CONVERGED: i32 = 0;
/// Process exit code for a control plane failure.
pub const EXIT_CONTROL_PLANE: i32 = 1;
/// Process exit code for an attempt which ran out of time.
pub const EXIT_TIMEOUT: i32 = 2;
/// Process exit code for a cancelled attempt.
pub const EXIT_CANCELLED: i32 = 130;

/// Drive a CephFS MDS cluster to a target rank layout and confirm it.
#[derive(StructOpt)]
#[structopt(name = "mds-converge")]
pub struct MdsConverge {
    #[structopt(subcommand)]
    action: Subcommands,
    /// Enable debug logging.
    #[structopt(short)]
    verbose: bool,
    /// The filesystem to operate on, overriding FS_NAME.
    #[structopt(long)]
    fs: Option<String>,
    /// Write the run's metrics in Prometheus text format to this path on exit.
    #[structopt(long, parse(from_os_str))]
    metrics_file: Option<PathBuf>,
}

#[derive(StructOpt)]
pub enum Subcommands {
    /// Print the filesystem's current MDS status as JSON.
    #[structopt(name = "status")]
    Status,
    /// Drive the filesystem to a target configuration and wait for it to hold.
    #[structopt(name = "converge")]
    Converge(Converge),
}

#[derive(StructOpt)]
pub struct Converge {
    /// The target number of active ranks.
    #[structopt(long, default_value = "1")]
    max_mds: u32,
    /// Leave standby-replay enabled instead of disabling it.
    #[structopt(long)]
    allow_standby_replay: bool,
    /// The interval in milliseconds between status polls, overriding POLL_INTERVAL_MS.
    #[structopt(long)]
    poll_interval_ms: Option<u64>,
    /// The overall deadline in seconds, overriding DEADLINE_SECONDS.
    #[structopt(long)]
    deadline_seconds: Option<u64>,
}

impl MdsConverge {
    /// Run the selected subcommand, returning the process exit code.
    pub async fn run(self) -> Result<i32> {
        let mut overrides = vec![];
        if let Some(fs) = &self.fs {
            overrides.push(("FS_NAME".to_string(), fs.clone()));
        }
        if let Subcommands::Converge(inner) = &self.action {
            if let Some(ms) = inner.poll_interval_ms {
                overrides.push(("POLL_INTERVAL_MS".to_string(), ms.to_string()));
            }
            if let Some(secs) = inner.deadline_seconds {
                overrides.push(("DEADLINE_SECONDS".to_string(), secs.to_string()));
            }
        }
        let config = Arc::new(Config::with_overrides(overrides)?);

        // Initialize logging based on CLI config. Logs go to stderr, leaving stdout for output.
        let filter_layer = if self.verbose { EnvFilter::new("debug") } else { EnvFilter::new(&config.rust_log) };
        tracing_subscriber::registry()
            .with(filter_layer)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .try_init()
            .context("error initializing logging/tracing system")?;

        let metrics = match &self.metrics_file {
            Some(_) => Some(install_metrics_recorder(&config)?),
            None => None,
        };

        let app = App::new(config.clone())?;
        let code = match &self.action {
            Subcommands::Status => {
                let status = app.status().await.context("error reading cluster status")?;
                println!("{}", serde_json::to_string_pretty(&status)?);
                EXIT_CONVERGED
            }
            Subcommands::Converge(inner) => {
                let target = TargetConfig::new(inner.max_mds, inner.allow_standby_replay)?;
                let report = app.converge(&target, config.poll_interval(), config.deadline()).await;
                println!("{}", serde_json::to_string_pretty(&report_json(&config, &target, &report))?);
                exit_code(&report.outcome)
            }
        };

        if let (Some(path), Some(handle)) = (&self.metrics_file, metrics) {
            tokio::fs::write(path, handle.render())
                .await
                .with_context(|| format!("error writing metrics to {}", path.display()))?;
        }
        Ok(code)
    }
}

/// Map a convergence outcome onto a process exit code.
pub fn exit_code(outcome: &ConvergenceOutcome) -> i32 {
    match outcome {
        ConvergenceOutcome::Converged => EXIT_CONVERGED,
        ConvergenceOutcome::Failed(_) => EXIT_CONTROL_PLANE,
        ConvergenceOutcome::Timeout => EXIT_TIMEOUT,
        ConvergenceOutcome::Cancelled => EXIT_CANCELLED,
    }
}

fn report_json(config: &Config, target: &TargetConfig, report: &ConvergenceReport) -> serde_json::Value {
    let error = match &report.outcome {
        ConvergenceOutcome::Failed(err) => Some(serde_json::json!({ "kind": err.kind(), "message": format!("{:#}", err) })),
        _ => None,
    };
    serde_json::json!({
        "fs_name": config.fs_name,
        "target": target,
        "outcome": report.outcome.label(),
        "error": error,
        "polls": report.polls,
        "elapsed_ms": report.elapsed.as_millis() as u64,
        "last_status": report.last_status,
    })
}

/// Build the Prometheus recorder, install it globally and return a handle for rendering.
fn install_metrics_recorder(config: &Config) -> Result<PrometheusHandle> {
    let recorder = PrometheusBuilder::new().add_global_label("fs", config.fs_name.clone()).build();
    let handle = recorder.handle();
    metrics::set_boxed_recorder(Box::new(recorder)).context("error setting prometheus metrics recorder")?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mds_converge::ControlPlaneError;

    #[test]
    fn outcomes_map_to_exit_codes() {
        let cases = vec![
            (ConvergenceOutcome::Converged, EXIT_CONVERGED),
            (ConvergenceOutcome::Timeout, EXIT_TIMEOUT),
            (ConvergenceOutcome::Cancelled, EXIT_CANCELLED),
            (ConvergenceOutcome::Failed(ControlPlaneError::MalformedStatus("bad".into())), EXIT_CONTROL_PLANE),
        ];
        for (outcome, expected) in cases {
            let code = exit_code(&outcome);
            assert!(code == expected, "expected exit code {} for {}, got {}", expected, outcome.label(), code);
        }
    }

    #[test]
    fn converge_flags_parse() {
        let cli = MdsConverge::from_iter(vec!["mds-converge", "-v", "--fs", "cephfs", "converge", "--max-mds", "2", "--deadline-seconds", "30"]);
        assert!(cli.verbose, "expected -v to enable verbose logging");
        assert!(cli.fs.as_deref() == Some("cephfs"), "unexpected fs {:?}", cli.fs);
        match cli.action {
            Subcommands::Converge(inner) => {
                assert!(inner.max_mds == 2, "unexpected max_mds {}", inner.max_mds);
                assert!(!inner.allow_standby_replay, "expected standby-replay to default to disallowed");
                assert!(inner.deadline_seconds == Some(30), "unexpected deadline {:?}", inner.deadline_seconds);
                assert!(inner.poll_interval_ms.is_none(), "unexpected poll interval {:?}", inner.poll_interval_ms);
            }
            Subcommands::Status => panic!("expected converge subcommand"),
        }
    }
}
