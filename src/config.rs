//! Runtime configuration.

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use serde::Deserialize;

/// The longest deadline accepted for a convergence attempt, one week.
pub const MAX_DEADLINE_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Runtime configuration data.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// The logging config, which uses Rust's `env_logger` directives.
    #[serde(default = "Config::default_rust_log")]
    pub rust_log: String,

    /// The name of the CephFS filesystem to operate on.
    pub fs_name: String,
    /// The path to the `ceph` admin CLI.
    #[serde(default = "Config::default_ceph_bin")]
    pub ceph_bin: String,
    /// An optional path to the `ceph.conf` to use, passed as `--conf`.
    #[serde(default)]
    pub ceph_conf: Option<String>,
    /// An optional client ID to authenticate as, passed as `--id`.
    #[serde(default)]
    pub ceph_client_id: Option<String>,
    /// The duration in seconds after which a single control plane call is abandoned.
    #[serde(default = "Config::default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,

    /// The interval in milliseconds between status polls.
    #[serde(default = "Config::default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// The duration in seconds after which a convergence attempt times out.
    #[serde(default = "Config::default_deadline_seconds")]
    pub deadline_seconds: u64,

    /// The number of times a transient control plane fault is retried.
    #[serde(default = "Config::default_max_transient_retries")]
    pub max_transient_retries: u32,
    /// The delay in milliseconds before the first retry.
    #[serde(default = "Config::default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// The factor by which the retry delay grows.
    #[serde(default = "Config::default_retry_backoff_multiplier")]
    pub retry_backoff_multiplier: f64,
    /// The maximum delay in milliseconds between retries.
    #[serde(default = "Config::default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
    /// The fraction by which retry delays are randomly stretched.
    #[serde(default = "Config::default_retry_jitter")]
    pub retry_jitter: f64,
}

impl Config {
    /// Create a new config instance from the runtime environment.
    #[allow(clippy::new_without_default)]
    pub fn new() -> Result<Self> {
        Self::with_overrides(std::iter::empty())
    }

    /// Create a new config instance from the runtime environment, with the given variables
    /// taking precedence over the environment's values.
    pub fn with_overrides(overrides: impl IntoIterator<Item = (String, String)>) -> Result<Self> {
        let mut vars: BTreeMap<String, String> = std::env::vars().collect();
        vars.extend(overrides);
        let config: Config = envy::from_iter(vars).context("error building config from env")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the relationships between config values.
    pub fn validate(&self) -> Result<()> {
        ensure!(!self.fs_name.is_empty(), "FS_NAME must not be empty");
        ensure!(self.command_timeout_seconds >= 1, "COMMAND_TIMEOUT_SECONDS must be at least 1 second");
        ensure!(self.poll_interval_ms >= 1, "POLL_INTERVAL_MS must be at least 1 millisecond");
        ensure!(self.deadline_seconds >= 1, "DEADLINE_SECONDS must be at least 1 second");
        ensure!(
            self.deadline_seconds <= MAX_DEADLINE_SECONDS,
            "DEADLINE_SECONDS must be at most {} seconds",
            MAX_DEADLINE_SECONDS
        );
        ensure!(self.retry_backoff_multiplier >= 1.0, "RETRY_BACKOFF_MULTIPLIER must be at least 1.0");
        ensure!(
            self.retry_max_delay_ms >= self.retry_base_delay_ms,
            "RETRY_MAX_DELAY_MS must be greater than or equal to RETRY_BASE_DELAY_MS"
        );
        ensure!((0.0..1.0).contains(&self.retry_jitter), "RETRY_JITTER must be within [0, 1)");
        Ok(())
    }

    /// The interval between status polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The overall deadline of a convergence attempt.
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_seconds)
    }

    /// The timeout applied to each control plane call.
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }

    fn default_rust_log() -> String {
        "info".into()
    }

    fn default_ceph_bin() -> String {
        "ceph".into()
    }

    fn default_command_timeout_seconds() -> u64 {
        30
    }

    fn default_poll_interval_ms() -> u64 {
        1_000
    }

    fn default_deadline_seconds() -> u64 {
        300
    }

    fn default_max_transient_retries() -> u32 {
        5
    }

    fn default_retry_base_delay_ms() -> u64 {
        500
    }

    fn default_retry_backoff_multiplier() -> f64 {
        2.0
    }

    fn default_retry_max_delay_ms() -> u64 {
        10_000
    }

    fn default_retry_jitter() -> f64 {
        0.2
    }
}
