//! A control plane backed by the `ceph` admin CLI.
//!
//! Status is read from `ceph fs dump --format=json`. Commands are issued as
//! `ceph fs set <fs> max_mds <n>` and `ceph fs set <fs> allow_standby_replay <bool>`.

use std::collections::{BTreeMap, BTreeSet};
use std::process::Stdio;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::timeout;

use crate::config::Config;
use crate::control::{ConfigCommander, StatusReader};
use crate::error::{ControlPlaneError, ControlResult};
use crate::models::{ClusterStatus, RankAssignment, RankState};

/// The MDS map flag bit indicating that standby-replay is allowed.
///
/// Only consulted when the map does not carry a decoded `flags_state` object.
pub const FLAG_ALLOW_STANDBY_REPLAY: u64 = 1 << 5;

/// Exit codes of the CLI which indicate that the monitors could not be reached.
const TRANSIENT_EXIT_CODES: &[i32] = &[
    4,   // EINTR
    11,  // EAGAIN
    107, // ENOTCONN
    110, // ETIMEDOUT
    111, // ECONNREFUSED
    113, // EHOSTUNREACH
];

/// A control plane implementation which shells out to the `ceph` CLI.
#[derive(Clone, Debug)]
pub struct CephCli {
    /// The path to the `ceph` binary.
    bin: String,
    /// Arguments passed ahead of every command.
    global_args: Vec<String>,
    /// The filesystem being operated on.
    fs_name: String,
    /// The timeout applied to each invocation.
    timeout: Duration,
}

impl CephCli {
    /// Create a new instance from the runtime config.
    pub fn new(config: &Config) -> Self {
        let mut global_args = vec![];
        if let Some(conf) = &config.ceph_conf {
            global_args.extend(["--conf".to_string(), conf.clone()]);
        }
        if let Some(id) = &config.ceph_client_id {
            global_args.extend(["--id".to_string(), id.clone()]);
        }
        global_args.extend(["--connect-timeout".to_string(), config.command_timeout_seconds.to_string()]);
        Self {
            bin: config.ceph_bin.clone(),
            global_args,
            fs_name: config.fs_name.clone(),
            timeout: config.command_timeout(),
        }
    }

    /// The filesystem being operated on.
    pub fn fs_name(&self) -> &str {
        &self.fs_name
    }

    /// Run the CLI with the given arguments, returning its stdout.
    async fn run(&self, args: &[String]) -> ControlResult<Vec<u8>> {
        let cmdline = format!("{} {}", self.bin, args.join(" "));
        let mut cmd = Command::new(&self.bin);
        cmd.args(&self.global_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(command = %cmdline, "invoking ceph CLI");
        let output = match timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(ControlPlaneError::Unavailable(anyhow::Error::new(err).context(format!("error spawning `{}`", cmdline)))),
            Err(_) => return Err(ControlPlaneError::Unavailable(anyhow!("timeout after {:?} waiting on `{}`", self.timeout, cmdline))),
        };
        if output.status.success() {
            return Ok(output.stdout);
        }
        Err(classify_failure(&cmdline, output.status.code(), &output.stderr))
    }

    /// Issue a `fs set` command for the given variable.
    async fn fs_set(&self, var: &str, val: String) -> ControlResult<()> {
        let args = vec!["fs".to_string(), "set".to_string(), self.fs_name.clone(), var.to_string(), val];
        self.run(&args).await.map(|_| ())
    }
}

#[async_trait]
impl StatusReader for CephCli {
    #[tracing::instrument(level = "debug", skip(self), fields(fs = %self.fs_name))]
    async fn read(&self) -> ControlResult<ClusterStatus> {
        let args = vec!["fs".to_string(), "dump".to_string(), "--format=json".to_string()];
        let data = self.run(&args).await?;
        parse_fs_dump(&data, &self.fs_name)
    }
}

#[async_trait]
impl ConfigCommander for CephCli {
    #[tracing::instrument(level = "debug", skip(self), fields(fs = %self.fs_name))]
    async fn set_max_ranks(&self, max_mds: u32) -> ControlResult<()> {
        if max_mds == 0 {
            return Err(ControlPlaneError::CommandRejected {
                command: format!("fs set {} max_mds 0", self.fs_name),
                reason: "max_mds must be at least 1".into(),
            });
        }
        self.fs_set("max_mds", max_mds.to_string()).await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(fs = %self.fs_name))]
    async fn set_standby_replay(&self, enabled: bool) -> ControlResult<()> {
        self.fs_set("allow_standby_replay", enabled.to_string()).await
    }
}

/// Classify a failed CLI invocation.
///
/// A missing exit code means the process was killed by a signal, which is treated as transient.
pub fn classify_failure(cmdline: &str, code: Option<i32>, stderr: &[u8]) -> ControlPlaneError {
    let reason = String::from_utf8_lossy(stderr).trim().to_string();
    match code {
        None => ControlPlaneError::Unavailable(anyhow!("`{}` was terminated by a signal: {}", cmdline, reason)),
        Some(code) if TRANSIENT_EXIT_CODES.contains(&code) => {
            ControlPlaneError::Unavailable(anyhow!("`{}` exited with code {}: {}", cmdline, code, reason))
        }
        Some(code) => ControlPlaneError::CommandRejected {
            command: cmdline.to_string(),
            reason: if reason.is_empty() { format!("exit code {}", code) } else { reason },
        },
    }
}

/// Map a daemon state string from the MDS map into a rank state.
///
/// Returns `Ok(None)` for states which do not hold a rank.
pub fn parse_rank_state(state: &str) -> ControlResult<Option<RankState>> {
    match state {
        "up:active" => Ok(Some(RankState::Active)),
        "up:stopping" => Ok(Some(RankState::Stopping)),
        "up:standby-replay" => Ok(Some(RankState::StandbyReplay)),
        "up:boot" | "up:creating" | "up:starting" | "up:replay" | "up:resolve" | "up:reconnect" | "up:rejoin" | "up:clientreplay" => {
            Ok(Some(RankState::Starting))
        }
        "up:standby" => Ok(None),
        other if other.starts_with("down:") => Ok(None),
        other => Err(ControlPlaneError::MalformedStatus(format!("unknown MDS state `{}`", other))),
    }
}

/// Parse the output of `ceph fs dump --format=json` into a snapshot of the named filesystem.
pub fn parse_fs_dump(data: &[u8], fs_name: &str) -> ControlResult<ClusterStatus> {
    let dump: FsDump = serde_json::from_slice(data).map_err(|err| ControlPlaneError::MalformedStatus(format!("error decoding fs dump: {}", err)))?;
    let fs = dump
        .filesystems
        .into_iter()
        .find(|fs| fs.mdsmap.fs_name == fs_name)
        .ok_or_else(|| ControlPlaneError::MalformedStatus(format!("filesystem `{}` not found in fs dump", fs_name)))?;
    let map = fs.mdsmap;

    let mut standbys: BTreeSet<String> = dump.standbys.into_iter().map(|info| info.name).collect();
    let mut ranks = Vec::with_capacity(map.info.len());
    for (key, info) in map.info {
        let state = match parse_rank_state(&info.state)? {
            Some(state) => state,
            None => {
                if info.state == "up:standby" {
                    standbys.insert(info.name);
                }
                continue;
            }
        };
        let rank = u32::try_from(info.rank).map_err(|_| {
            ControlPlaneError::MalformedStatus(format!("daemon {} ({}) in state {} has invalid rank {}", info.name, key, info.state, info.rank))
        })?;
        ranks.push(RankAssignment {
            rank,
            daemon: info.name,
            state,
        });
    }

    let allow_standby_replay = match map.flags_state {
        Some(flags) => flags.allow_standby_replay,
        None => map.flags & FLAG_ALLOW_STANDBY_REPLAY != 0,
    };
    ClusterStatus::new(
        map.fs_name,
        map.epoch,
        map.max_mds,
        allow_standby_replay,
        ranks,
        standbys,
        map.in_ranks.into_iter().collect(),
        map.failed.into_iter().collect(),
        map.damaged.into_iter().collect(),
    )
}

/// The subset of `ceph fs dump` output used here.
#[derive(Debug, Deserialize)]
struct FsDump {
    #[serde(default)]
    standbys: Vec<MdsInfo>,
    #[serde(default)]
    filesystems: Vec<Filesystem>,
}

#[derive(Debug, Deserialize)]
struct Filesystem {
    mdsmap: MdsMap,
}

#[derive(Debug, Deserialize)]
struct MdsMap {
    fs_name: String,
    epoch: u64,
    #[serde(default)]
    flags: u64,
    #[serde(default)]
    flags_state: Option<FlagsState>,
    max_mds: u32,
    #[serde(rename = "in", default)]
    in_ranks: Vec<u32>,
    #[serde(default)]
    failed: Vec<u32>,
    #[serde(default)]
    damaged: Vec<u32>,
    #[serde(default)]
    info: BTreeMap<String, MdsInfo>,
}

#[derive(Debug, Deserialize)]
struct FlagsState {
    #[serde(default)]
    allow_standby_replay: bool,
}

#[derive(Debug, Deserialize)]
struct MdsInfo {
    name: String,
    rank: i64,
    state: String,
}
