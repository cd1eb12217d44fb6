//! Cluster data models.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};

use crate::error::{ControlPlaneError, ControlResult};

/// The state of a daemon holding a rank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RankState {
    /// The daemon is serving its rank.
    Active,
    /// The daemon is handing off its subtrees and will leave the map.
    Stopping,
    /// The daemon is coming up to serve its rank (replay, resolve, rejoin &c).
    Starting,
    /// The daemon is tailing the journal of the rank it follows.
    StandbyReplay,
}

impl RankState {
    /// Check if this state is an intermediate state which must not be observed once converged.
    pub fn is_transitional(self) -> bool {
        matches!(self, Self::Stopping | Self::Starting)
    }
}

impl fmt::Display for RankState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Stopping => write!(f, "stopping"),
            Self::Starting => write!(f, "starting"),
            Self::StandbyReplay => write!(f, "standby-replay"),
        }
    }
}

/// A daemon holding a rank.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankAssignment {
    /// The rank held by the daemon, or followed by it when in standby-replay.
    pub rank: u32,
    /// The ID of the daemon.
    pub daemon: String,
    /// The daemon's state.
    pub state: RankState,
}

/// An immutable snapshot of a filesystem's MDS map.
///
/// Snapshots are built fresh on every read. Nothing is carried over between reads.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ClusterStatus {
    /// The name of the filesystem.
    pub fs_name: String,
    /// The epoch of the map from which this snapshot was built.
    pub epoch: u64,
    /// The live `max_mds` value of the filesystem.
    pub max_mds: u32,
    /// The live `allow_standby_replay` flag of the filesystem.
    pub allow_standby_replay: bool,
    /// All rank assignments, ordered by rank, with the rank holder ahead of its followers.
    ranks: Vec<RankAssignment>,
    /// Daemons which do not hold a rank.
    standbys: BTreeSet<String>,
    /// Ranks which are currently `in` the map.
    in_ranks: BTreeSet<u32>,
    /// Ranks which have failed and are awaiting a daemon.
    failed: BTreeSet<u32>,
    /// Ranks which have been marked damaged.
    damaged: BTreeSet<u32>,
}

impl ClusterStatus {
    /// Build a new snapshot, validating the uniqueness of rank holders.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs_name: String, epoch: u64, max_mds: u32, allow_standby_replay: bool, mut ranks: Vec<RankAssignment>, standbys: BTreeSet<String>,
        in_ranks: BTreeSet<u32>, failed: BTreeSet<u32>, damaged: BTreeSet<u32>,
    ) -> ControlResult<Self> {
        let mut holders: HashMap<u32, &str> = HashMap::new();
        for assignment in ranks.iter().filter(|a| a.state != RankState::StandbyReplay) {
            if let Some(other) = holders.insert(assignment.rank, assignment.daemon.as_str()) {
                return Err(ControlPlaneError::MalformedStatus(format!(
                    "rank {} is held by both {} and {}",
                    assignment.rank, other, assignment.daemon
                )));
            }
        }
        ranks.sort_by(|a, b| {
            a.rank
                .cmp(&b.rank)
                .then_with(|| (a.state == RankState::StandbyReplay).cmp(&(b.state == RankState::StandbyReplay)))
                .then_with(|| a.daemon.cmp(&b.daemon))
        });
        Ok(Self {
            fs_name,
            epoch,
            max_mds,
            allow_standby_replay,
            ranks,
            standbys,
            in_ranks,
            failed,
            damaged,
        })
    }

    /// All rank assignments, ordered by rank.
    pub fn ranks(&self) -> &[RankAssignment] {
        &self.ranks
    }

    /// Daemons which do not hold a rank.
    pub fn standbys(&self) -> &BTreeSet<String> {
        &self.standbys
    }

    /// Ranks which are currently `in` the map.
    pub fn in_ranks(&self) -> &BTreeSet<u32> {
        &self.in_ranks
    }

    /// Ranks which have failed.
    pub fn failed(&self) -> &BTreeSet<u32> {
        &self.failed
    }

    /// Ranks which are damaged.
    pub fn damaged(&self) -> &BTreeSet<u32> {
        &self.damaged
    }

    /// The number of ranks in state `active`.
    pub fn active_count(&self) -> u32 {
        self.ranks.iter().filter(|a| a.state == RankState::Active).count() as u32
    }

    /// The set of ranks in state `active`.
    pub fn active_ranks(&self) -> BTreeSet<u32> {
        self.ranks.iter().filter(|a| a.state == RankState::Active).map(|a| a.rank).collect()
    }

    /// The number of daemons in state `standby-replay`.
    pub fn standby_replay_count(&self) -> u32 {
        self.ranks.iter().filter(|a| a.state == RankState::StandbyReplay).count() as u32
    }

    /// Iterate over all assignments in a transitional state.
    pub fn transitional(&self) -> impl Iterator<Item = &RankAssignment> + '_ {
        self.ranks.iter().filter(|a| a.state.is_transitional())
    }

    /// Compute the first reason this snapshot is not converged to the given target, if any.
    pub fn divergence(&self, target: &TargetConfig) -> Option<Divergence> {
        if self.max_mds != target.max_mds() {
            return Some(Divergence::MaxMds {
                observed: self.max_mds,
                target: target.max_mds(),
            });
        }
        let active = self.active_count();
        if active != target.max_mds() {
            return Some(Divergence::ActiveCount {
                observed: active,
                target: target.max_mds(),
            });
        }
        if let Some(assignment) = self.transitional().next() {
            return Some(Divergence::Transitional {
                rank: assignment.rank,
                daemon: assignment.daemon.clone(),
                state: assignment.state,
            });
        }
        let replay = self.standby_replay_count();
        if !target.allow_standby_replay() && replay > 0 {
            return Some(Divergence::StandbyReplay { count: replay });
        }
        if let Some(rank) = self.failed.iter().chain(self.damaged.iter()).next() {
            return Some(Divergence::Unhealthy { rank: *rank });
        }
        let expected: BTreeSet<u32> = (0..target.max_mds()).collect();
        let observed = self.active_ranks();
        if observed != expected {
            return Some(Divergence::NonContiguous { observed });
        }
        if self.in_ranks != expected {
            return Some(Divergence::InRanks {
                observed: self.in_ranks.clone(),
            });
        }
        None
    }

    /// Check if this snapshot is converged to the given target.
    pub fn is_converged(&self, target: &TargetConfig) -> bool {
        self.divergence(target).is_none()
    }
}

/// The reason a snapshot is not yet converged to a target.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Divergence {
    /// The map's own `max_mds` differs from the target.
    MaxMds { observed: u32, target: u32 },
    /// The number of active ranks differs from the target.
    ActiveCount { observed: u32, target: u32 },
    /// A rank is still moving between states.
    Transitional { rank: u32, daemon: String, state: RankState },
    /// Standby-replay daemons exist though the target disallows them.
    StandbyReplay { count: u32 },
    /// A rank is failed or damaged.
    Unhealthy { rank: u32 },
    /// The active ranks do not form the set `[0, max_mds)`.
    NonContiguous { observed: BTreeSet<u32> },
    /// The ranks `in` the map do not form the set `[0, max_mds)`.
    InRanks { observed: BTreeSet<u32> },
}

impl fmt::Display for Divergence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxMds { observed, target } => write!(f, "map max_mds is {}, target is {}", observed, target),
            Self::ActiveCount { observed, target } => write!(f, "{} active ranks, waiting for {}", observed, target),
            Self::Transitional { rank, daemon, state } => write!(f, "rank {} ({}) is {}", rank, daemon, state),
            Self::StandbyReplay { count } => write!(f, "{} standby-replay daemons remain", count),
            Self::Unhealthy { rank } => write!(f, "rank {} is failed or damaged", rank),
            Self::NonContiguous { observed } => write!(f, "active ranks {:?} are not contiguous from 0", observed),
            Self::InRanks { observed } => write!(f, "ranks {:?} are in the map", observed),
        }
    }
}

/// The configuration which a cluster is to be driven to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct TargetConfig {
    max_mds: u32,
    allow_standby_replay: bool,
}

impl TargetConfig {
    /// Create a new target, validating given inputs.
    pub fn new(max_mds: u32, allow_standby_replay: bool) -> Result<Self> {
        ensure!(max_mds >= 1, "max_mds must be at least 1, got {}", max_mds);
        Ok(Self { max_mds, allow_standby_replay })
    }

    /// The target used to prepare a filesystem for upgrade: a single rank, no standby-replay.
    pub fn upgrade_prep() -> Self {
        Self {
            max_mds: 1,
            allow_standby_replay: false,
        }
    }

    /// The desired number of active ranks.
    pub fn max_mds(&self) -> u32 {
        self.max_mds
    }

    /// Whether standby-replay daemons are permitted.
    pub fn allow_standby_replay(&self) -> bool {
        self.allow_standby_replay
    }
}
