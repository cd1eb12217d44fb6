//! An in-memory control plane which simulates an MDS cluster.
//!
//! Commands only record intent. The simulated cluster moves one step towards the commanded
//! configuration on every status read: surplus ranks go `stopping` and leave the map after a
//! configurable number of reads, missing ranks are filled from standbys via `starting`, and
//! standby-replay followers come and go with the `allow_standby_replay` flag.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::control::{ConfigCommander, StatusReader};
use crate::error::{ControlPlaneError, ControlResult};
use crate::models::{ClusterStatus, RankAssignment, RankState};

/// A command received by the fake control plane.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    SetMaxRanks(u32),
    SetStandbyReplay(bool),
}

/// A change made to the cluster by some other actor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalChange {
    SetMaxRanks(u32),
    SetStandbyReplay(bool),
}

/// A fake cluster, shared between the test body and the controller under test.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<FakeState>,
}

#[derive(Default)]
struct FakeState {
    epoch: u64,
    max_mds: u32,
    allow_standby_replay: bool,
    ranks: Vec<RankAssignment>,
    standbys: BTreeSet<String>,
    /// Reads spent in the current transitional state, by daemon.
    progress: HashMap<String, u32>,
    /// Reads a daemon spends stopping or starting; `None` means forever.
    transition_reads: Option<u32>,
    reads: u32,
    commands: Vec<Command>,
    served: Vec<ClusterStatus>,
    read_faults: VecDeque<ControlPlaneError>,
    command_faults: VecDeque<ControlPlaneError>,
    changes: Vec<(u32, ExternalChange)>,
}

impl FakeCluster {
    /// A settled cluster with `active` ranks, the given standbys, and `max_mds == active`.
    pub fn new(active: u32, standbys: &[&str]) -> Arc<Self> {
        let ranks = (0..active)
            .map(|rank| RankAssignment {
                rank,
                daemon: format!("mds{}", rank),
                state: RankState::Active,
            })
            .collect();
        Arc::new(Self {
            state: Mutex::new(FakeState {
                epoch: 1,
                max_mds: active,
                ranks,
                standbys: standbys.iter().map(|name| name.to_string()).collect(),
                transition_reads: Some(2),
                ..Default::default()
            }),
        })
    }

    /// Enable standby-replay, turning one standby into a follower of rank 0.
    pub fn with_standby_replay(self: Arc<Self>) -> Arc<Self> {
        {
            let mut state = self.lock();
            state.allow_standby_replay = true;
            state.fill_followers();
        }
        self
    }

    /// Set the number of reads a daemon spends stopping or starting, `None` for forever.
    pub fn with_transition_reads(self: Arc<Self>, reads: Option<u32>) -> Arc<Self> {
        self.lock().transition_reads = reads;
        self
    }

    /// Fail the next reads with the given errors, in order.
    pub fn fail_reads(&self, errors: impl IntoIterator<Item = ControlPlaneError>) {
        self.lock().read_faults.extend(errors);
    }

    /// Fail the next commands with the given errors, in order.
    pub fn fail_commands(&self, errors: impl IntoIterator<Item = ControlPlaneError>) {
        self.lock().command_faults.extend(errors);
    }

    /// Apply the given change just before serving read number `read` (1-indexed).
    pub fn change_on_read(&self, read: u32, change: ExternalChange) {
        self.lock().changes.push((read, change));
    }

    /// All commands accepted so far.
    pub fn commands(&self) -> Vec<Command> {
        self.lock().commands.clone()
    }

    /// All snapshots served by successful reads, in order.
    pub fn served(&self) -> Vec<ClusterStatus> {
        self.lock().served.clone()
    }

    /// The number of reads served, including failed ones.
    pub fn reads(&self) -> u32 {
        self.lock().reads
    }

    /// The commanded `max_mds` and `allow_standby_replay` values.
    pub fn settings(&self) -> (u32, bool) {
        let state = self.lock();
        (state.max_mds, state.allow_standby_replay)
    }

    /// Build a snapshot without advancing the simulation.
    pub fn peek(&self) -> ClusterStatus {
        self.lock().snapshot().expect("fake cluster produced an invalid snapshot")
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake cluster mutex poisoned")
    }
}

impl FakeState {
    /// Move the simulated cluster one step towards its commanded configuration.
    fn step(&mut self) {
        let limit = self.transition_reads;
        let mut settled = vec![];
        for assignment in self.ranks.iter().filter(|a| a.state.is_transitional()) {
            let spent = self.progress.entry(assignment.daemon.clone()).or_insert(0);
            *spent += 1;
            if limit.map(|limit| *spent >= limit).unwrap_or(false) {
                settled.push(assignment.daemon.clone());
            }
        }
        for daemon in settled {
            self.progress.remove(&daemon);
            let pos = match self.ranks.iter().position(|a| a.daemon == daemon) {
                Some(pos) => pos,
                None => continue,
            };
            let state = self.ranks[pos].state;
            match state {
                RankState::Stopping => {
                    let stopped = self.ranks.remove(pos);
                    self.release_followers(stopped.rank);
                    self.standbys.insert(stopped.daemon);
                }
                _ => self.ranks[pos].state = RankState::Active,
            }
            self.epoch += 1;
        }

        if !self.allow_standby_replay {
            let followers: Vec<u32> = self.ranks.iter().filter(|a| a.state == RankState::StandbyReplay).map(|a| a.rank).collect();
            for rank in followers {
                self.release_followers(rank);
                self.epoch += 1;
            }
        }
        for assignment in self.ranks.iter_mut() {
            let surplus = assignment.rank >= self.max_mds;
            if surplus && matches!(assignment.state, RankState::Active | RankState::Starting) {
                assignment.state = RankState::Stopping;
                self.progress.remove(&assignment.daemon);
                self.epoch += 1;
            }
        }
        for rank in 0..self.max_mds {
            let held = self.ranks.iter().any(|a| a.rank == rank && a.state != RankState::StandbyReplay);
            if held {
                continue;
            }
            let daemon = match self.standbys.iter().next().cloned() {
                Some(daemon) => daemon,
                None => break,
            };
            self.standbys.remove(&daemon);
            self.ranks.push(RankAssignment {
                rank,
                daemon,
                state: RankState::Starting,
            });
            self.epoch += 1;
        }
        if self.allow_standby_replay {
            self.fill_followers();
        }
    }

    /// Give every active rank without a follower a standby-replay daemon, while standbys last.
    fn fill_followers(&mut self) {
        let unfollowed: Vec<u32> = self
            .ranks
            .iter()
            .filter(|a| a.state == RankState::Active)
            .map(|a| a.rank)
            .filter(|rank| !self.ranks.iter().any(|a| a.rank == *rank && a.state == RankState::StandbyReplay))
            .collect();
        for rank in unfollowed {
            let daemon = match self.standbys.iter().next().cloned() {
                Some(daemon) => daemon,
                None => return,
            };
            self.standbys.remove(&daemon);
            self.ranks.push(RankAssignment {
                rank,
                daemon,
                state: RankState::StandbyReplay,
            });
            self.epoch += 1;
        }
    }

    /// Return the standby-replay followers of the given rank to the standby pool.
    fn release_followers(&mut self, rank: u32) {
        let (released, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut self.ranks)
            .into_iter()
            .partition(|a| a.rank == rank && a.state == RankState::StandbyReplay);
        self.ranks = kept;
        self.standbys.extend(released.into_iter().map(|a| a.daemon));
    }

    fn snapshot(&self) -> ControlResult<ClusterStatus> {
        let in_ranks = self.ranks.iter().filter(|a| a.state != RankState::StandbyReplay).map(|a| a.rank).collect();
        ClusterStatus::new(
            "cephfs".into(),
            self.epoch,
            self.max_mds,
            self.allow_standby_replay,
            self.ranks.clone(),
            self.standbys.clone(),
            in_ranks,
            BTreeSet::new(),
            BTreeSet::new(),
        )
    }

    fn take_command_fault(&mut self) -> ControlResult<()> {
        match self.command_faults.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl StatusReader for FakeCluster {
    async fn read(&self) -> ControlResult<ClusterStatus> {
        let mut state = self.lock();
        state.reads += 1;
        if let Some(err) = state.read_faults.pop_front() {
            return Err(err);
        }
        let read = state.reads;
        let due: Vec<ExternalChange> = state.changes.iter().filter(|(at, _)| *at == read).map(|(_, change)| *change).collect();
        for change in due {
            match change {
                ExternalChange::SetMaxRanks(max_mds) => state.max_mds = max_mds,
                ExternalChange::SetStandbyReplay(enabled) => state.allow_standby_replay = enabled,
            }
        }
        state.step();
        let status = state.snapshot()?;
        state.served.push(status.clone());
        Ok(status)
    }
}

#[async_trait]
impl ConfigCommander for FakeCluster {
    async fn set_max_ranks(&self, max_mds: u32) -> ControlResult<()> {
        let mut state = self.lock();
        state.take_command_fault()?;
        if max_mds == 0 {
            return Err(ControlPlaneError::CommandRejected {
                command: "fs set cephfs max_mds 0".into(),
                reason: "max_mds must be at least 1".into(),
            });
        }
        state.commands.push(Command::SetMaxRanks(max_mds));
        state.max_mds = max_mds;
        Ok(())
    }

    async fn set_standby_replay(&self, enabled: bool) -> ControlResult<()> {
        let mut state = self.lock();
        state.take_command_fault()?;
        state.commands.push(Command::SetStandbyReplay(enabled));
        state.allow_standby_replay = enabled;
        Ok(())
    }
}
