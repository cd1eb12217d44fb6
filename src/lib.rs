//! Drive a CephFS MDS cluster to a target rank layout and confirm it.
//!
//! Before a rolling upgrade, a filesystem is reduced to a single active rank with standby-replay
//! disabled. Requesting that is easy; knowing when the cluster has actually gotten there is not,
//! as surplus ranks linger in `up:stopping` while their subtrees migrate. The
//! `ConvergenceController` issues the commands and then polls the MDS map until the target holds
//! with nothing left in flight, or until a deadline elapses.

pub mod config;
pub mod control;
pub mod converge;
pub mod error;
#[cfg(test)]
mod fixtures;
pub mod models;
pub mod retry;

pub use crate::config::Config;
pub use crate::control::{CephCli, ConfigCommander, StatusReader};
pub use crate::converge::{ConvergenceController, ConvergenceOutcome, ConvergenceReport};
pub use crate::error::{ControlPlaneError, ControlResult};
pub use crate::models::{ClusterStatus, Divergence, RankAssignment, RankState, TargetConfig};
pub use crate::retry::RetryPolicy;
