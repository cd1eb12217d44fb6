//! Control plane interfaces.
//!
//! The convergence controller never talks to a cluster directly. It reads snapshots through a
//! `StatusReader` and issues configuration changes through a `ConfigCommander`. Commands are
//! requests: a successful return means the control plane accepted the change, not that the
//! cluster has applied it.

pub mod ceph;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ControlResult;
use crate::models::ClusterStatus;

pub use ceph::CephCli;

/// A reader of cluster status snapshots.
#[async_trait]
pub trait StatusReader: Send + Sync {
    /// Fetch a fresh snapshot of the cluster's map.
    ///
    /// This must be free of side effects.
    async fn read(&self) -> ControlResult<ClusterStatus>;
}

/// An issuer of idempotent configuration change commands.
#[async_trait]
pub trait ConfigCommander: Send + Sync {
    /// Request that the filesystem's maximum number of active ranks be set to `max_mds`.
    async fn set_max_ranks(&self, max_mds: u32) -> ControlResult<()>;

    /// Request that standby-replay daemons be allowed or disallowed.
    async fn set_standby_replay(&self, enabled: bool) -> ControlResult<()>;
}

#[async_trait]
impl<T: StatusReader + ?Sized> StatusReader for Arc<T> {
    async fn read(&self) -> ControlResult<ClusterStatus> {
        (**self).read().await
    }
}

#[async_trait]
impl<T: ConfigCommander + ?Sized> ConfigCommander for Arc<T> {
    async fn set_max_ranks(&self, max_mds: u32) -> ControlResult<()> {
        (**self).set_max_ranks(max_mds).await
    }

    async fn set_standby_replay(&self, enabled: bool) -> ControlResult<()> {
        (**self).set_standby_replay(enabled).await
    }
}
