//! Rollout drivers
//!
//! Apply a materialized pipeline document and make the engine pick it up:
//! a file write plus hang-up signal on a single host, a config object upsert
//! plus pod-template label bump in a cluster.

pub mod cluster;
pub mod host;

pub use cluster::{ClusterApi, ClusterRollout, KubeClusterApi, WorkloadHandle, WorkloadKind};
pub use host::{DocumentPaths, HostRollout};

use crate::error::SupervisorError;
use crate::pipeline::Flavor;
use async_trait::async_trait;
use std::fmt;

#[async_trait]
pub trait RolloutDriver: Send + Sync {
    /// Store `document` for `flavor` and restart whatever consumes it
    async fn apply_and_restart(&self, document: &[u8], flavor: Flavor) -> Result<(), SupervisorError>;
}

/// Progress of one rollout target within a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RolloutState {
    #[default]
    Idle,
    Pending,
    ConfigWritten,
    Restarted,
}

impl fmt::Display for RolloutState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RolloutState::Idle => "idle",
            RolloutState::Pending => "pending",
            RolloutState::ConfigWritten => "config-written",
            RolloutState::Restarted => "restarted",
        };
        f.write_str(name)
    }
}
