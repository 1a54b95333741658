//! Control-plane client
//!
//! Two pulls (`restart-status`, `ingestion-rules`) and two pushes
//! (config-group apply, invalid-config tracking) against the tenant's
//! control-plane API.

pub mod client;
pub mod types;

pub use client::HttpControlPlane;
pub use types::{
    AgentQuery, IntegrationConfig, IntegrationKind, ReceivedBundle, RolloutFlags,
    WorkloadRolloutFlags,
};

use crate::error::SupervisorError;
use crate::pipeline::Flavor;
use async_trait::async_trait;

#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Ask whether a restart or rollout has been announced
    async fn fetch_rollout_flags(&self, query: &AgentQuery) -> Result<RolloutFlags, SupervisorError>;

    /// Fetch the pipeline document bundle for one flavor
    async fn fetch_ingestion_rules(
        &self,
        flavor: Flavor,
        query: &AgentQuery,
    ) -> Result<ReceivedBundle, SupervisorError>;

    /// Attach this cluster to a named config group
    async fn apply_config_group(&self, group: &str, cluster_id: &str) -> Result<(), SupervisorError>;

    /// Tell the control plane a delivered document was rejected locally
    async fn report_invalid_config(&self, query: &AgentQuery, reason: &str) -> Result<(), SupervisorError>;
}
