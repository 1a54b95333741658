//! mw-agent - telemetry agent supervisor
//!
//! Pulls pipeline documents from the tenant's control plane, enriches them
//! with local facts and rolls them out, either to a collector running on
//! this host or to the agent workloads of a cluster.

pub mod agent;
pub mod config;
pub mod controlplane;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod platform;
pub mod reconcile;
pub mod rollout;
pub mod target;

pub use error::SupervisorError;

/// Version reported to the control plane
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
