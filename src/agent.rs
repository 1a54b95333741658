//! Per-deployment reconcilers
//!
//! Both variants share one shape: fetch rollout flags, pull the flagged
//! documents, build them and hand them to a rollout driver. They differ in
//! which flags they honor and where documents land.

pub mod host;
pub mod kube;

pub use self::host::HostReconciler;
pub use self::kube::KubeReconciler;

use crate::controlplane::{AgentQuery, ControlPlane};
use crate::error::SupervisorError;
use crate::metrics::SupervisorMetrics;
use crate::pipeline::{BuiltDocument, DocumentBuilder, Flavor};
use tracing::{error, info};

/// Pull and build one flavor, reporting validation failures to the control plane
///
/// A rejected document never reaches the rollout driver, so whatever the
/// engine runs now stays in place.
pub(crate) async fn materialize(
    control_plane: &dyn ControlPlane,
    builder: &DocumentBuilder,
    flavor: Flavor,
    query: &AgentQuery,
) -> Result<BuiltDocument, SupervisorError> {
    let bundle = control_plane.fetch_ingestion_rules(flavor, query).await?;

    match builder.build(&bundle, flavor) {
        Ok(built) => Ok(built),
        Err(SupervisorError::InvalidConfig(reason)) => {
            error!(flavor = %flavor, "Rejected pipeline document: {}", reason);
            if let Err(e) = control_plane.report_invalid_config(query, &reason).await {
                error!("Failed to report invalid config: {}", e);
            } else {
                info!(flavor = %flavor, "Invalid config reported");
            }
            Err(SupervisorError::InvalidConfig(reason))
        }
        Err(e) => Err(e),
    }
}

/// Count one finished iteration
pub(crate) fn record_outcome(metrics: Option<&SupervisorMetrics>, outcome: &Result<(), SupervisorError>) {
    if let (Some(metrics), Err(e)) = (metrics, outcome) {
        metrics.record_failure(e.kind());
    }
}
