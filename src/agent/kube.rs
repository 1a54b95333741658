//! Cluster reconciler driving the worker set and the controller

use super::{materialize, record_outcome};
use crate::controlplane::{AgentQuery, ControlPlane};
use crate::error::SupervisorError;
use crate::metrics::SupervisorMetrics;
use crate::pipeline::DocumentBuilder;
use crate::reconcile::Reconciler;
use crate::rollout::{ClusterRollout, RolloutDriver, WorkloadKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Config group every cluster joins on its first healthy iteration
pub const DEFAULT_CONFIG_GROUP: &str = "default";

pub struct KubeReconciler {
    control_plane: Arc<dyn ControlPlane>,
    builder: DocumentBuilder,
    rollout: ClusterRollout,
    cluster_name: String,
    query: AgentQuery,
    config_group_applied: AtomicBool,
    metrics: Option<SupervisorMetrics>,
}

impl KubeReconciler {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        builder: DocumentBuilder,
        rollout: ClusterRollout,
        cluster_name: impl Into<String>,
        agent_version: &str,
    ) -> Self {
        let cluster_name = cluster_name.into();
        Self {
            control_plane,
            builder,
            rollout,
            query: AgentQuery::for_cluster(cluster_name.clone(), agent_version),
            cluster_name,
            config_group_applied: AtomicBool::new(false),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: SupervisorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Forward `enable_datadog_receiver` on ingestion-rules pulls
    pub fn with_datadog_receiver(mut self, enabled: bool) -> Self {
        self.query.enable_datadog_receiver = enabled;
        self
    }

    pub fn rollout(&self) -> &ClusterRollout {
        &self.rollout
    }

    async fn roll_out(&self, kind: WorkloadKind) -> Result<(), SupervisorError> {
        let flavor = kind.flavor();
        info!(workload = %kind, "Redeploying mw-agent {}", kind);
        let built = materialize(self.control_plane.as_ref(), &self.builder, flavor, &self.query).await?;
        self.rollout.apply_and_restart(&built.bytes, flavor).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_rollout(flavor.as_str());
        }
        Ok(())
    }

    async fn tick_inner(&self) -> Result<(), SupervisorError> {
        let flags = self.control_plane.fetch_rollout_flags(&self.query).await?;
        if flags.restart && !flags.rollout.daemonset && !flags.rollout.deployment {
            debug!("Ignoring restart flag, cluster rollouts follow the rollout flags only");
        }

        let outcome = self.roll_out_flagged(flags.rollout.daemonset, flags.rollout.deployment).await;
        // tied to the restart-status fetch, not to the rollouts that follow it
        self.apply_config_group_once().await;
        outcome
    }

    async fn roll_out_flagged(&self, daemonset: bool, deployment: bool) -> Result<(), SupervisorError> {
        // per-node workers first so the controller never runs ahead of them
        if daemonset {
            self.roll_out(WorkloadKind::WorkerSet).await?;
        }
        if deployment {
            self.roll_out(WorkloadKind::Controller).await?;
        }
        Ok(())
    }

    /// Join the default config group once per process lifetime
    async fn apply_config_group_once(&self) {
        if self.config_group_applied.swap(true, Ordering::SeqCst) {
            return;
        }

        let result = self
            .control_plane
            .apply_config_group(DEFAULT_CONFIG_GROUP, &self.cluster_name)
            .await;
        if let Some(metrics) = &self.metrics {
            metrics.record_config_group_apply(result.is_ok());
        }
        match result {
            Ok(()) => info!(cluster = %self.cluster_name, "Config group {} applied", DEFAULT_CONFIG_GROUP),
            Err(e) => warn!(cluster = %self.cluster_name, "Failed to apply config group: {}", e),
        }
    }
}

#[async_trait]
impl Reconciler for KubeReconciler {
    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    async fn bootstrap(&self) -> Result<(), SupervisorError> {
        let mut outcome = self.roll_out(WorkloadKind::WorkerSet).await;
        if outcome.is_ok() {
            outcome = self.roll_out(WorkloadKind::Controller).await;
        }
        record_outcome(self.metrics.as_ref(), &outcome);
        outcome
    }

    #[instrument(skip(self), fields(cluster = %self.cluster_name))]
    async fn tick(&self) -> Result<(), SupervisorError> {
        if let Some(metrics) = &self.metrics {
            metrics.record_tick();
        }
        let outcome = self.tick_inner().await;
        record_outcome(self.metrics.as_ref(), &outcome);
        outcome
    }
}
