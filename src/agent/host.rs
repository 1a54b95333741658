//! Single-host reconciler

use super::{materialize, record_outcome};
use crate::controlplane::{AgentQuery, ControlPlane};
use crate::error::SupervisorError;
use crate::metrics::SupervisorMetrics;
use crate::pipeline::{DocumentBuilder, Flavor};
use crate::reconcile::Reconciler;
use crate::rollout::{HostRollout, RolloutDriver};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub struct HostReconciler {
    control_plane: Arc<dyn ControlPlane>,
    builder: DocumentBuilder,
    rollout: HostRollout,
    flavor: Flavor,
    query: AgentQuery,
    collector_running: Arc<AtomicBool>,
    metrics: Option<SupervisorMetrics>,
}

impl HostReconciler {
    pub fn new(
        control_plane: Arc<dyn ControlPlane>,
        builder: DocumentBuilder,
        rollout: HostRollout,
        flavor: Flavor,
        query: AgentQuery,
    ) -> Self {
        Self {
            control_plane,
            builder,
            rollout,
            flavor,
            query,
            collector_running: Arc::new(AtomicBool::new(false)),
            metrics: None,
        }
    }

    /// Share the engine's running flag so pulls report `col_running`
    pub fn with_collector_flag(mut self, running: Arc<AtomicBool>) -> Self {
        self.collector_running = running;
        self
    }

    pub fn with_metrics(mut self, metrics: SupervisorMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    pub fn collector_flag(&self) -> Arc<AtomicBool> {
        self.collector_running.clone()
    }

    fn query(&self) -> AgentQuery {
        let mut query = self.query.clone();
        query.collector_running = Some(self.collector_running.load(Ordering::SeqCst));
        query
    }

    async fn bootstrap_inner(&self) -> Result<(), SupervisorError> {
        let query = self.query();
        let built = materialize(self.control_plane.as_ref(), &self.builder, self.flavor, &query).await?;
        // the engine starts after bootstrap, so there is nothing to restart yet
        self.rollout.write_document(self.flavor, &built.bytes).await?;
        Ok(())
    }

    async fn tick_inner(&self) -> Result<(), SupervisorError> {
        let query = self.query();
        let flags = self.control_plane.fetch_rollout_flags(&query).await?;
        if !flags.restart {
            debug!("No restart requested");
            return Ok(());
        }

        info!(flavor = %self.flavor, "Restart requested, fetching updated configuration");
        let built = materialize(self.control_plane.as_ref(), &self.builder, self.flavor, &query).await?;
        self.rollout.apply_and_restart(&built.bytes, self.flavor).await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_rollout(self.flavor.as_str());
        }
        Ok(())
    }
}

#[async_trait]
impl Reconciler for HostReconciler {
    #[instrument(skip(self), fields(flavor = %self.flavor))]
    async fn bootstrap(&self) -> Result<(), SupervisorError> {
        let outcome = self.bootstrap_inner().await;
        record_outcome(self.metrics.as_ref(), &outcome);
        outcome
    }

    #[instrument(skip(self), fields(flavor = %self.flavor))]
    async fn tick(&self) -> Result<(), SupervisorError> {
        if let Some(metrics) = &self.metrics {
            metrics.record_tick();
        }
        let outcome = self.tick_inner().await;
        record_outcome(self.metrics.as_ref(), &outcome);
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::{ReceivedBundle, RolloutFlags};
    use crate::pipeline::BuildOptions;
    use crate::rollout::DocumentPaths;
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use tempfile::tempdir;

    const BUNDLE: &str = r#"{
        "status": true,
        "config": {
            "nodocker": {
                "receivers": {"otlp": {"protocols": {"grpc": {}}}},
                "processors": {"batch": {}},
                "exporters": {"otlphttp": {"endpoint": "https://example.middleware.io"}},
                "service": {"pipelines": {"metrics": {
                    "receivers": ["otlp"], "processors": ["batch"], "exporters": ["otlphttp"]
                }}}
            }
        }
    }"#;

    #[derive(Default)]
    struct FakeControlPlane {
        restart: bool,
        broken_document: bool,
        flag_calls: AtomicUsize,
        rule_calls: AtomicUsize,
        reports: Mutex<Vec<String>>,
        seen_running: Mutex<Vec<Option<bool>>>,
    }

    #[async_trait]
    impl ControlPlane for FakeControlPlane {
        async fn fetch_rollout_flags(&self, query: &AgentQuery) -> Result<RolloutFlags, SupervisorError> {
            self.flag_calls.fetch_add(1, Ordering::SeqCst);
            self.seen_running.lock().unwrap().push(query.collector_running);
            Ok(RolloutFlags {
                status: true,
                restart: self.restart,
                ..Default::default()
            })
        }

        async fn fetch_ingestion_rules(
            &self,
            _flavor: Flavor,
            _query: &AgentQuery,
        ) -> Result<ReceivedBundle, SupervisorError> {
            self.rule_calls.fetch_add(1, Ordering::SeqCst);
            let mut bundle: ReceivedBundle = serde_json::from_str(BUNDLE).unwrap();
            if self.broken_document {
                // pipeline points at an exporter that does not exist
                let doc = bundle.config.nodocker.as_mut().unwrap();
                doc.remove("exporters");
                doc.insert("exporters".into(), serde_yaml::Value::Mapping(Default::default()));
            }
            Ok(bundle)
        }

        async fn apply_config_group(&self, _group: &str, _cluster_id: &str) -> Result<(), SupervisorError> {
            unreachable!("single-host agents never join config groups")
        }

        async fn report_invalid_config(&self, _query: &AgentQuery, reason: &str) -> Result<(), SupervisorError> {
            self.reports.lock().unwrap().push(reason.to_string());
            Ok(())
        }
    }

    fn reconciler(
        control_plane: Arc<FakeControlPlane>,
        root: &std::path::Path,
    ) -> (HostReconciler, Arc<AtomicUsize>) {
        let restarts = Arc::new(AtomicUsize::new(0));
        let counter = restarts.clone();
        let rollout = HostRollout::new(DocumentPaths::new(root)).with_restart_hook(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let reconciler = HostReconciler::new(
            control_plane,
            DocumentBuilder::new(BuildOptions::default()),
            rollout,
            Flavor::NoDocker,
            AgentQuery::for_host("web-1", "1.0.0"),
        );
        (reconciler, restarts)
    }

    #[tokio::test]
    async fn test_bootstrap_writes_without_restart() {
        let temp_dir = tempdir().unwrap();
        let control_plane = Arc::new(FakeControlPlane::default());
        let (reconciler, restarts) = reconciler(control_plane.clone(), temp_dir.path());

        reconciler.bootstrap().await.unwrap();

        let path = DocumentPaths::new(temp_dir.path()).for_flavor(Flavor::NoDocker).unwrap();
        assert!(fs::read_to_string(path).unwrap().contains("otlphttp"));
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
        assert_eq!(control_plane.flag_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tick_without_restart_flag_is_a_noop() {
        let temp_dir = tempdir().unwrap();
        let control_plane = Arc::new(FakeControlPlane::default());
        let (reconciler, restarts) = reconciler(control_plane.clone(), temp_dir.path());

        reconciler.tick().await.unwrap();

        assert_eq!(control_plane.flag_calls.load(Ordering::SeqCst), 1);
        assert_eq!(control_plane.rule_calls.load(Ordering::SeqCst), 0);
        assert_eq!(restarts.load(Ordering::SeqCst), 0);
        assert_eq!(*control_plane.seen_running.lock().unwrap(), vec![Some(false)]);
    }

    #[tokio::test]
    async fn test_tick_with_restart_flag_rolls_out() {
        let temp_dir = tempdir().unwrap();
        let control_plane = Arc::new(FakeControlPlane {
            restart: true,
            ..Default::default()
        });
        let (reconciler, restarts) = reconciler(control_plane.clone(), temp_dir.path());
        reconciler.collector_flag().store(true, Ordering::SeqCst);

        reconciler.tick().await.unwrap();

        assert_eq!(control_plane.rule_calls.load(Ordering::SeqCst), 1);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
        assert_eq!(*control_plane.seen_running.lock().unwrap(), vec![Some(true)]);
    }

    #[tokio::test]
    async fn test_invalid_document_is_reported_and_not_written() {
        let temp_dir = tempdir().unwrap();
        let control_plane = Arc::new(FakeControlPlane {
            restart: true,
            broken_document: true,
            ..Default::default()
        });
        let (reconciler, restarts) = reconciler(control_plane.clone(), temp_dir.path());

        let err = reconciler.tick().await.unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidConfig(_)));
        assert_eq!(control_plane.reports.lock().unwrap().len(), 1);
        assert_eq!(restarts.load(Ordering::SeqCst), 0);

        let path = DocumentPaths::new(temp_dir.path()).for_flavor(Flavor::NoDocker).unwrap();
        assert!(!path.exists());
    }
}
