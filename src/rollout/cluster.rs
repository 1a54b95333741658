//! Cluster rollout: config object upsert plus pod-template label bump
//!
//! The per-node worker set (DaemonSet) and the single-replica controller
//! (Deployment) are two [`WorkloadHandle`]s driven through the same code path.

use super::{RolloutDriver, RolloutState};
use crate::error::SupervisorError;
use crate::pipeline::Flavor;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::core::v1::{ConfigMap, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Data key holding the pipeline document in each config object
pub const CONFIG_DATA_KEY: &str = "otel-config";
/// Pod-template label bumped to force a rolling restart
pub const RESTART_LABEL: &str = "timestamp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    /// One pod per node
    WorkerSet,
    /// Single replica per cluster
    Controller,
}

impl WorkloadKind {
    pub fn flavor(&self) -> Flavor {
        match self {
            WorkloadKind::WorkerSet => Flavor::DaemonSet,
            WorkloadKind::Controller => Flavor::Deployment,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.flavor().as_str())
    }
}

/// A cluster workload paired with the config object it reads its document from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadHandle {
    pub kind: WorkloadKind,
    pub workload_name: String,
    pub config_object_name: String,
}

impl WorkloadHandle {
    pub fn new(kind: WorkloadKind, workload_name: impl Into<String>, config_object_name: impl Into<String>) -> Self {
        Self {
            kind,
            workload_name: workload_name.into(),
            config_object_name: config_object_name.into(),
        }
    }
}

/// Orchestrator operations the rollout needs, scoped to the agent namespace
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, SupervisorError>;

    async fn create_config_map(&self, config_map: ConfigMap) -> Result<(), SupervisorError>;

    /// Replace an existing object; the resource version it carries guards the write
    async fn replace_config_map(&self, config_map: ConfigMap) -> Result<(), SupervisorError>;

    async fn set_template_label(
        &self,
        kind: WorkloadKind,
        workload_name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SupervisorError>;
}

pub struct KubeClusterApi {
    config_maps: Api<ConfigMap>,
    daemon_sets: Api<DaemonSet>,
    deployments: Api<Deployment>,
}

impl KubeClusterApi {
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            config_maps: Api::namespaced(client.clone(), namespace),
            daemon_sets: Api::namespaced(client.clone(), namespace),
            deployments: Api::namespaced(client, namespace),
        }
    }
}

/// Map orchestrator failures onto the error taxonomy
///
/// Conflicts, throttling and server errors are retried on the next tick.
fn orchestrator_error(context: String, err: kube::Error) -> SupervisorError {
    let code = match &err {
        kube::Error::Api(response) => Some(response.code),
        _ => None,
    };
    match code {
        Some(code) if code == 409 || code == 429 || code >= 500 => SupervisorError::transient(context, err),
        Some(_) => SupervisorError::Orchestrator {
            context,
            source: Box::new(err),
        },
        None => SupervisorError::transient(context, err),
    }
}

async fn bump_label<K, F>(
    api: &Api<K>,
    name: &str,
    key: &str,
    value: &str,
    template: F,
) -> Result<(), SupervisorError>
where
    K: Clone + DeserializeOwned + Serialize + fmt::Debug,
    F: FnOnce(&mut K) -> &mut PodTemplateSpec,
{
    let mut workload = api
        .get(name)
        .await
        .map_err(|e| orchestrator_error(format!("failed to get workload {name}"), e))?;

    template(&mut workload)
        .metadata
        .get_or_insert_with(ObjectMeta::default)
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(key.to_string(), value.to_string());

    api.replace(name, &PostParams::default(), &workload)
        .await
        .map_err(|e| orchestrator_error(format!("failed to update workload {name}"), e))?;
    Ok(())
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, SupervisorError> {
        self.config_maps
            .get_opt(name)
            .await
            .map_err(|e| orchestrator_error(format!("failed to get configmap {name}"), e))
    }

    async fn create_config_map(&self, config_map: ConfigMap) -> Result<(), SupervisorError> {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.config_maps
            .create(&PostParams::default(), &config_map)
            .await
            .map_err(|e| orchestrator_error(format!("failed to create configmap {name}"), e))?;
        Ok(())
    }

    async fn replace_config_map(&self, config_map: ConfigMap) -> Result<(), SupervisorError> {
        let name = config_map.metadata.name.clone().unwrap_or_default();
        self.config_maps
            .replace(&name, &PostParams::default(), &config_map)
            .await
            .map_err(|e| orchestrator_error(format!("failed to update configmap {name}"), e))?;
        Ok(())
    }

    async fn set_template_label(
        &self,
        kind: WorkloadKind,
        workload_name: &str,
        key: &str,
        value: &str,
    ) -> Result<(), SupervisorError> {
        match kind {
            WorkloadKind::WorkerSet => {
                bump_label(&self.daemon_sets, workload_name, key, value, |ds| {
                    &mut ds.spec.get_or_insert_with(Default::default).template
                })
                .await
            }
            WorkloadKind::Controller => {
                bump_label(&self.deployments, workload_name, key, value, |d| {
                    &mut d.spec.get_or_insert_with(Default::default).template
                })
                .await
            }
        }
    }
}

/// Rolls a document out to one of the two cluster workloads
pub struct ClusterRollout {
    api: Arc<dyn ClusterApi>,
    worker_set: WorkloadHandle,
    controller: WorkloadHandle,
    states: Mutex<HashMap<WorkloadKind, RolloutState>>,
}

impl ClusterRollout {
    pub fn new(api: Arc<dyn ClusterApi>, worker_set: WorkloadHandle, controller: WorkloadHandle) -> Self {
        Self {
            api,
            worker_set,
            controller,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn handle(&self, kind: WorkloadKind) -> &WorkloadHandle {
        match kind {
            WorkloadKind::WorkerSet => &self.worker_set,
            WorkloadKind::Controller => &self.controller,
        }
    }

    pub fn state(&self, kind: WorkloadKind) -> RolloutState {
        self.states
            .lock()
            .map(|states| states.get(&kind).copied().unwrap_or_default())
            .unwrap_or_default()
    }

    fn set_state(&self, kind: WorkloadKind, state: RolloutState) {
        if let Ok(mut states) = self.states.lock() {
            debug!(workload = %kind, state = %state, "Rollout state changed");
            states.insert(kind, state);
        }
    }

    /// Current document stored in the handle's config object
    pub async fn read_config_object(&self, handle: &WorkloadHandle) -> Result<Option<String>, SupervisorError> {
        let config_map = self.api.get_config_map(&handle.config_object_name).await?;
        Ok(config_map
            .and_then(|cm| cm.data)
            .and_then(|mut data| data.remove(CONFIG_DATA_KEY)))
    }

    /// Create the config object, or replace its document entry
    pub async fn upsert_config_object(&self, handle: &WorkloadHandle, document: &str) -> Result<(), SupervisorError> {
        match self.api.get_config_map(&handle.config_object_name).await? {
            None => {
                let config_map = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(handle.config_object_name.clone()),
                        ..Default::default()
                    },
                    data: Some(BTreeMap::from([(CONFIG_DATA_KEY.to_string(), document.to_string())])),
                    ..Default::default()
                };
                self.api.create_config_map(config_map).await?;
                info!(configmap = %handle.config_object_name, "Config object created");
            }
            Some(mut config_map) => {
                config_map
                    .data
                    .get_or_insert_with(BTreeMap::new)
                    .insert(CONFIG_DATA_KEY.to_string(), document.to_string());
                self.api.replace_config_map(config_map).await?;
                info!(configmap = %handle.config_object_name, "Config object updated");
            }
        }
        Ok(())
    }

    /// Set the restart label to the current Unix second
    pub async fn bump_template_label(&self, handle: &WorkloadHandle) -> Result<(), SupervisorError> {
        let timestamp = chrono::Utc::now().timestamp().to_string();
        self.api
            .set_template_label(handle.kind, &handle.workload_name, RESTART_LABEL, &timestamp)
            .await?;
        info!(workload = %handle.workload_name, kind = %handle.kind, timestamp = %timestamp, "Workload restart triggered");
        Ok(())
    }

    /// Write the document and restart the workload, in that order
    pub async fn rollout(&self, kind: WorkloadKind, document: &str) -> Result<(), SupervisorError> {
        let handle = self.handle(kind);
        self.set_state(kind, RolloutState::Pending);

        if let Err(e) = self.upsert_config_object(handle, document).await {
            warn!(workload = %kind, "Config object update failed: {}", e);
            self.set_state(kind, RolloutState::Idle);
            return Err(e);
        }
        self.set_state(kind, RolloutState::ConfigWritten);

        if let Err(e) = self.bump_template_label(handle).await {
            warn!(workload = %kind, "Workload restart failed: {}", e);
            self.set_state(kind, RolloutState::Idle);
            return Err(e);
        }
        self.set_state(kind, RolloutState::Restarted);
        self.set_state(kind, RolloutState::Idle);
        Ok(())
    }
}

#[async_trait]
impl RolloutDriver for ClusterRollout {
    async fn apply_and_restart(&self, document: &[u8], flavor: Flavor) -> Result<(), SupervisorError> {
        let kind = match flavor {
            Flavor::DaemonSet => WorkloadKind::WorkerSet,
            Flavor::Deployment => WorkloadKind::Controller,
            other => {
                return Err(SupervisorError::Config(format!(
                    "{other} documents cannot be rolled out to a cluster"
                )))
            }
        };
        let document = std::str::from_utf8(document)
            .map_err(|e| SupervisorError::ParseError(format!("document is not UTF-8: {e}")))?;
        self.rollout(kind, document).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex as AsyncMutex;

    #[derive(Default)]
    struct RecordingApi {
        objects: AsyncMutex<BTreeMap<String, ConfigMap>>,
        writes: AsyncMutex<Vec<String>>,
        fail_labels: bool,
    }

    #[async_trait]
    impl ClusterApi for RecordingApi {
        async fn get_config_map(&self, name: &str) -> Result<Option<ConfigMap>, SupervisorError> {
            Ok(self.objects.lock().await.get(name).cloned())
        }

        async fn create_config_map(&self, config_map: ConfigMap) -> Result<(), SupervisorError> {
            let name = config_map.metadata.name.clone().unwrap_or_default();
            self.writes.lock().await.push(format!("create:{name}"));
            self.objects.lock().await.insert(name, config_map);
            Ok(())
        }

        async fn replace_config_map(&self, config_map: ConfigMap) -> Result<(), SupervisorError> {
            let name = config_map.metadata.name.clone().unwrap_or_default();
            self.writes.lock().await.push(format!("replace:{name}"));
            self.objects.lock().await.insert(name, config_map);
            Ok(())
        }

        async fn set_template_label(
            &self,
            kind: WorkloadKind,
            workload_name: &str,
            key: &str,
            value: &str,
        ) -> Result<(), SupervisorError> {
            if self.fail_labels {
                return Err(SupervisorError::Orchestrator {
                    context: "forbidden".to_string(),
                    source: "denied".into(),
                });
            }
            assert_eq!(key, RESTART_LABEL);
            assert!(value.parse::<i64>().is_ok());
            self.writes.lock().await.push(format!("label:{kind}:{workload_name}"));
            Ok(())
        }
    }

    fn rollout_with(api: Arc<RecordingApi>) -> ClusterRollout {
        ClusterRollout::new(
            api,
            WorkloadHandle::new(WorkloadKind::WorkerSet, "mw-kube-agent", "mw-daemonset-otel-config"),
            WorkloadHandle::new(WorkloadKind::Controller, "mw-kube-agent", "mw-deployment-otel-config"),
        )
    }

    #[tokio::test]
    async fn test_upsert_creates_then_replaces() {
        let api = Arc::new(RecordingApi::default());
        let rollout = rollout_with(api.clone());
        let handle = rollout.handle(WorkloadKind::WorkerSet).clone();

        assert_eq!(rollout.read_config_object(&handle).await.unwrap(), None);
        rollout.upsert_config_object(&handle, "v1").await.unwrap();
        rollout.upsert_config_object(&handle, "v2").await.unwrap();

        assert_eq!(
            rollout.read_config_object(&handle).await.unwrap().as_deref(),
            Some("v2")
        );
        assert_eq!(
            *api.writes.lock().await,
            vec![
                "create:mw-daemonset-otel-config".to_string(),
                "replace:mw-daemonset-otel-config".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn test_apply_writes_before_label() {
        let api = Arc::new(RecordingApi::default());
        let rollout = rollout_with(api.clone());

        rollout.apply_and_restart(b"doc", Flavor::Deployment).await.unwrap();
        assert_eq!(
            *api.writes.lock().await,
            vec![
                "create:mw-deployment-otel-config".to_string(),
                "label:deployment:mw-kube-agent".to_string(),
            ]
        );
        assert_eq!(rollout.state(WorkloadKind::Controller), RolloutState::Idle);
    }

    #[tokio::test]
    async fn test_label_failure_surfaces() {
        let api = Arc::new(RecordingApi {
            fail_labels: true,
            ..Default::default()
        });
        let rollout = rollout_with(api.clone());

        let err = rollout.apply_and_restart(b"doc", Flavor::DaemonSet).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Orchestrator { .. }));
        // the config object was still written
        assert_eq!(api.writes.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn test_host_flavor_rejected() {
        let rollout = rollout_with(Arc::new(RecordingApi::default()));
        assert!(rollout.apply_and_restart(b"doc", Flavor::Docker).await.is_err());
    }

    #[test]
    fn test_workload_kind_flavor() {
        assert_eq!(WorkloadKind::WorkerSet.flavor(), Flavor::DaemonSet);
        assert_eq!(WorkloadKind::Controller.to_string(), "deployment");
    }
}
