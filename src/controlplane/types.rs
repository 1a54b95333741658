//! Wire types for the control-plane API

use crate::pipeline::Flavor;
use crate::platform::InfraPlatform;
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Body of `restart-status`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RolloutFlags {
    #[serde(default)]
    pub status: bool,
    /// Single-host restart request
    #[serde(default)]
    pub restart: bool,
    #[serde(default)]
    pub rollout: WorkloadRolloutFlags,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct WorkloadRolloutFlags {
    #[serde(default)]
    pub deployment: bool,
    #[serde(default)]
    pub daemonset: bool,
}

/// The four document variants the server may deliver
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FlavorDocuments {
    #[serde(default)]
    pub docker: Option<Mapping>,
    #[serde(default)]
    pub nodocker: Option<Mapping>,
    #[serde(default)]
    pub deployment: Option<Mapping>,
    #[serde(default)]
    pub daemonset: Option<Mapping>,
}

impl FlavorDocuments {
    /// The non-empty document for a flavor
    pub fn get(&self, flavor: Flavor) -> Option<&Mapping> {
        let doc = match flavor {
            Flavor::Docker => self.docker.as_ref(),
            Flavor::NoDocker => self.nodocker.as_ref(),
            Flavor::Deployment => self.deployment.as_ref(),
            Flavor::DaemonSet => self.daemonset.as_ref(),
        };
        doc.filter(|doc| !doc.is_empty())
    }
}

/// Body of `ingestion-rules`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReceivedBundle {
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub config: FlavorDocuments,
    #[serde(default)]
    pub message: String,
    /// `<kind>_config` sidecars and anything else the server adds
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl ReceivedBundle {
    /// Integration sidecars recognized by this agent, in a stable order
    pub fn integrations(&self) -> Vec<(IntegrationKind, IntegrationConfig)> {
        let mut found = Vec::new();
        for kind in IntegrationKind::ALL {
            let Some(value) = self.extra.get(kind.response_key()) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            match serde_json::from_value::<IntegrationConfig>(value.clone()) {
                Ok(config) if !config.is_empty() => found.push((kind, config)),
                Ok(_) => {}
                Err(e) => warn!(integration = %kind, "Ignoring malformed integration sidecar: {}", e),
            }
        }
        found
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntegrationKind {
    Postgresql,
    Mongodb,
    Mysql,
    Mariadb,
    Redis,
    Elasticsearch,
    Cassandra,
    Clickhouse,
}

impl IntegrationKind {
    pub const ALL: [IntegrationKind; 8] = [
        IntegrationKind::Postgresql,
        IntegrationKind::Mongodb,
        IntegrationKind::Mysql,
        IntegrationKind::Mariadb,
        IntegrationKind::Redis,
        IntegrationKind::Elasticsearch,
        IntegrationKind::Cassandra,
        IntegrationKind::Clickhouse,
    ];

    /// Field name of the sidecar in the `ingestion-rules` body
    pub fn response_key(&self) -> &'static str {
        match self {
            IntegrationKind::Postgresql => "pgdb_config",
            IntegrationKind::Mongodb => "mongodb_config",
            IntegrationKind::Mysql => "mysql_config",
            IntegrationKind::Mariadb => "mariadb_config",
            IntegrationKind::Redis => "redis_config",
            IntegrationKind::Elasticsearch => "elasticsearch_config",
            IntegrationKind::Cassandra => "cassandra_config",
            IntegrationKind::Clickhouse => "clickhouse_config",
        }
    }
}

impl fmt::Display for IntegrationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IntegrationKind::Postgresql => "postgresql",
            IntegrationKind::Mongodb => "mongodb",
            IntegrationKind::Mysql => "mysql",
            IntegrationKind::Mariadb => "mariadb",
            IntegrationKind::Redis => "redis",
            IntegrationKind::Elasticsearch => "elasticsearch",
            IntegrationKind::Cassandra => "cassandra",
            IntegrationKind::Clickhouse => "clickhouse",
        };
        f.write_str(name)
    }
}

/// Where to find an integration's receiver fragment
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IntegrationConfig {
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub endpoint: String,
}

impl IntegrationConfig {
    pub fn is_empty(&self) -> bool {
        self.path.is_empty() && self.endpoint.is_empty()
    }
}

/// Body of the config-group apply call
#[derive(Debug, Clone, Serialize)]
pub struct ConfigGroupRequest {
    #[serde(rename = "hostIds")]
    pub host_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigGroupResponse {
    #[serde(default)]
    pub status: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub setting: serde_json::Value,
}

/// Body of the tracking call made when a document fails validation
#[derive(Debug, Clone, Serialize)]
pub struct TrackingReport {
    pub status: String,
    pub metadata: TrackingMetadata,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrackingMetadata {
    pub host_id: String,
    pub platform: String,
    pub agent_version: String,
    pub infra_platform: String,
    pub reason: String,
}

/// Identity and state the agent reports with every pull
#[derive(Debug, Clone, Default)]
pub struct AgentQuery {
    /// Hostname on single-host, cluster name on cluster deployments
    pub host_id: String,
    /// Operating-system tag, or `k8s` for cluster deployments
    pub platform: String,
    pub agent_version: String,
    pub cluster: Option<String>,
    pub host_tags: Option<String>,
    pub infra_platform: Option<InfraPlatform>,
    pub collector_running: Option<bool>,
    pub enable_datadog_receiver: bool,
}

impl AgentQuery {
    /// Query for a single host running on the current operating system
    pub fn for_host(host_id: impl Into<String>, agent_version: impl Into<String>) -> Self {
        Self {
            host_id: host_id.into(),
            platform: std::env::consts::OS.to_string(),
            agent_version: agent_version.into(),
            ..Default::default()
        }
    }

    /// Query for the cluster updater; the cluster doubles as the host id
    pub fn for_cluster(cluster: impl Into<String>, agent_version: impl Into<String>) -> Self {
        let cluster = cluster.into();
        Self {
            host_id: cluster.clone(),
            platform: "k8s".to_string(),
            agent_version: agent_version.into(),
            cluster: Some(cluster),
            infra_platform: Some(InfraPlatform::Kubernetes),
            ..Default::default()
        }
    }

    pub(crate) fn restart_status_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("host_id", self.host_id.clone()),
            ("platform", self.platform.clone()),
        ];
        if let Some(cluster) = &self.cluster {
            pairs.push(("cluster", cluster.clone()));
        }
        pairs.push(("agent_version", self.agent_version.clone()));
        self.push_state(&mut pairs);
        pairs
    }

    pub(crate) fn ingestion_rules_pairs(&self, flavor: Flavor) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("config", flavor.as_str().to_string()),
            ("host_id", self.host_id.clone()),
            ("platform", self.platform.clone()),
        ];
        if let Some(cluster) = &self.cluster {
            pairs.push(("cluster", cluster.clone()));
            pairs.push(("component_type", flavor.as_str().to_string()));
        }
        if let Some(tags) = self.host_tags.as_ref().filter(|t| !t.is_empty()) {
            pairs.push(("host_tags", tags.clone()));
        }
        pairs.push(("agent_version", self.agent_version.clone()));
        self.push_state(&mut pairs);
        if self.enable_datadog_receiver {
            pairs.push(("enable_datadog_receiver", "true".to_string()));
        }
        pairs
    }

    fn push_state(&self, pairs: &mut Vec<(&'static str, String)>) {
        if let Some(platform) = self.infra_platform {
            pairs.push(("infra_platform", platform.wire_name().to_string()));
        }
        if let Some(running) = self.collector_running {
            // the server expects 1 when the collector still has to be started
            pairs.push(("col_running", if running { "0" } else { "1" }.to_string()));
        }
    }
}
