//! Pipeline document builder
//!
//! Turns a server-delivered bundle plus local inputs into the final document:
//!
//! 1. pick the flavor's base document
//! 2. merge integration fragments into `receivers`
//! 3. drop disabled telemetry families
//! 4. add the host-tag processor to every pipeline
//! 5. inject platform receivers (ECS)
//! 6. keep only prometheus pipelines on the cluster controller
//! 7. validate and serialize

use super::document::{deep_merge, string_list, PipelineDocument, PROCESSORS, RECEIVERS};
use super::registry::ComponentRegistry;
use super::Flavor;
use crate::config::AgentFeatures;
use crate::controlplane::{IntegrationConfig, IntegrationKind, ReceivedBundle};
use crate::error::SupervisorError;
use crate::platform::InfraPlatform;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_yaml::{Mapping, Value};
use std::path::Path;
use tracing::{debug, info, warn};

pub const HOST_TAGS_PROCESSOR: &str = "resource/host_tags";
pub const HOST_TAGS_ATTRIBUTE: &str = "mw.host.tags";
pub const ECS_RECEIVER: &str = "awsecscontainermetrics";
pub const PROMETHEUS_RECEIVER: &str = "prometheus";
const METRICS_PIPELINE: &str = "metrics";

const METRIC_RECEIVERS: &[&str] = &[
    "hostmetrics",
    "windowsperfcounters",
    "docker_stats",
    "prometheus",
    "kubeletstats",
    "k8s_cluster",
];
const LOG_RECEIVERS: &[&str] = &["filelog", "windowseventlog"];

static IP_PORT: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(
        r"^(?:localhost|(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)):(?:[0-9]|[1-9][0-9]{1,3}|[1-5][0-9]{4}|6[0-4][0-9]{3}|65[0-4][0-9]{2}|655[0-2][0-9]|6553[0-5])$",
    )
    .ok()
});

/// Local inputs to the builder
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    pub host_tags: String,
    pub infra_platform: InfraPlatform,
    pub features: AgentFeatures,
    /// When set, every component type must be known to the engine
    pub registry: Option<ComponentRegistry>,
}

/// Output of one build
#[derive(Debug, Clone)]
pub struct BuiltDocument {
    pub flavor: Flavor,
    pub document: PipelineDocument,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Default)]
pub struct DocumentBuilder {
    options: BuildOptions,
}

impl DocumentBuilder {
    pub fn new(options: BuildOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn build(
        &self,
        bundle: &ReceivedBundle,
        flavor: Flavor,
    ) -> Result<BuiltDocument, SupervisorError> {
        let base = bundle.config.get(flavor).ok_or_else(|| {
            SupervisorError::invalid_response(
                "ingestion-rules",
                format!("{flavor} configuration is empty"),
            )
        })?;
        let mut document = PipelineDocument::new(base.clone());
        document.check_structure()?;

        for (kind, integration) in bundle.integrations() {
            merge_integration(&mut document, kind, &integration)?;
        }

        apply_feature_restrictions(&mut document, self.options.features)?;

        if !self.options.host_tags.is_empty() {
            apply_host_tags(&mut document, &self.options.host_tags)?;
        }

        inject_platform_receivers(&mut document, self.options.infra_platform)?;

        if flavor == Flavor::Deployment {
            retain_prometheus_pipelines(&mut document)?;
        }

        if document.pipelines().is_some_and(Mapping::is_empty) {
            warn!(flavor = %flavor, "Pipeline document has no pipelines left");
        }

        document.validate(self.options.registry.as_ref())?;
        let bytes = document.to_yaml()?;

        debug!(flavor = %flavor, bytes = bytes.len(), "Built pipeline document");
        Ok(BuiltDocument {
            flavor,
            document,
            bytes,
        })
    }
}

/// Whether an integration endpoint is a bare `IPv4:PORT` or `localhost:PORT`
pub fn is_ip_port(endpoint: &str) -> bool {
    IP_PORT
        .as_ref()
        .is_some_and(|re| re.is_match(endpoint))
}

fn merge_integration(
    document: &mut PipelineDocument,
    kind: IntegrationKind,
    integration: &IntegrationConfig,
) -> Result<(), SupervisorError> {
    if integration.path.is_empty() {
        if is_ip_port(&integration.endpoint) {
            debug!(integration = %kind, endpoint = %integration.endpoint, "Endpoint-only integration, nothing to merge");
        } else {
            warn!(integration = %kind, endpoint = %integration.endpoint, "Integration has neither a fragment path nor a valid endpoint");
        }
        return Ok(());
    }

    let path = Path::new(&integration.path);
    let source = match std::fs::read_to_string(path) {
        Ok(source) => source,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(integration = %kind, path = %path.display(), "Integration fragment not found, skipping");
            return Ok(());
        }
        Err(e) => {
            warn!(integration = %kind, path = %path.display(), "Failed to read integration fragment: {}", e);
            return Ok(());
        }
    };

    let fragment: Mapping = match serde_yaml::from_str(&source.replace('\t', "  ")) {
        Ok(fragment) => fragment,
        Err(e) => {
            warn!(integration = %kind, path = %path.display(), "Integration fragment is not a YAML mapping: {}", e);
            return Ok(());
        }
    };

    merge_integration_fragment(document, &fragment)
}

/// Merge a receiver fragment into the document's `receivers`
///
/// Only receivers the document already defines are extended; fragment
/// entries that are not mappings are logged and skipped.
pub fn merge_integration_fragment(
    document: &mut PipelineDocument,
    fragment: &Mapping,
) -> Result<(), SupervisorError> {
    let receivers = document.receivers_mut()?;

    for (key, value) in fragment {
        let Some(name) = key.as_str() else {
            warn!(key = ?key, "Skipping integration entry with a non-string key");
            continue;
        };
        let Value::Mapping(incoming) = value else {
            warn!(receiver = name, "Skipping integration entry that is not a mapping");
            continue;
        };
        match receivers.get_mut(name) {
            Some(Value::Mapping(existing)) => {
                deep_merge(existing, incoming);
                debug!(receiver = name, "Merged integration fragment");
            }
            _ => debug!(receiver = name, "Receiver not in base document, fragment ignored"),
        }
    }
    Ok(())
}

/// Remove pipelines and receivers of disabled telemetry families
pub fn apply_feature_restrictions(
    document: &mut PipelineDocument,
    features: AgentFeatures,
) -> Result<(), SupervisorError> {
    let mut pipeline_prefixes = Vec::new();
    let mut receivers: Vec<&str> = Vec::new();
    if !features.metric_collection {
        pipeline_prefixes.push("metrics");
        receivers.extend_from_slice(METRIC_RECEIVERS);
    }
    if !features.log_collection {
        pipeline_prefixes.push("logs");
        receivers.extend_from_slice(LOG_RECEIVERS);
    }
    if pipeline_prefixes.is_empty() {
        return Ok(());
    }

    let defined = document.receivers_mut()?;
    defined.retain(|key, _| {
        let keep = key
            .as_str()
            .map(|name| !receivers.contains(&component_type(name)))
            .unwrap_or(true);
        if !keep {
            info!(receiver = ?key, "Receiver removed by feature settings");
        }
        keep
    });
    let remaining: Vec<String> = defined
        .keys()
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect();

    let pipelines = document.pipelines_mut()?;
    pipelines.retain(|key, _| {
        let keep = key
            .as_str()
            .map(|name| !pipeline_prefixes.iter().any(|prefix| name.starts_with(prefix)))
            .unwrap_or(true);
        if !keep {
            info!(pipeline = ?key, "Pipeline removed by feature settings");
        }
        keep
    });

    // drop references to receivers removed above
    let mut emptied = Vec::new();
    for (name, pipeline) in pipelines.iter_mut() {
        let Some(list) = pipeline.get_mut(RECEIVERS).and_then(Value::as_sequence_mut) else {
            continue;
        };
        list.retain(|entry| {
            entry
                .as_str()
                .map(|r| remaining.iter().any(|d| d == r) || !receivers.contains(&component_type(r)))
                .unwrap_or(true)
        });
        if list.is_empty() {
            emptied.push(name.clone());
        }
    }
    for name in emptied {
        info!(pipeline = ?name, "Pipeline has no receivers left, removing");
        pipelines.remove(&name);
    }
    Ok(())
}

/// Add the host-tag processor and put it first in every pipeline
///
/// Idempotent: existing occurrences are removed before inserting at index 0.
pub fn apply_host_tags(document: &mut PipelineDocument, host_tags: &str) -> Result<(), SupervisorError> {
    let mut action = Mapping::new();
    action.insert("key".into(), HOST_TAGS_ATTRIBUTE.into());
    action.insert("action".into(), "insert".into());
    action.insert("value".into(), host_tags.into());
    let mut processor = Mapping::new();
    processor.insert("attributes".into(), Value::Sequence(vec![Value::Mapping(action)]));

    document
        .processors_mut()?
        .insert(HOST_TAGS_PROCESSOR.into(), Value::Mapping(processor));

    for (_, pipeline) in document.pipelines_mut()?.iter_mut() {
        let Some(pipeline) = pipeline.as_mapping_mut() else {
            continue;
        };
        match pipeline.get_mut(PROCESSORS) {
            Some(Value::Sequence(processors)) => {
                processors.retain(|p| p.as_str() != Some(HOST_TAGS_PROCESSOR));
                processors.insert(0, HOST_TAGS_PROCESSOR.into());
            }
            _ => {
                pipeline.insert(
                    PROCESSORS.into(),
                    Value::Sequence(vec![HOST_TAGS_PROCESSOR.into()]),
                );
            }
        }
    }
    Ok(())
}

/// Add the ECS container-metrics receiver on ECS platforms
pub fn inject_platform_receivers(
    document: &mut PipelineDocument,
    platform: InfraPlatform,
) -> Result<(), SupervisorError> {
    if !matches!(platform, InfraPlatform::EcsEc2 | InfraPlatform::EcsFargate) {
        return Ok(());
    }

    document
        .receivers_mut()?
        .insert(ECS_RECEIVER.into(), Value::Mapping(Mapping::new()));

    let Some(metrics) = document
        .pipelines_mut()?
        .get_mut(METRICS_PIPELINE)
        .and_then(Value::as_mapping_mut)
    else {
        warn!(platform = %platform, "No metrics pipeline to attach {} to", ECS_RECEIVER);
        return Ok(());
    };

    let receivers = if platform == InfraPlatform::EcsFargate {
        vec![ECS_RECEIVER.to_string()]
    } else {
        let mut receivers = metrics.get(RECEIVERS).map(string_list).unwrap_or_default();
        if !receivers.iter().any(|r| r == ECS_RECEIVER) {
            receivers.push(ECS_RECEIVER.to_string());
        }
        receivers
    };

    metrics.insert(
        RECEIVERS.into(),
        Value::Sequence(receivers.into_iter().map(Value::from).collect()),
    );
    Ok(())
}

/// Keep only pipelines fed by the prometheus receiver
pub fn retain_prometheus_pipelines(document: &mut PipelineDocument) -> Result<(), SupervisorError> {
    document.pipelines_mut()?.retain(|name, pipeline| {
        let keep = pipeline
            .get(RECEIVERS)
            .map(string_list)
            .is_some_and(|receivers| receivers.iter().any(|r| r == PROMETHEUS_RECEIVER));
        if !keep {
            debug!(pipeline = ?name, "Dropping non-prometheus pipeline from controller document");
        }
        keep
    });
    Ok(())
}

fn component_type(id: &str) -> &str {
    id.split('/').next().unwrap_or(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::types::FlavorDocuments;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::tempdir;

    const BASE: &str = r#"
receivers:
  otlp:
    protocols:
      grpc:
        endpoint: 0.0.0.0:9319
  hostmetrics:
    collection_interval: 5s
  filelog: {}
  postgresql:
    endpoint: localhost:5432
processors:
  batch: {}
exporters:
  otlp:
    endpoint: ${env:MW_TARGET}
service:
  pipelines:
    metrics:
      receivers: [otlp, hostmetrics, postgresql]
      processors: [batch]
      exporters: [otlp]
    logs:
      receivers: [otlp, filelog]
      processors: [batch]
      exporters: [otlp]
    traces:
      receivers: [otlp]
      processors: [batch]
      exporters: [otlp]
"#;

    fn doc(source: &str) -> PipelineDocument {
        PipelineDocument::from_yaml(source).unwrap()
    }

    fn bundle_for(flavor: Flavor, source: &str) -> ReceivedBundle {
        let mapping: Mapping = serde_yaml::from_str(source).unwrap();
        let mut config = FlavorDocuments::default();
        match flavor {
            Flavor::Docker => config.docker = Some(mapping),
            Flavor::NoDocker => config.nodocker = Some(mapping),
            Flavor::Deployment => config.deployment = Some(mapping),
            Flavor::DaemonSet => config.daemonset = Some(mapping),
        }
        ReceivedBundle {
            status: true,
            config,
            message: String::new(),
            extra: BTreeMap::new(),
        }
    }

    #[test]
    fn test_host_tags_idempotent() {
        let source = r#"
receivers: {otlp: {}}
processors: {batch: {}}
exporters: {otlp: {}}
service:
  pipelines:
    metrics:
      receivers: [otlp]
      processors: [batch]
      exporters: [otlp]
"#;
        let builder = DocumentBuilder::new(BuildOptions {
            host_tags: "team:sre".to_string(),
            ..Default::default()
        });

        let first = builder
            .build(&bundle_for(Flavor::NoDocker, source), Flavor::NoDocker)
            .unwrap();
        let again = ReceivedBundle {
            config: FlavorDocuments {
                nodocker: Some(first.document.root().clone()),
                ..Default::default()
            },
            status: true,
            message: String::new(),
            extra: BTreeMap::new(),
        };
        let second = builder.build(&again, Flavor::NoDocker).unwrap();

        assert_eq!(
            second.document.pipeline_components("metrics", PROCESSORS),
            vec![HOST_TAGS_PROCESSOR, "batch"]
        );
        let attributes = &second.document.processors().unwrap()[HOST_TAGS_PROCESSOR]["attributes"][0];
        assert_eq!(attributes["key"].as_str(), Some(HOST_TAGS_ATTRIBUTE));
        assert_eq!(attributes["action"].as_str(), Some("insert"));
        assert_eq!(attributes["value"].as_str(), Some("team:sre"));
    }

    #[test]
    fn test_host_tags_on_pipeline_without_processors() {
        let mut document = doc(
            "receivers: {otlp: {}}\nprocessors: {}\nservice: {pipelines: {traces: {receivers: [otlp]}}}",
        );
        apply_host_tags(&mut document, "env:prod").unwrap();
        assert_eq!(
            document.pipeline_components("traces", PROCESSORS),
            vec![HOST_TAGS_PROCESSOR]
        );
    }

    #[test]
    fn test_no_host_tags_leaves_processors_alone() {
        let built = DocumentBuilder::default()
            .build(&bundle_for(Flavor::Docker, BASE), Flavor::Docker)
            .unwrap();
        assert_eq!(built.document.pipeline_components("metrics", PROCESSORS), vec!["batch"]);
        assert!(!built.document.processors().unwrap().contains_key(HOST_TAGS_PROCESSOR));
    }

    #[test]
    fn test_ecs_ec2_appends_receiver() {
        let mut document = doc(BASE);
        inject_platform_receivers(&mut document, InfraPlatform::EcsEc2).unwrap();
        assert_eq!(
            document.pipeline_components("metrics", RECEIVERS),
            vec!["otlp", "hostmetrics", "postgresql", ECS_RECEIVER]
        );
        assert!(document.receivers().unwrap().contains_key(ECS_RECEIVER));

        inject_platform_receivers(&mut document, InfraPlatform::EcsEc2).unwrap();
        assert_eq!(document.pipeline_components("metrics", RECEIVERS).len(), 4);
        document.validate(None).unwrap();
    }

    #[test]
    fn test_ecs_fargate_replaces_receivers() {
        let mut document = doc(BASE);
        inject_platform_receivers(&mut document, InfraPlatform::EcsFargate).unwrap();
        assert_eq!(
            document.pipeline_components("metrics", RECEIVERS),
            vec![ECS_RECEIVER]
        );
        assert_eq!(document.pipeline_components("logs", RECEIVERS), vec!["otlp", "filelog"]);
    }

    #[test]
    fn test_other_platforms_untouched() {
        let mut document = doc(BASE);
        let before = document.clone();
        inject_platform_receivers(&mut document, InfraPlatform::Ec2).unwrap();
        assert_eq!(document, before);
    }

    #[test]
    fn test_controller_keeps_prometheus_pipelines() {
        let source = BASE.replace(
            "receivers: [otlp]\n      processors: [batch]\n      exporters: [otlp]\n",
            "receivers: [prometheus]\n      processors: [batch]\n      exporters: [otlp]\n",
        ).replace("  filelog: {}\n", "  filelog: {}\n  prometheus: {}\n");

        let built = DocumentBuilder::default()
            .build(&bundle_for(Flavor::Deployment, &source), Flavor::Deployment)
            .unwrap();
        assert_eq!(built.document.pipeline_names(), vec!["traces"]);

        let built = DocumentBuilder::default()
            .build(&bundle_for(Flavor::DaemonSet, &source), Flavor::DaemonSet)
            .unwrap();
        assert_eq!(built.document.pipeline_names().len(), 3);
    }

    #[test]
    fn test_integration_fragment_merge() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("postgres.yaml");
        fs::write(
            &path,
            "postgresql:\n\tusername: mw\n\tdatabases: [app]\nredis:\n  endpoint: localhost:6379\nnot_a_tree: 5\n",
        )
        .unwrap();

        let mut bundle = bundle_for(Flavor::Docker, BASE);
        bundle.extra.insert(
            "pgdb_config".to_string(),
            serde_json::json!({"path": path.to_string_lossy()}),
        );
        bundle.extra.insert(
            "mysql_config".to_string(),
            serde_json::json!({"path": temp_dir.path().join("missing.yaml").to_string_lossy()}),
        );
        bundle.extra.insert(
            "redis_config".to_string(),
            serde_json::json!({"endpoint": "127.0.0.1:6379"}),
        );

        let built = DocumentBuilder::default().build(&bundle, Flavor::Docker).unwrap();
        let receivers = built.document.receivers().unwrap();
        let postgres = receivers["postgresql"].as_mapping().unwrap();
        assert_eq!(postgres["endpoint"].as_str(), Some("localhost:5432"));
        assert_eq!(postgres["username"].as_str(), Some("mw"));
        assert!(!receivers.contains_key("redis"));
        assert!(!receivers.contains_key("not_a_tree"));
    }

    #[test]
    fn test_ip_port_format() {
        assert!(is_ip_port("localhost:6379"));
        assert!(is_ip_port("10.0.0.12:5432"));
        assert!(!is_ip_port("db.internal:5432"));
        assert!(!is_ip_port("256.0.0.1:80"));
        assert!(!is_ip_port("localhost"));
    }

    #[test]
    fn test_metric_collection_disabled() {
        let mut document = doc(BASE);
        apply_feature_restrictions(
            &mut document,
            AgentFeatures {
                metric_collection: false,
                log_collection: true,
            },
        )
        .unwrap();
        assert_eq!(document.pipeline_names(), vec!["logs", "traces"]);
        assert!(!document.receivers().unwrap().contains_key("hostmetrics"));
        assert!(document.receivers().unwrap().contains_key("filelog"));
        document.validate(None).unwrap();
    }

    #[test]
    fn test_log_collection_disabled() {
        let mut document = doc(
            &BASE.replace(
                "receivers: [otlp]\n      processors: [batch]\n      exporters: [otlp]\n",
                "receivers: [otlp, filelog]\n      processors: [batch]\n      exporters: [otlp]\n",
            ),
        );
        apply_feature_restrictions(
            &mut document,
            AgentFeatures {
                metric_collection: true,
                log_collection: false,
            },
        )
        .unwrap();
        assert_eq!(document.pipeline_names(), vec!["metrics", "traces"]);
        assert_eq!(document.pipeline_components("traces", RECEIVERS), vec!["otlp"]);
        document.validate(None).unwrap();
    }

    #[test]
    fn test_missing_sections() {
        let builder = DocumentBuilder::default();
        let err = builder
            .build(&bundle_for(Flavor::Docker, "processors: {}\nservice: {pipelines: {}}"), Flavor::Docker)
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ReceiverKeyNotFound));

        let err = builder
            .build(&bundle_for(Flavor::Docker, "receivers: {}\nprocessors: {}"), Flavor::Docker)
            .unwrap_err();
        assert!(matches!(err, SupervisorError::ParseError(_)));

        let err = builder
            .build(&bundle_for(Flavor::Docker, BASE), Flavor::NoDocker)
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidResponse { .. }));
    }

    #[test]
    fn test_registry_rejects_unknown_component() {
        let source = BASE.replace("  filelog: {}\n", "  filelog: {}\n  carbon: {}\n");
        let builder = DocumentBuilder::new(BuildOptions {
            registry: Some(ComponentRegistry::host_defaults()),
            ..Default::default()
        });
        let err = builder
            .build(&bundle_for(Flavor::Docker, &source), Flavor::Docker)
            .unwrap_err();
        assert!(matches!(err, SupervisorError::InvalidConfig(m) if m.contains("carbon")));
    }
}
