//! Component types the pipeline engine can instantiate

use std::collections::{BTreeSet, HashMap};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComponentKind {
    Receiver,
    Processor,
    Exporter,
    Extension,
    Connector,
}

impl ComponentKind {
    /// Top-level document section holding components of this kind
    pub fn section(&self) -> &'static str {
        match self {
            ComponentKind::Receiver => "receivers",
            ComponentKind::Processor => "processors",
            ComponentKind::Exporter => "exporters",
            ComponentKind::Extension => "extensions",
            ComponentKind::Connector => "connectors",
        }
    }

    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Receiver,
        ComponentKind::Processor,
        ComponentKind::Exporter,
        ComponentKind::Extension,
        ComponentKind::Connector,
    ];
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentKind::Receiver => "receiver",
            ComponentKind::Processor => "processor",
            ComponentKind::Exporter => "exporter",
            ComponentKind::Extension => "extension",
            ComponentKind::Connector => "connector",
        };
        f.write_str(name)
    }
}

const HOST_RECEIVERS: &[&str] = &[
    "otlp",
    "filelog",
    "fluentforward",
    "hostmetrics",
    "docker_stats",
    "prometheus",
    "kafkametrics",
    "apache",
    "nginx",
    "jmx",
    "rabbitmq",
    "postgresql",
    "mongodb",
    "mongodbatlas",
    "mysql",
    "redis",
    "elasticsearch",
    "oracledb",
    "sqlserver",
    "k8s_cluster",
    "k8s_events",
    "kubeletstats",
    "datadog",
    "windowseventlog",
    "windowsperfcounters",
    "awsecscontainermetrics",
];

const HOST_PROCESSORS: &[&str] = &[
    "batch",
    "memory_limiter",
    "resource",
    "resourcedetection",
    "attributes",
    "filter",
    "transform",
    "metricstransform",
    "cumulativetodelta",
    "deltatorate",
    "groupbyattrs",
    "k8sattributes",
    "logdedup",
    "probabilistic_sampler",
    "redaction",
];

const HOST_EXPORTERS: &[&str] = &["otlp", "otlphttp", "logging", "debug", "file", "kafka"];

const HOST_EXTENSIONS: &[&str] = &["health_check"];

/// Set of component types, keyed by kind
///
/// Names are component *types*: `otlp/2` is checked as `otlp`.
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    components: HashMap<ComponentKind, BTreeSet<String>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Components bundled with the host collector distribution
    pub fn host_defaults() -> Self {
        Self::new()
            .with(ComponentKind::Receiver, HOST_RECEIVERS)
            .with(ComponentKind::Processor, HOST_PROCESSORS)
            .with(ComponentKind::Exporter, HOST_EXPORTERS)
            .with(ComponentKind::Extension, HOST_EXTENSIONS)
    }

    pub fn with(mut self, kind: ComponentKind, names: &[&str]) -> Self {
        for name in names {
            self.register(kind, name);
        }
        self
    }

    pub fn register(&mut self, kind: ComponentKind, type_name: &str) {
        self.components
            .entry(kind)
            .or_default()
            .insert(type_name.to_string());
    }

    /// Whether a component id (`type` or `type/name`) is supported
    pub fn supports(&self, kind: ComponentKind, component_id: &str) -> bool {
        let type_name = component_id.split('/').next().unwrap_or(component_id);
        self.components
            .get(&kind)
            .is_some_and(|names| names.contains(type_name))
    }

    pub fn len(&self) -> usize {
        self.components.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_named_instances() {
        let registry = ComponentRegistry::host_defaults();
        assert!(registry.supports(ComponentKind::Receiver, "otlp"));
        assert!(registry.supports(ComponentKind::Receiver, "prometheus/self"));
        assert!(registry.supports(ComponentKind::Receiver, "awsecscontainermetrics"));
        assert!(registry.supports(ComponentKind::Processor, "resource/host_tags"));
        assert!(!registry.supports(ComponentKind::Processor, "otlp"));
        assert!(!registry.supports(ComponentKind::Connector, "spanmetrics"));
    }

    #[test]
    fn test_register() {
        let mut registry = ComponentRegistry::new();
        assert!(registry.is_empty());
        registry.register(ComponentKind::Connector, "spanmetrics");
        assert!(registry.supports(ComponentKind::Connector, "spanmetrics/red"));
        assert_eq!(registry.len(), 1);
    }
}
