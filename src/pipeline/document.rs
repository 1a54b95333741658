//! Typed wrapper around a dynamic pipeline document tree

use super::registry::{ComponentKind, ComponentRegistry};
use crate::error::SupervisorError;
use serde_yaml::{Mapping, Value};

pub const RECEIVERS: &str = "receivers";
pub const PROCESSORS: &str = "processors";
pub const EXPORTERS: &str = "exporters";
pub const CONNECTORS: &str = "connectors";
pub const EXTENSIONS: &str = "extensions";
pub const SERVICE: &str = "service";
pub const PIPELINES: &str = "pipelines";

/// A pipeline document: `receivers`, `processors`, `exporters` and
/// `service.pipelines`, plus whatever else the server sends along
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineDocument {
    root: Mapping,
}

impl PipelineDocument {
    pub fn new(root: Mapping) -> Self {
        Self { root }
    }

    pub fn from_yaml(source: &str) -> Result<Self, SupervisorError> {
        match serde_yaml::from_str::<Value>(source) {
            Ok(Value::Mapping(root)) => Ok(Self { root }),
            Ok(_) => Err(SupervisorError::ParseError(
                "document root is not a mapping".to_string(),
            )),
            Err(e) => Err(SupervisorError::ParseError(e.to_string())),
        }
    }

    pub fn root(&self) -> &Mapping {
        &self.root
    }

    pub fn into_inner(self) -> Mapping {
        self.root
    }

    /// Check the sections the builder needs before touching anything
    pub fn check_structure(&self) -> Result<(), SupervisorError> {
        if !matches!(self.root.get(RECEIVERS), Some(Value::Mapping(_))) {
            return Err(SupervisorError::ReceiverKeyNotFound);
        }
        if !matches!(self.root.get(PROCESSORS), Some(Value::Mapping(_))) {
            return Err(SupervisorError::ParseError(
                "processors section is missing or not a mapping".to_string(),
            ));
        }
        if self.pipelines().is_none() {
            return Err(SupervisorError::ParseError(
                "service.pipelines is missing or not a mapping".to_string(),
            ));
        }
        Ok(())
    }

    pub fn receivers(&self) -> Option<&Mapping> {
        self.root.get(RECEIVERS).and_then(Value::as_mapping)
    }

    pub fn receivers_mut(&mut self) -> Result<&mut Mapping, SupervisorError> {
        self.root
            .get_mut(RECEIVERS)
            .and_then(Value::as_mapping_mut)
            .ok_or(SupervisorError::ReceiverKeyNotFound)
    }

    pub fn processors(&self) -> Option<&Mapping> {
        self.root.get(PROCESSORS).and_then(Value::as_mapping)
    }

    pub fn processors_mut(&mut self) -> Result<&mut Mapping, SupervisorError> {
        self.root
            .get_mut(PROCESSORS)
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| SupervisorError::ParseError("processors section is missing".to_string()))
    }

    pub fn pipelines(&self) -> Option<&Mapping> {
        self.root
            .get(SERVICE)
            .and_then(|service| service.get(PIPELINES))
            .and_then(Value::as_mapping)
    }

    pub fn pipelines_mut(&mut self) -> Result<&mut Mapping, SupervisorError> {
        self.root
            .get_mut(SERVICE)
            .and_then(|service| service.get_mut(PIPELINES))
            .and_then(Value::as_mapping_mut)
            .ok_or_else(|| SupervisorError::ParseError("service.pipelines is missing".to_string()))
    }

    pub fn pipeline_names(&self) -> Vec<String> {
        self.pipelines()
            .map(|pipelines| pipelines.keys().filter_map(Value::as_str).map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// Component names listed in one section of one pipeline
    pub fn pipeline_components(&self, pipeline: &str, section: &str) -> Vec<String> {
        self.pipelines()
            .and_then(|pipelines| pipelines.get(pipeline))
            .and_then(|p| p.get(section))
            .map(string_list)
            .unwrap_or_default()
    }

    /// Check that every pipeline reference resolves, and optionally that
    /// every defined component type is known to the engine
    pub fn validate(&self, registry: Option<&ComponentRegistry>) -> Result<(), SupervisorError> {
        let pipelines = self
            .pipelines()
            .ok_or_else(|| SupervisorError::InvalidConfig("service.pipelines is missing".to_string()))?;

        for (name, pipeline) in pipelines {
            let name = name.as_str().unwrap_or("<non-string>");
            let Some(pipeline) = pipeline.as_mapping() else {
                return Err(SupervisorError::InvalidConfig(format!(
                    "pipeline {name} is not a mapping"
                )));
            };

            for section in [RECEIVERS, PROCESSORS, EXPORTERS] {
                let Some(list) = pipeline.get(section) else {
                    continue;
                };
                if !list.is_sequence() && !list.is_null() {
                    return Err(SupervisorError::InvalidConfig(format!(
                        "pipeline {name}: {section} is not a list"
                    )));
                }
                for component in string_list(list) {
                    if !self.defines(section, &component) {
                        return Err(SupervisorError::InvalidConfig(format!(
                            "pipeline {name} references undefined {section} entry {component}"
                        )));
                    }
                }
            }
        }

        if let Some(extensions) = self
            .root
            .get(SERVICE)
            .and_then(|service| service.get(EXTENSIONS))
        {
            for extension in string_list(extensions) {
                if !self.section_contains(EXTENSIONS, &extension) {
                    return Err(SupervisorError::InvalidConfig(format!(
                        "service references undefined extension {extension}"
                    )));
                }
            }
        }

        if let Some(registry) = registry {
            for kind in ComponentKind::ALL {
                let Some(section) = self.root.get(kind.section()).and_then(Value::as_mapping) else {
                    continue;
                };
                for id in section.keys().filter_map(Value::as_str) {
                    if !registry.supports(kind, id) {
                        return Err(SupervisorError::InvalidConfig(format!(
                            "unknown {kind} type in {id}"
                        )));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn to_yaml(&self) -> Result<Vec<u8>, SupervisorError> {
        serde_yaml::to_string(&self.root)
            .map(String::into_bytes)
            .map_err(|e| SupervisorError::ParseError(e.to_string()))
    }

    fn defines(&self, section: &str, component: &str) -> bool {
        if self.section_contains(section, component) {
            return true;
        }
        // connectors act as exporters of one pipeline and receivers of another
        (section == RECEIVERS || section == EXPORTERS) && self.section_contains(CONNECTORS, component)
    }

    fn section_contains(&self, section: &str, component: &str) -> bool {
        self.root
            .get(section)
            .and_then(Value::as_mapping)
            .is_some_and(|map| map.contains_key(component))
    }
}

/// Strings of a YAML sequence; anything else yields an empty list
pub fn string_list(value: &Value) -> Vec<String> {
    value
        .as_sequence()
        .map(|seq| seq.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Merge `src` into `dst`; mappings merge recursively, other values overwrite
pub fn deep_merge(dst: &mut Mapping, src: &Mapping) {
    for (key, value) in src {
        match (dst.get_mut(key), value) {
            (Some(Value::Mapping(existing)), Value::Mapping(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                dst.insert(key.clone(), value.clone());
            }
        }
    }
}
