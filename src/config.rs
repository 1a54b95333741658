//! Configuration management for the agent
//!
//! Both launchers read an optional config file (YAML, JSON or TOML, keys in
//! kebab-case) which the CLI then overrides field by field.

use crate::platform::InfraPlatform;
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "/etc/mw-agent/agent-config.yaml";
pub const DEFAULT_DOCKER_ENDPOINT: &str = "unix:///var/run/docker.sock";

/// How often the reconciliation loop polls the control plane
///
/// Parsed from humantime strings (`60s`, `1m30s`). The literal `0` disables
/// periodic checks after the bootstrap iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct CheckInterval(Option<Duration>);

impl CheckInterval {
    pub fn disabled() -> Self {
        CheckInterval(None)
    }

    pub fn every(period: Duration) -> Self {
        if period.is_zero() {
            CheckInterval(None)
        } else {
            CheckInterval(Some(period))
        }
    }

    /// `None` when periodic checks are disabled
    pub fn period(&self) -> Option<Duration> {
        self.0
    }
}

impl Default for CheckInterval {
    fn default() -> Self {
        CheckInterval(Some(Duration::from_secs(60)))
    }
}

impl FromStr for CheckInterval {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "0" {
            return Ok(CheckInterval::disabled());
        }
        humantime::parse_duration(s)
            .map(CheckInterval::every)
            .map_err(|e| format!("invalid config check interval {s:?}: {e}"))
    }
}

impl TryFrom<String> for CheckInterval {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<CheckInterval> for String {
    fn from(value: CheckInterval) -> Self {
        value.to_string()
    }
}

impl fmt::Display for CheckInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(period) => write!(f, "{}", humantime::format_duration(period)),
            None => f.write_str("0"),
        }
    }
}

/// Telemetry families the agent is allowed to collect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AgentFeatures {
    pub metric_collection: bool,
    pub log_collection: bool,
}

impl Default for AgentFeatures {
    fn default() -> Self {
        Self {
            metric_collection: true,
            log_collection: true,
        }
    }
}

/// Ports the pipeline engine listens on, forwarded through its environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EnginePorts {
    pub grpc: u16,
    pub http: u16,
    pub fluent: u16,
    pub internal_metrics: u16,
}

impl Default for EnginePorts {
    fn default() -> Self {
        Self {
            grpc: 9319,
            http: 9320,
            fluent: 8006,
            internal_metrics: 8888,
        }
    }
}

/// Single-host agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HostConfig {
    pub api_key: String,
    pub target: String,
    pub config_check_interval: CheckInterval,
    /// Replaces the control-plane URL derived from `target`
    pub api_url_for_config_check: Option<String>,
    pub docker_endpoint: String,
    pub host_tags: String,
    /// When false the agent runs the document already on disk and never polls
    pub fetch_account_otel_config: bool,
    /// Root under which `configyamls/{all,nodocker}/otel-config.yaml` live
    pub config_root: PathBuf,
    /// Skips platform detection when set
    pub infra_platform: Option<InfraPlatform>,
    pub enable_datadog_receiver: bool,
    pub agent_features: AgentFeatures,
    pub ports: EnginePorts,
    pub collector_bin: PathBuf,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            target: String::new(),
            config_check_interval: CheckInterval::default(),
            api_url_for_config_check: None,
            docker_endpoint: DEFAULT_DOCKER_ENDPOINT.to_string(),
            host_tags: String::new(),
            fetch_account_otel_config: true,
            config_root: PathBuf::from("/etc/mw-agent"),
            infra_platform: None,
            enable_datadog_receiver: false,
            agent_features: AgentFeatures::default(),
            ports: EnginePorts::default(),
            collector_bin: PathBuf::from("otelcol-contrib"),
        }
    }
}

/// Cluster configuration updater settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct KubeConfig {
    pub api_key: String,
    pub target: String,
    pub config_check_interval: CheckInterval,
    pub api_url_for_config_check: Option<String>,
    pub cluster_name: String,
    pub namespace: String,
    pub daemonset_name: String,
    pub deployment_name: String,
    pub daemonset_configmap_name: String,
    pub deployment_configmap_name: String,
    pub enable_datadog_receiver: bool,
    pub agent_features: AgentFeatures,
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            target: String::new(),
            config_check_interval: CheckInterval::default(),
            api_url_for_config_check: None,
            cluster_name: String::new(),
            namespace: "mw-agent-ns".to_string(),
            daemonset_name: "mw-kube-agent".to_string(),
            deployment_name: "mw-kube-agent".to_string(),
            daemonset_configmap_name: "mw-daemonset-otel-config".to_string(),
            deployment_configmap_name: "mw-deployment-otel-config".to_string(),
            enable_datadog_receiver: false,
            agent_features: AgentFeatures::default(),
        }
    }
}

/// Load a config file, choosing the parser from the file extension
///
/// A missing file yields the defaults unless `required` is set, which is the
/// case when the user named the file explicitly.
pub fn load_config_file<T>(path: &Path, required: bool) -> Result<T>
where
    T: DeserializeOwned + Default,
{
    if !path.exists() {
        if required {
            bail!("config file {} does not exist", path.display());
        }
        return Ok(T::default());
    }

    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or("yaml")
        .to_ascii_lowercase();

    let config = match extension.as_str() {
        "json" => serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse JSON config {}", path.display()))?,
        "toml" => toml::from_str(&contents)
            .with_context(|| format!("failed to parse TOML config {}", path.display()))?,
        _ => serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse YAML config {}", path.display()))?,
    };

    Ok(config)
}
