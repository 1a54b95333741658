//! Infrastructure platform detection
//!
//! Decides where the agent runs (bare instance, ECS on EC2, Fargate, Cycle.io,
//! plain EC2) and which host identifier it reports to the control plane.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

const IMDS_BASE: &str = "http://169.254.169.254";
const IMDS_TIMEOUT: Duration = Duration::from_secs(2);
const IMDS_TOKEN_TTL_SECONDS: &str = "21600";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InfraPlatform {
    #[default]
    Instance,
    Kubernetes,
    #[serde(alias = "ecsec2")]
    EcsEc2,
    #[serde(alias = "ecsfargate")]
    EcsFargate,
    #[serde(alias = "cycleio")]
    CycleIo,
    Ec2,
}

impl InfraPlatform {
    pub fn as_str(&self) -> &'static str {
        match self {
            InfraPlatform::Instance => "instance",
            InfraPlatform::Kubernetes => "kubernetes",
            InfraPlatform::EcsEc2 => "ecs-ec2",
            InfraPlatform::EcsFargate => "ecs-fargate",
            InfraPlatform::CycleIo => "cycle-io",
            InfraPlatform::Ec2 => "ec2",
        }
    }

    /// Compact name sent in the `infra_platform` query parameter
    pub fn wire_name(&self) -> &'static str {
        match self {
            InfraPlatform::EcsEc2 => "ecsec2",
            InfraPlatform::EcsFargate => "ecsfargate",
            InfraPlatform::CycleIo => "cycleio",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for InfraPlatform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InfraPlatform {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "instance" => Ok(InfraPlatform::Instance),
            "kubernetes" | "k8s" => Ok(InfraPlatform::Kubernetes),
            "ecs-ec2" | "ecsec2" => Ok(InfraPlatform::EcsEc2),
            "ecs-fargate" | "ecsfargate" => Ok(InfraPlatform::EcsFargate),
            "cycle-io" | "cycleio" => Ok(InfraPlatform::CycleIo),
            "ec2" => Ok(InfraPlatform::Ec2),
            other => Err(format!("unknown infra platform: {other}")),
        }
    }
}

/// Detect the platform from container-runtime environment variables alone
///
/// Returns `None` when the environment says nothing and the metadata probe
/// has to decide.
pub fn platform_from_env<F>(lookup: F) -> Option<InfraPlatform>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup("AWS_EXECUTION_ENV").as_deref() {
        Some("AWS_ECS_EC2") => return Some(InfraPlatform::EcsEc2),
        Some("AWS_ECS_FARGATE") => return Some(InfraPlatform::EcsFargate),
        _ => {}
    }

    if lookup("CYCLE_INSTANCE_ID").is_some_and(|id| !id.is_empty()) {
        return Some(InfraPlatform::CycleIo);
    }

    None
}

/// Full detection: environment first, then the EC2 metadata service
pub async fn detect_infra_platform() -> InfraPlatform {
    if let Some(platform) = platform_from_env(|key| std::env::var(key).ok()) {
        debug!(platform = %platform, "Infra platform detected from environment");
        return platform;
    }

    match InstanceMetadata::new(IMDS_BASE) {
        Ok(imds) if imds.is_ec2().await => InfraPlatform::Ec2,
        Ok(_) => InfraPlatform::Instance,
        Err(e) => {
            warn!("Failed to build metadata client: {}", e);
            InfraPlatform::Instance
        }
    }
}

/// Host identifier reported to the control plane
///
/// On EC2 the metadata service's `local-hostname` wins; everywhere else, or
/// when the metadata call fails, the system hostname is used.
pub async fn hostname_for_platform(platform: InfraPlatform) -> String {
    if platform == InfraPlatform::Ec2 {
        if let Ok(imds) = InstanceMetadata::new(IMDS_BASE) {
            if let Some(name) = imds.get("local-hostname").await {
                return name;
            }
        }
    }
    system_hostname()
}

pub fn system_hostname() -> String {
    hostname::get()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Minimal IMDSv2 client
pub struct InstanceMetadata {
    client: reqwest::Client,
    base: String,
}

impl InstanceMetadata {
    pub fn new(base: &str) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(IMDS_TIMEOUT).build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    async fn token(&self) -> Option<String> {
        let response = self
            .client
            .put(format!("{}/latest/api/token", self.base))
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECONDS)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "IMDSv2 token request rejected");
            return None;
        }
        response.text().await.ok()
    }

    /// Fetch one `meta-data/` entry, `None` on any failure
    pub async fn get(&self, path: &str) -> Option<String> {
        let token = self.token().await?;
        let response = self
            .client
            .get(format!("{}/latest/meta-data/{}", self.base, path))
            .header("X-aws-ec2-metadata-token", token)
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }
        response
            .text()
            .await
            .ok()
            .map(|body| body.trim().to_string())
            .filter(|body| !body.is_empty())
    }

    pub async fn is_ec2(&self) -> bool {
        self.get("instance-id").await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap, StatusCode},
        routing::{get, put},
        Router,
    };
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_platform_from_env() {
        assert_eq!(
            platform_from_env(env(&[("AWS_EXECUTION_ENV", "AWS_ECS_EC2")])),
            Some(InfraPlatform::EcsEc2)
        );
        assert_eq!(
            platform_from_env(env(&[("AWS_EXECUTION_ENV", "AWS_ECS_FARGATE")])),
            Some(InfraPlatform::EcsFargate)
        );
        assert_eq!(
            platform_from_env(env(&[("CYCLE_INSTANCE_ID", "abc")])),
            Some(InfraPlatform::CycleIo)
        );
        assert_eq!(platform_from_env(env(&[("CYCLE_INSTANCE_ID", "")])), None);
        assert_eq!(
            platform_from_env(env(&[("AWS_EXECUTION_ENV", "AWS_Lambda_java8")])),
            None
        );
    }

    #[test]
    fn test_names() {
        assert_eq!(InfraPlatform::EcsFargate.to_string(), "ecs-fargate");
        assert_eq!(InfraPlatform::EcsFargate.wire_name(), "ecsfargate");
        assert_eq!(InfraPlatform::Ec2.wire_name(), "ec2");
        assert_eq!("ecsec2".parse::<InfraPlatform>(), Ok(InfraPlatform::EcsEc2));
        assert_eq!("cycle-io".parse::<InfraPlatform>(), Ok(InfraPlatform::CycleIo));
        assert!("mainframe".parse::<InfraPlatform>().is_err());
    }

    #[test]
    fn test_deserialize_accepts_both_spellings() {
        let p: InfraPlatform = serde_yaml::from_str("ecs-ec2").unwrap();
        assert_eq!(p, InfraPlatform::EcsEc2);
        let p: InfraPlatform = serde_yaml::from_str("ecsfargate").unwrap();
        assert_eq!(p, InfraPlatform::EcsFargate);
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_imds_token_flow() {
        let app = Router::new()
            .route("/latest/api/token", put(|| async { "tok-1" }))
            .route(
                "/latest/meta-data/{path}",
                get(|headers: HeaderMap| async move {
                    match headers.get("X-aws-ec2-metadata-token") {
                        Some(t) if t == "tok-1" => (StatusCode::OK, "ip-10-0-0-1.ec2.internal\n"),
                        _ => (StatusCode::UNAUTHORIZED, ""),
                    }
                }),
            );
        let base = serve(app).await;

        let imds = InstanceMetadata::new(&base).unwrap();
        assert!(imds.is_ec2().await);
        assert_eq!(
            imds.get("local-hostname").await.as_deref(),
            Some("ip-10-0-0-1.ec2.internal")
        );
    }

    #[tokio::test]
    async fn test_imds_unreachable() {
        let app = Router::new().route(
            "/latest/api/token",
            put(|| async { StatusCode::FORBIDDEN }),
        );
        let base = serve(app).await;

        let imds = InstanceMetadata::new(&base).unwrap();
        assert!(!imds.is_ec2().await);
    }
}
