//! HTTP implementation of the control-plane client

use super::types::{
    AgentQuery, ConfigGroupRequest, ConfigGroupResponse, ReceivedBundle, RolloutFlags,
    TrackingMetadata, TrackingReport,
};
use super::ControlPlane;
use crate::error::SupervisorError;
use crate::pipeline::Flavor;
use crate::target::ControlPlaneBase;
use async_trait::async_trait;
use reqwest::{Client, Response, Url};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, instrument};

const RESTART_STATUS: &str = "restart-status";
const INGESTION_RULES: &str = "ingestion-rules";
const CONFIG_GROUPS: &str = "config-groups";
const TRACKING: &str = "tracking";

/// Fixed deadline of the config-group apply call
pub const CONFIG_GROUP_TIMEOUT: Duration = Duration::from_secs(10);
/// Default per-request deadline for the pull calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpControlPlane {
    client: Client,
    base: ControlPlaneBase,
    api_key: String,
    request_timeout: Duration,
}

impl HttpControlPlane {
    pub fn new(
        base: ControlPlaneBase,
        api_key: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, SupervisorError> {
        let client = Client::builder()
            .user_agent(concat!("mw-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SupervisorError::Config(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base,
            api_key: api_key.into(),
            request_timeout,
        })
    }

    pub fn base(&self) -> &ControlPlaneBase {
        &self.base
    }

    fn agent_url(
        &self,
        segments: &[&str],
        query: &[(&'static str, String)],
    ) -> Result<Url, SupervisorError> {
        let mut path = vec!["api", "v1", "agent"];
        path.extend_from_slice(segments);
        let mut url = self.base.endpoint(&path)?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    async fn send(
        &self,
        endpoint: &'static str,
        request: reqwest::RequestBuilder,
    ) -> Result<Response, SupervisorError> {
        // the URL carries the API key, keep it out of error messages
        request.send().await.map_err(|e| {
            SupervisorError::transient(format!("{endpoint} request failed"), e.without_url())
        })
    }
}

/// Read and decode a JSON body, mapping failures onto the error taxonomy
async fn decode<T: DeserializeOwned>(
    endpoint: &'static str,
    response: Response,
) -> Result<T, SupervisorError> {
    let body = response.bytes().await.map_err(|e| {
        SupervisorError::transient(format!("failed to read {endpoint} response"), e.without_url())
    })?;
    serde_json::from_slice(&body)
        .map_err(|e| SupervisorError::invalid_response(endpoint, format!("undecodable body: {e}")))
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    #[instrument(skip(self, query), fields(host_id = %query.host_id))]
    async fn fetch_rollout_flags(&self, query: &AgentQuery) -> Result<RolloutFlags, SupervisorError> {
        let url = self.agent_url(
            &[RESTART_STATUS, &self.api_key],
            &query.restart_status_pairs(),
        )?;
        let response = self
            .send(
                RESTART_STATUS,
                self.client.get(url).timeout(self.request_timeout),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SupervisorError::RestartStatusApiNotOk {
                status: status.as_u16(),
            });
        }

        let flags: RolloutFlags = decode(RESTART_STATUS, response).await?;
        if !flags.status {
            return Err(SupervisorError::invalid_response(
                RESTART_STATUS,
                format!("status is false: {}", flags.message),
            ));
        }

        debug!(
            restart = flags.restart,
            daemonset = flags.rollout.daemonset,
            deployment = flags.rollout.deployment,
            "Fetched rollout flags"
        );
        Ok(flags)
    }

    #[instrument(skip(self, query), fields(host_id = %query.host_id, flavor = %flavor))]
    async fn fetch_ingestion_rules(
        &self,
        flavor: Flavor,
        query: &AgentQuery,
    ) -> Result<ReceivedBundle, SupervisorError> {
        let url = self.agent_url(
            &[INGESTION_RULES, &self.api_key],
            &query.ingestion_rules_pairs(flavor),
        )?;
        let response = self
            .send(
                INGESTION_RULES,
                self.client.get(url).timeout(self.request_timeout),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SupervisorError::ApiNotOk {
                endpoint: INGESTION_RULES,
                status: status.as_u16(),
            });
        }

        let bundle: ReceivedBundle = decode(INGESTION_RULES, response).await?;
        if !bundle.status {
            return Err(SupervisorError::invalid_response(
                INGESTION_RULES,
                format!("status is false: {}", bundle.message),
            ));
        }

        let [first, second] = flavor.family();
        if bundle.config.get(first).is_none() && bundle.config.get(second).is_none() {
            return Err(SupervisorError::invalid_response(
                INGESTION_RULES,
                format!("both {first} and {second} configurations are empty"),
            ));
        }
        if bundle.config.get(flavor).is_none() {
            return Err(SupervisorError::invalid_response(
                INGESTION_RULES,
                format!("{flavor} configuration is empty"),
            ));
        }

        Ok(bundle)
    }

    #[instrument(skip(self))]
    async fn apply_config_group(&self, group: &str, cluster_id: &str) -> Result<(), SupervisorError> {
        let url = self
            .base
            .endpoint(&["api", "v1", "agent", "public", "setting", CONFIG_GROUPS, &self.api_key, group])?;
        let body = ConfigGroupRequest {
            host_ids: vec![cluster_id.to_string()],
        };
        let response = self
            .send(
                CONFIG_GROUPS,
                self.client.put(url).json(&body).timeout(CONFIG_GROUP_TIMEOUT),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SupervisorError::ApiNotOk {
                endpoint: CONFIG_GROUPS,
                status: status.as_u16(),
            });
        }

        let answer: ConfigGroupResponse = decode(CONFIG_GROUPS, response).await?;
        if !answer.status {
            return Err(SupervisorError::invalid_response(
                CONFIG_GROUPS,
                format!("status is false: {}", answer.message),
            ));
        }
        Ok(())
    }

    #[instrument(skip(self, query, reason))]
    async fn report_invalid_config(&self, query: &AgentQuery, reason: &str) -> Result<(), SupervisorError> {
        let url = self.agent_url(&[TRACKING, &self.api_key], &[])?;
        let report = TrackingReport {
            status: "validate".to_string(),
            metadata: TrackingMetadata {
                host_id: query.host_id.clone(),
                platform: query.platform.clone(),
                agent_version: query.agent_version.clone(),
                infra_platform: query
                    .infra_platform
                    .map(|p| p.wire_name().to_string())
                    .unwrap_or_default(),
                reason: reason.to_string(),
            },
        };
        let response = self
            .send(
                TRACKING,
                self.client.post(url).json(&report).timeout(self.request_timeout),
            )
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SupervisorError::ApiNotOk {
                endpoint: TRACKING,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::Router;

    fn client() -> HttpControlPlane {
        let base = ControlPlaneBase::parse("https://myaccount.middleware.io/").unwrap();
        HttpControlPlane::new(base, "key-1", DEFAULT_REQUEST_TIMEOUT).unwrap()
    }

    #[test]
    fn test_agent_url_layout() {
        let cp = client();
        let url = cp
            .agent_url(
                &[RESTART_STATUS, "key-1"],
                &[("host_id", "web 1".to_string()), ("platform", "linux".to_string())],
            )
            .unwrap();
        assert_eq!(url.path(), "/api/v1/agent/restart-status/key-1");
        assert_eq!(url.query(), Some("host_id=web+1&platform=linux"));
    }

    #[test]
    fn test_agent_url_without_query() {
        let cp = client();
        let url = cp.agent_url(&[TRACKING, "key-1"], &[]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://myaccount.middleware.io/api/v1/agent/tracking/key-1"
        );
    }

    /// Control plane answering every request with the same status and body
    async fn answering(status: StatusCode, body: &'static str) -> HttpControlPlane {
        let app = Router::new().fallback(move || async move { (status, body) });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        let base = ControlPlaneBase::parse(&format!("http://{}", addr)).unwrap();
        HttpControlPlane::new(base, "key-1", Duration::from_secs(5)).unwrap()
    }

    fn query() -> AgentQuery {
        AgentQuery::for_host("web-1", "1.0.0")
    }

    fn assert_invalid_response(result: Result<impl std::fmt::Debug, SupervisorError>, endpoint: &str) {
        match result {
            Err(SupervisorError::InvalidResponse { endpoint: e, .. }) => assert_eq!(e, endpoint),
            other => panic!("expected InvalidResponse from {endpoint}, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restart_status_accepts_flags() {
        let cp = answering(
            StatusCode::OK,
            r#"{"status": true, "restart": true, "rollout": {"daemonset": true}}"#,
        )
        .await;
        let flags = cp.fetch_rollout_flags(&query()).await.unwrap();
        assert!(flags.restart);
        assert!(flags.rollout.daemonset);
        assert!(!flags.rollout.deployment);
    }

    #[tokio::test]
    async fn test_restart_status_non_success_code() {
        let cp = answering(StatusCode::BAD_GATEWAY, r#"{"status": true}"#).await;
        match cp.fetch_rollout_flags(&query()).await {
            Err(SupervisorError::RestartStatusApiNotOk { status }) => assert_eq!(status, 502),
            other => panic!("expected RestartStatusApiNotOk, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_restart_status_false() {
        let cp = answering(StatusCode::OK, r#"{"status": false, "message": "unknown key"}"#).await;
        assert_invalid_response(cp.fetch_rollout_flags(&query()).await, RESTART_STATUS);
    }

    #[tokio::test]
    async fn test_restart_status_undecodable_body() {
        let cp = answering(StatusCode::OK, "<html>maintenance</html>").await;
        assert_invalid_response(cp.fetch_rollout_flags(&query()).await, RESTART_STATUS);
    }

    #[tokio::test]
    async fn test_ingestion_rules_status_false_with_config() {
        let cp = answering(
            StatusCode::OK,
            r#"{"status": false, "config": {"docker": {"receivers": {"otlp": {}}}}}"#,
        )
        .await;
        assert_invalid_response(
            cp.fetch_ingestion_rules(Flavor::Docker, &query()).await,
            INGESTION_RULES,
        );
    }

    #[tokio::test]
    async fn test_ingestion_rules_empty_family() {
        let cp = answering(
            StatusCode::OK,
            r#"{"status": true, "config": {"docker": {}, "deployment": {"receivers": {"otlp": {}}}}}"#,
        )
        .await;
        assert_invalid_response(
            cp.fetch_ingestion_rules(Flavor::NoDocker, &query()).await,
            INGESTION_RULES,
        );
    }

    #[tokio::test]
    async fn test_ingestion_rules_requested_flavor_empty() {
        let cp = answering(
            StatusCode::OK,
            r#"{"status": true, "config": {"nodocker": {"receivers": {"otlp": {}}}}}"#,
        )
        .await;
        assert_invalid_response(
            cp.fetch_ingestion_rules(Flavor::Docker, &query()).await,
            INGESTION_RULES,
        );
    }

    #[tokio::test]
    async fn test_ingestion_rules_undecodable_body() {
        let cp = answering(StatusCode::OK, r#"{"status": true, "config": "#).await;
        assert_invalid_response(
            cp.fetch_ingestion_rules(Flavor::Docker, &query()).await,
            INGESTION_RULES,
        );
    }

    #[tokio::test]
    async fn test_ingestion_rules_returns_requested_flavor() {
        let cp = answering(
            StatusCode::OK,
            r#"{"status": true, "config": {"docker": {"receivers": {"otlp": {}}}}}"#,
        )
        .await;
        let bundle = cp.fetch_ingestion_rules(Flavor::Docker, &query()).await.unwrap();
        assert!(bundle.config.get(Flavor::Docker).is_some());
        assert!(bundle.config.get(Flavor::NoDocker).is_none());
    }
}
