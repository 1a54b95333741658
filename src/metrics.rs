//! Supervisor metrics and the optional `/metrics` endpoint

use axum::{http::StatusCode, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::net::SocketAddr;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

/// Counters shared by the reconcilers; cheap to clone
#[derive(Clone)]
pub struct SupervisorMetrics {
    ticks: IntCounter,
    failures: IntCounterVec,
    rollouts: IntCounterVec,
    config_group_applies: IntCounterVec,
}

impl SupervisorMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let ticks = IntCounter::new(
            "mw_agent_reconcile_ticks_total",
            "Reconciliation iterations started",
        )?;
        let failures = IntCounterVec::new(
            Opts::new(
                "mw_agent_reconcile_failures_total",
                "Reconciliation iterations that reported an error",
            ),
            &["kind"],
        )?;
        let rollouts = IntCounterVec::new(
            Opts::new("mw_agent_rollouts_total", "Pipeline documents rolled out"),
            &["target"],
        )?;
        let config_group_applies = IntCounterVec::new(
            Opts::new(
                "mw_agent_config_group_applies_total",
                "Config-group apply attempts",
            ),
            &["result"],
        )?;

        registry.register(Box::new(ticks.clone()))?;
        registry.register(Box::new(failures.clone()))?;
        registry.register(Box::new(rollouts.clone()))?;
        registry.register(Box::new(config_group_applies.clone()))?;

        Ok(Self {
            ticks,
            failures,
            rollouts,
            config_group_applies,
        })
    }

    pub fn record_tick(&self) {
        self.ticks.inc();
    }

    pub fn record_failure(&self, kind: &str) {
        self.failures.with_label_values(&[kind]).inc();
    }

    pub fn record_rollout(&self, target: &str) {
        self.rollouts.with_label_values(&[target]).inc();
    }

    pub fn record_config_group_apply(&self, ok: bool) {
        let result = if ok { "ok" } else { "error" };
        self.config_group_applies.with_label_values(&[result]).inc();
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.get()
    }

    pub fn rollouts(&self, target: &str) -> u64 {
        self.rollouts.with_label_values(&[target]).get()
    }
}

fn render(registry: &Registry) -> Result<String, String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .map_err(|e| e.to_string())?;
    String::from_utf8(buffer).map_err(|e| e.to_string())
}

pub fn metrics_router(registry: Registry) -> Router {
    Router::new()
        .route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    match render(&registry) {
                        Ok(body) => (StatusCode::OK, body),
                        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e),
                    }
                }
            }),
        )
        .layer(CorsLayer::permissive())
}

/// Serve `/metrics` on all interfaces until `cancel` fires
pub async fn serve_metrics(
    registry: Registry,
    port: u16,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting metrics server on http://{}", addr);

    let app = metrics_router(registry);
    Ok(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await
        {
            error!("Metrics server failed: {}", e);
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        let registry = Registry::new();
        let metrics = SupervisorMetrics::new(&registry).unwrap();
        metrics.record_tick();
        metrics.record_failure("transient");
        metrics.record_rollout("daemonset");
        metrics.record_config_group_apply(true);

        let body = render(&registry).unwrap();
        assert!(body.contains("mw_agent_reconcile_ticks_total 1"));
        assert!(body.contains("mw_agent_reconcile_failures_total{kind=\"transient\"} 1"));
        assert!(body.contains("mw_agent_rollouts_total{target=\"daemonset\"} 1"));
        assert_eq!(metrics.rollouts("daemonset"), 1);
        assert_eq!(metrics.ticks(), 1);
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Registry::new();
        SupervisorMetrics::new(&registry).unwrap();
        assert!(SupervisorMetrics::new(&registry).is_err());
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let registry = Registry::new();
        let metrics = SupervisorMetrics::new(&registry).unwrap();
        metrics.record_tick();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, metrics_router(registry)).await.unwrap();
        });

        let body = reqwest::get(format!("http://{}/metrics", addr))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert!(body.contains("mw_agent_reconcile_ticks_total 1"));
    }
}
