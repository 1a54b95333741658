//! Process entry points for the single-host agent and the cluster updater
//!
//! Everything that can be checked before the loop starts is checked here
//! and is fatal. Once the loop runs, failures are only logged.

use crate::agent::{HostReconciler, KubeReconciler};
use crate::config::{CheckInterval, HostConfig, KubeConfig};
use crate::controlplane::client::DEFAULT_REQUEST_TIMEOUT;
use crate::controlplane::{AgentQuery, ControlPlane, HttpControlPlane};
use crate::engine::{collector_env, CollectorProcess, PipelineEngine};
use crate::error::SupervisorError;
use crate::metrics::SupervisorMetrics;
use crate::pipeline::{BuildOptions, ComponentRegistry, DocumentBuilder, Flavor};
use crate::platform::{detect_infra_platform, hostname_for_platform, InfraPlatform};
use crate::reconcile::{listen_for_config_changes, outcome_channel, Outcome, Reconciler};
use crate::rollout::{ClusterApi, ClusterRollout, DocumentPaths, HostRollout, KubeClusterApi, WorkloadHandle, WorkloadKind};
use crate::target::{derive_control_plane, validate_host_tags, ControlPlaneBase};
use crate::AGENT_VERSION;
use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Control-plane base: the explicit override when given, else derived from the target
pub fn resolve_control_plane(target: &str, api_url_override: Option<&str>) -> Result<ControlPlaneBase, SupervisorError> {
    match api_url_override.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => ControlPlaneBase::parse(url),
        None => derive_control_plane(target),
    }
}

/// Per-request deadline, never longer than one check interval
fn request_timeout(interval: CheckInterval) -> Duration {
    interval
        .period()
        .map_or(DEFAULT_REQUEST_TIMEOUT, |period| period.min(DEFAULT_REQUEST_TIMEOUT))
}

fn require(value: &str, what: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{what} is required");
    }
    Ok(())
}

/// Checks that make the single-host agent refuse to start
pub fn validate_host_config(config: &HostConfig) -> Result<ControlPlaneBase> {
    require(&config.api_key, "api-key")?;
    require(&config.target, "target")?;
    // the collector needs the target even when the control plane is overridden
    derive_control_plane(&config.target).context("invalid target")?;
    validate_host_tags(&config.host_tags).context("invalid host tags")?;
    resolve_control_plane(&config.target, config.api_url_for_config_check.as_deref())
        .context("invalid control-plane URL")
}

/// Run the single-host agent with the external collector until `cancel` fires
pub async fn run_host_agent(
    config: HostConfig,
    metrics: Option<SupervisorMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    validate_host_config(&config)?;
    let engine = CollectorProcess::new(&config.collector_bin, collector_env(&config)?);
    run_host_agent_with(config, Arc::new(engine), metrics, cancel).await
}

/// Single-host launcher over any pipeline engine
pub async fn run_host_agent_with(
    config: HostConfig,
    engine: Arc<dyn PipelineEngine>,
    metrics: Option<SupervisorMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let base = validate_host_config(&config)?;

    let platform = match config.infra_platform {
        Some(platform) => platform,
        None => detect_infra_platform().await,
    };
    let hostname = hostname_for_platform(platform).await;

    let flavor = Flavor::detect_host(&config.docker_endpoint);
    let paths = DocumentPaths::new(&config.config_root);
    let document_path = paths
        .ensure_writable(flavor)
        .context("pipeline document path is not writable")?;

    info!(
        host_id = %hostname,
        infra_platform = %platform,
        flavor = %flavor,
        control_plane = %base,
        document = %document_path.display(),
        "Starting host agent"
    );

    // installed before anything can raise SIGHUP, whose default action terminates
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;

    if !config.fetch_account_otel_config {
        info!("Remote configuration disabled, running the local document");
        engine
            .start(&document_path)
            .await
            .context("failed to start pipeline engine")?;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = hangup.recv() => reload(engine.as_ref()).await,
            }
        }
        engine.shutdown().await.context("failed to stop pipeline engine")?;
        return Ok(());
    }

    let control_plane = HttpControlPlane::new(base, &config.api_key, request_timeout(config.config_check_interval))?;
    let builder = DocumentBuilder::new(BuildOptions {
        host_tags: config.host_tags.clone(),
        infra_platform: platform,
        features: config.agent_features,
        registry: Some(ComponentRegistry::host_defaults()),
    });

    let mut query = AgentQuery::for_host(hostname, AGENT_VERSION);
    query.host_tags = Some(config.host_tags.clone());
    query.infra_platform = Some(platform);
    query.enable_datadog_receiver = config.enable_datadog_receiver;

    let mut reconciler = HostReconciler::new(
        Arc::new(control_plane),
        builder,
        HostRollout::new(paths),
        flavor,
        query,
    )
    .with_collector_flag(engine.running_flag());
    if let Some(metrics) = metrics {
        reconciler = reconciler.with_metrics(metrics);
    }

    let (err_tx, mut err_rx) = outcome_channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let listener = spawn_listener(Arc::new(reconciler), config.config_check_interval, err_tx, stop_rx, cancel.clone());

    let mut listening = true;
    let mut result = Ok(());
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = hangup.recv() => reload(engine.as_ref()).await,
            outcome = err_rx.recv(), if listening => {
                match outcome {
                    Some(outcome) => log_loop_outcome(&outcome),
                    None => {
                        debug!("Config listener finished");
                        listening = false;
                    }
                }
                if !engine.is_running() && document_path.exists() {
                    if let Err(e) = engine.start(&document_path).await {
                        result = Err(anyhow::Error::new(e).context("failed to start pipeline engine"));
                        break;
                    }
                }
            }
        }
    }

    stop_listener(stop_tx, err_rx, listener).await;
    engine.shutdown().await.context("failed to stop pipeline engine")?;
    info!("Host agent stopped");
    result
}

/// Run the cluster configuration updater until `cancel` fires
pub async fn run_kube_updater(
    config: KubeConfig,
    metrics: Option<SupervisorMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    validate_kube_config(&config)?;
    let client = kube::Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let api = KubeClusterApi::new(client, &config.namespace);
    run_kube_updater_with(config, Arc::new(api), metrics, cancel).await
}

pub fn validate_kube_config(config: &KubeConfig) -> Result<ControlPlaneBase> {
    require(&config.api_key, "api-key")?;
    require(&config.cluster_name, "cluster name")?;
    require(&config.namespace, "namespace")?;
    resolve_control_plane(&config.target, config.api_url_for_config_check.as_deref())
        .context("invalid control-plane URL")
}

/// Cluster updater over any orchestrator API
pub async fn run_kube_updater_with(
    config: KubeConfig,
    cluster_api: Arc<dyn ClusterApi>,
    metrics: Option<SupervisorMetrics>,
    cancel: CancellationToken,
) -> Result<()> {
    let base = validate_kube_config(&config)?;
    info!(
        cluster = %config.cluster_name,
        namespace = %config.namespace,
        control_plane = %base,
        "Starting cluster config updater"
    );

    let control_plane: Arc<dyn ControlPlane> = Arc::new(HttpControlPlane::new(
        base,
        &config.api_key,
        request_timeout(config.config_check_interval),
    )?);
    let rollout = ClusterRollout::new(
        cluster_api,
        WorkloadHandle::new(
            WorkloadKind::WorkerSet,
            &config.daemonset_name,
            &config.daemonset_configmap_name,
        ),
        WorkloadHandle::new(
            WorkloadKind::Controller,
            &config.deployment_name,
            &config.deployment_configmap_name,
        ),
    );
    let builder = DocumentBuilder::new(BuildOptions {
        infra_platform: InfraPlatform::Kubernetes,
        features: config.agent_features,
        ..Default::default()
    });

    let mut reconciler = KubeReconciler::new(control_plane, builder, rollout, &config.cluster_name, AGENT_VERSION)
        .with_datadog_receiver(config.enable_datadog_receiver);
    if let Some(metrics) = metrics {
        reconciler = reconciler.with_metrics(metrics);
    }

    let (err_tx, mut err_rx) = outcome_channel();
    let (stop_tx, stop_rx) = oneshot::channel();
    let listener = spawn_listener(Arc::new(reconciler), config.config_check_interval, err_tx, stop_rx, cancel.clone());

    let mut listening = true;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = err_rx.recv(), if listening => match outcome {
                Some(outcome) => log_loop_outcome(&outcome),
                None => {
                    debug!("Config listener finished");
                    listening = false;
                }
            },
        }
    }

    stop_listener(stop_tx, err_rx, listener).await;
    info!("Cluster config updater stopped");
    Ok(())
}

fn spawn_listener<R>(
    reconciler: Arc<R>,
    interval: CheckInterval,
    err_tx: mpsc::Sender<Outcome>,
    stop_rx: oneshot::Receiver<()>,
    cancel: CancellationToken,
) -> JoinHandle<()>
where
    R: Reconciler + 'static,
{
    tokio::spawn(async move {
        listen_for_config_changes(reconciler.as_ref(), interval, err_tx, stop_rx, cancel).await;
    })
}

/// Signal the loop, drain what it still reports and wait for it to exit
async fn stop_listener(stop_tx: oneshot::Sender<()>, mut err_rx: mpsc::Receiver<Outcome>, listener: JoinHandle<()>) {
    // the loop may already be gone
    let _ = stop_tx.send(());
    while let Some(outcome) = err_rx.recv().await {
        log_loop_outcome(&outcome);
    }
    if let Err(e) = listener.await {
        error!("Config listener task failed: {}", e);
    }
}

fn log_loop_outcome(outcome: &Outcome) {
    match outcome {
        Ok(()) => debug!("Config check completed"),
        Err(SupervisorError::Cancelled) => debug!("Config check cancelled"),
        Err(e) => error!(kind = e.kind(), "Config check failed: {}", e),
    }
}

async fn reload(engine: &dyn PipelineEngine) {
    info!("Hang-up received, reloading pipeline engine");
    if let Err(e) = engine.reload().await {
        warn!("Failed to reload pipeline engine: {}", e);
    }
}
