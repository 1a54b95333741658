use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mw_agent::config::{load_config_file, CheckInterval, HostConfig, KubeConfig, DEFAULT_CONFIG_FILE};
use mw_agent::launcher::{run_host_agent, run_kube_updater};
use mw_agent::logging::init_logging;
use mw_agent::metrics::{serve_metrics, SupervisorMetrics};
use mw_agent::platform::InfraPlatform;
use mw_agent::AGENT_VERSION;
use prometheus::Registry;
use std::path::PathBuf;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "mw-agent")]
#[command(about = "Telemetry agent supervisor: keeps the collector's pipeline configuration in sync with the control plane")]
#[command(version)]
struct Cli {
    /// Agent config file, YAML, JSON or TOML (default: /etc/mw-agent/agent-config.yaml if present)
    #[arg(long, env = "MW_CONFIG_FILE", global = true)]
    config_file: Option<PathBuf>,
    /// Write logs to this file as JSON lines instead of stderr
    #[arg(long, env = "MW_LOGFILE", global = true)]
    logfile: Option<PathBuf>,
    #[arg(long, env = "MW_LOGGING_LEVEL", default_value = "info", global = true)]
    logging_level: String,
    /// Serve supervisor metrics on this port
    #[arg(long, env = "MW_METRICS_PORT", global = true)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the single-host agent and its collector
    Host(HostArgs),
    /// Keep cluster agent workloads in sync with the control plane
    KubeUpdater(KubeArgs),
    /// Print the agent version
    Version,
}

/// Settings shared by both deployments
#[derive(Args)]
struct CommonArgs {
    #[arg(long, env = "MW_API_KEY", hide_env_values = true)]
    api_key: Option<String>,
    /// Tenant URL, e.g. https://myaccount.middleware.io
    #[arg(long, env = "MW_TARGET")]
    target: Option<String>,
    /// Poll interval such as 60s or 5m; 0 disables polling
    #[arg(long, env = "MW_CONFIG_CHECK_INTERVAL")]
    config_check_interval: Option<CheckInterval>,
    /// Control-plane URL to use instead of the one derived from the target
    #[arg(long, env = "MW_API_URL_FOR_CONFIG_CHECK")]
    api_url_for_config_check: Option<String>,
    #[arg(long, env = "MW_ENABLE_DATADOG_RECEIVER")]
    enable_datadog_receiver: Option<bool>,
    #[arg(long, env = "MW_AGENT_FEATURES_METRIC_COLLECTION")]
    metric_collection: Option<bool>,
    #[arg(long, env = "MW_AGENT_FEATURES_LOG_COLLECTION")]
    log_collection: Option<bool>,
}

#[derive(Args)]
struct HostArgs {
    #[command(flatten)]
    common: CommonArgs,
    /// Comma-separated key:value pairs attached to all telemetry
    #[arg(long, env = "MW_HOST_TAGS")]
    host_tags: Option<String>,
    #[arg(long, env = "MW_DOCKER_ENDPOINT")]
    docker_endpoint: Option<String>,
    /// Fetch the pipeline configuration from the control plane
    #[arg(long, env = "MW_FETCH_ACCOUNT_OTEL_CONFIG")]
    fetch_account_otel_config: Option<bool>,
    /// Directory holding configyamls/{all,nodocker}/otel-config.yaml
    #[arg(long, env = "MW_CONFIG_ROOT")]
    config_root: Option<PathBuf>,
    /// Skip platform detection
    #[arg(long, env = "MW_INFRA_PLATFORM")]
    infra_platform: Option<InfraPlatform>,
    #[arg(long, env = "MW_COLLECTOR_BIN")]
    collector_bin: Option<PathBuf>,
    #[arg(long, env = "MW_AGENT_GRPC_PORT")]
    grpc_port: Option<u16>,
    #[arg(long, env = "MW_AGENT_HTTP_PORT")]
    http_port: Option<u16>,
    #[arg(long, env = "MW_AGENT_FLUENT_PORT")]
    fluent_port: Option<u16>,
    #[arg(long, env = "MW_AGENT_INTERNAL_METRICS_PORT")]
    internal_metrics_port: Option<u16>,
}

#[derive(Args)]
struct KubeArgs {
    #[command(flatten)]
    common: CommonArgs,
    #[arg(long, env = "MW_KUBE_CLUSTER_NAME")]
    cluster_name: Option<String>,
    #[arg(long, env = "MW_NAMESPACE_NAME")]
    namespace: Option<String>,
    #[arg(long, env = "MW_DAEMONSET_NAME")]
    daemonset_name: Option<String>,
    #[arg(long, env = "MW_DEPLOYMENT_NAME")]
    deployment_name: Option<String>,
    #[arg(long, env = "MW_DAEMONSET_CONFIGMAP_NAME")]
    daemonset_configmap_name: Option<String>,
    #[arg(long, env = "MW_DEPLOYMENT_CONFIGMAP_NAME")]
    deployment_configmap_name: Option<String>,
}

fn set<T>(field: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *field = value;
    }
}

impl HostArgs {
    fn apply(self, config: &mut HostConfig) {
        let common = self.common;
        set(&mut config.api_key, common.api_key);
        set(&mut config.target, common.target);
        set(&mut config.config_check_interval, common.config_check_interval);
        if common.api_url_for_config_check.is_some() {
            config.api_url_for_config_check = common.api_url_for_config_check;
        }
        set(&mut config.enable_datadog_receiver, common.enable_datadog_receiver);
        set(&mut config.agent_features.metric_collection, common.metric_collection);
        set(&mut config.agent_features.log_collection, common.log_collection);

        set(&mut config.host_tags, self.host_tags);
        set(&mut config.docker_endpoint, self.docker_endpoint);
        set(&mut config.fetch_account_otel_config, self.fetch_account_otel_config);
        set(&mut config.config_root, self.config_root);
        if self.infra_platform.is_some() {
            config.infra_platform = self.infra_platform;
        }
        set(&mut config.collector_bin, self.collector_bin);
        set(&mut config.ports.grpc, self.grpc_port);
        set(&mut config.ports.http, self.http_port);
        set(&mut config.ports.fluent, self.fluent_port);
        set(&mut config.ports.internal_metrics, self.internal_metrics_port);
    }
}

impl KubeArgs {
    fn apply(self, config: &mut KubeConfig) {
        let common = self.common;
        set(&mut config.api_key, common.api_key);
        set(&mut config.target, common.target);
        set(&mut config.config_check_interval, common.config_check_interval);
        if common.api_url_for_config_check.is_some() {
            config.api_url_for_config_check = common.api_url_for_config_check;
        }
        set(&mut config.enable_datadog_receiver, common.enable_datadog_receiver);
        set(&mut config.agent_features.metric_collection, common.metric_collection);
        set(&mut config.agent_features.log_collection, common.log_collection);

        set(&mut config.cluster_name, self.cluster_name);
        set(&mut config.namespace, self.namespace);
        set(&mut config.daemonset_name, self.daemonset_name);
        set(&mut config.deployment_name, self.deployment_name);
        set(&mut config.daemonset_configmap_name, self.daemonset_configmap_name);
        set(&mut config.deployment_configmap_name, self.deployment_configmap_name);
    }
}

/// Cancel `token` on ctrl-c or SIGTERM
fn spawn_shutdown_listener(token: CancellationToken) -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Interrupt received, shutting down"),
            _ = terminate.recv() => info!("SIGTERM received, shutting down"),
        }
        token.cancel();
    });
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("mw-agent {}", AGENT_VERSION);
        return Ok(());
    }

    let _log_guard = init_logging(&cli.logging_level, cli.logfile.as_deref())?;

    let (config_file, required) = match cli.config_file {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone())?;

    let registry = Registry::new();
    let metrics = SupervisorMetrics::new(&registry).context("failed to register metrics")?;
    let metrics_server = match cli.metrics_port {
        Some(port) => Some(
            serve_metrics(registry, port, cancel.clone())
                .await
                .with_context(|| format!("failed to bind metrics port {port}"))?,
        ),
        None => None,
    };

    let result = match cli.command {
        Commands::Host(args) => {
            let mut config: HostConfig = load_config_file(&config_file, required)?;
            args.apply(&mut config);
            info!(version = AGENT_VERSION, "Starting mw-agent host");
            run_host_agent(config, Some(metrics), cancel.clone()).await
        }
        Commands::KubeUpdater(args) => {
            let mut config: KubeConfig = load_config_file(&config_file, required)?;
            args.apply(&mut config);
            info!(version = AGENT_VERSION, "Starting mw-agent kube-updater");
            run_kube_updater(config, Some(metrics), cancel.clone()).await
        }
        Commands::Version => Ok(()),
    };

    cancel.cancel();
    if let Some(server) = metrics_server {
        let _ = server.await;
    }

    if let Err(e) = &result {
        error!("mw-agent exited: {:#}", e);
    }
    result
}
