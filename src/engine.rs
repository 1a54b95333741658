//! Pipeline engine adapter
//!
//! The engine is a black box: an external collector binary started once
//! with the document path, told to re-read it on hang-up and stopped with
//! SIGTERM. Values the document references through `${env:...}` are
//! forwarded in the child's environment.

use crate::config::HostConfig;
use crate::error::SupervisorError;
use crate::pipeline::{ComponentRegistry, PipelineDocument};
use crate::target::engine_target;
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time;
use tracing::{debug, info, warn};

/// How long a stopping collector gets before it is killed
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[async_trait]
pub trait PipelineEngine: Send + Sync {
    /// Start the engine on the document at `path`
    async fn start(&self, path: &Path) -> Result<(), SupervisorError>;

    /// Re-read the current document
    async fn reload(&self) -> Result<(), SupervisorError>;

    async fn shutdown(&self) -> Result<(), SupervisorError>;

    fn is_running(&self) -> bool;

    /// Flag mirroring [`PipelineEngine::is_running`] for sharing with reconcilers
    fn running_flag(&self) -> Arc<AtomicBool>;
}

/// Environment the collector's document expects
pub fn collector_env(config: &HostConfig) -> Result<Vec<(String, String)>, SupervisorError> {
    let mut env = vec![
        ("MW_TARGET".to_string(), engine_target(&config.target)?),
        ("MW_API_KEY".to_string(), config.api_key.clone()),
        ("MW_AGENT_GRPC_PORT".to_string(), config.ports.grpc.to_string()),
        ("MW_AGENT_HTTP_PORT".to_string(), config.ports.http.to_string()),
        ("MW_AGENT_FLUENT_PORT".to_string(), config.ports.fluent.to_string()),
        (
            "MW_AGENT_INTERNAL_METRICS_PORT".to_string(),
            config.ports.internal_metrics.to_string(),
        ),
        ("MW_DOCKER_ENDPOINT".to_string(), config.docker_endpoint.clone()),
        ("MW_HOST_TAGS".to_string(), config.host_tags.clone()),
    ];
    if config.enable_datadog_receiver {
        env.push(("MW_ENABLE_DATADOG_RECEIVER".to_string(), "true".to_string()));
    }
    Ok(env)
}

/// Collector running as a child process
pub struct CollectorProcess {
    binary: PathBuf,
    env: Vec<(String, String)>,
    registry: ComponentRegistry,
    child: Mutex<Option<Child>>,
    running: Arc<AtomicBool>,
}

impl CollectorProcess {
    pub fn new(binary: impl Into<PathBuf>, env: Vec<(String, String)>) -> Self {
        Self {
            binary: binary.into(),
            env,
            registry: ComponentRegistry::host_defaults(),
            child: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_registry(mut self, registry: ComponentRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.registry
    }

    async fn pid(&self) -> Option<Pid> {
        let mut child = self.child.lock().await;
        if !self.reap(&mut child) {
            return None;
        }
        child
            .as_ref()?
            .id()
            .and_then(|id| i32::try_from(id).ok())
            .map(Pid::from_raw)
    }

    /// Drop a child that has exited; true while one is still alive
    fn reap(&self, child: &mut Option<Child>) -> bool {
        let Some(handle) = child.as_mut() else {
            return false;
        };
        match handle.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!(status = %status, "Collector exited");
                *child = None;
                self.running.store(false, Ordering::SeqCst);
                false
            }
            Err(e) => {
                warn!("Failed to poll collector: {}", e);
                true
            }
        }
    }
}

#[async_trait]
impl PipelineEngine for CollectorProcess {
    async fn start(&self, path: &Path) -> Result<(), SupervisorError> {
        let mut child = self.child.lock().await;
        if child.is_some() {
            debug!("Collector already running");
            return Ok(());
        }

        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| SupervisorError::io(path, e))?;
        PipelineDocument::from_yaml(&source)?.validate(Some(&self.registry))?;

        let mut command = Command::new(&self.binary);
        command
            .arg("--config")
            .arg(path)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let spawned = command
            .spawn()
            .map_err(|e| SupervisorError::io(&self.binary, e))?;
        info!(binary = %self.binary.display(), config = %path.display(), pid = ?spawned.id(), "Collector started");

        *child = Some(spawned);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn reload(&self) -> Result<(), SupervisorError> {
        let Some(pid) = self.pid().await else {
            debug!("Collector not running, nothing to reload");
            return Ok(());
        };
        kill(pid, Signal::SIGHUP)?;
        info!(pid = %pid, "Collector reload requested");
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), SupervisorError> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::SeqCst);

        if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                warn!(pid, "Failed to signal collector: {}", e);
            }
        }

        match time::timeout(SHUTDOWN_GRACE, child.wait()).await {
            Ok(Ok(status)) => info!(status = %status, "Collector stopped"),
            Ok(Err(e)) => warn!("Failed to wait for collector: {}", e),
            Err(_) => {
                warn!("Collector did not stop in {:?}, killing it", SHUTDOWN_GRACE);
                child
                    .kill()
                    .await
                    .map_err(|e| SupervisorError::io(&self.binary, e))?;
            }
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        // a busy lock means start, reload or shutdown owns the child
        if let Ok(mut child) = self.child.try_lock() {
            self.reap(&mut child);
        }
        self.running.load(Ordering::SeqCst)
    }

    fn running_flag(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }
}
