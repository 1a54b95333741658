//! Single-host rollout: atomic document write and hang-up signal

use super::RolloutDriver;
use crate::error::SupervisorError;
use crate::pipeline::Flavor;
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info};

const DOCUMENT_FILE: &str = "otel-config.yaml";
const DOCUMENT_MODE: u32 = 0o644;

/// Where each single-host flavor's document lives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentPaths {
    root: PathBuf,
}

impl DocumentPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn for_flavor(&self, flavor: Flavor) -> Result<PathBuf, SupervisorError> {
        let dir = match flavor {
            Flavor::Docker => "all",
            Flavor::NoDocker => "nodocker",
            other => {
                return Err(SupervisorError::Config(format!(
                    "{other} documents are not written to the local filesystem"
                )))
            }
        };
        Ok(self.root.join("configyamls").join(dir).join(DOCUMENT_FILE))
    }

    /// Create the flavor's directory and check a file can be written there
    pub fn ensure_writable(&self, flavor: Flavor) -> Result<PathBuf, SupervisorError> {
        let path = self.for_flavor(flavor)?;
        let dir = parent_dir(&path);
        fs::create_dir_all(dir).map_err(|e| SupervisorError::io(dir, e))?;
        NamedTempFile::new_in(dir).map_err(|e| SupervisorError::io(dir, e))?;
        Ok(path)
    }
}

type RestartHook = Arc<dyn Fn() -> Result<(), SupervisorError> + Send + Sync>;

pub struct HostRollout {
    paths: DocumentPaths,
    restart: RestartHook,
}

impl HostRollout {
    /// Rollout that restarts by sending SIGHUP to the agent process
    pub fn new(paths: DocumentPaths) -> Self {
        Self {
            paths,
            restart: Arc::new(signal_self_hangup),
        }
    }

    pub fn with_restart_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn() -> Result<(), SupervisorError> + Send + Sync + 'static,
    {
        self.restart = Arc::new(hook);
        self
    }

    pub fn paths(&self) -> &DocumentPaths {
        &self.paths
    }

    /// Replace the flavor's document atomically, mode 0644
    pub async fn write_document(&self, flavor: Flavor, document: &[u8]) -> Result<PathBuf, SupervisorError> {
        let path = self.paths.for_flavor(flavor)?;
        let target = path.clone();
        let bytes = document.to_vec();

        tokio::task::spawn_blocking(move || write_atomic(&target, &bytes))
            .await
            .map_err(|e| SupervisorError::transient("document writer task failed", e))??;

        info!(path = %path.display(), flavor = %flavor, "Pipeline document written");
        Ok(path)
    }

    pub fn restart(&self) -> Result<(), SupervisorError> {
        debug!("Requesting pipeline engine reload");
        (self.restart)()
    }
}

#[async_trait]
impl RolloutDriver for HostRollout {
    async fn apply_and_restart(&self, document: &[u8], flavor: Flavor) -> Result<(), SupervisorError> {
        self.write_document(flavor, document).await?;
        self.restart()
    }
}

/// Deliver SIGHUP to this process; the launcher turns it into an engine reload
pub fn signal_self_hangup() -> Result<(), SupervisorError> {
    kill(Pid::this(), Signal::SIGHUP)?;
    Ok(())
}

fn parent_dir(path: &Path) -> &Path {
    path.parent().unwrap_or_else(|| Path::new("."))
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), SupervisorError> {
    let dir = parent_dir(path);
    fs::create_dir_all(dir).map_err(|e| SupervisorError::io(dir, e))?;

    let mut file = NamedTempFile::new_in(dir).map_err(|e| SupervisorError::io(dir, e))?;
    file.write_all(bytes)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|e| SupervisorError::io(file.path(), e))?;
    fs::set_permissions(file.path(), fs::Permissions::from_mode(DOCUMENT_MODE))
        .map_err(|e| SupervisorError::io(file.path(), e))?;

    file.persist(path)
        .map_err(|e| SupervisorError::io(path, e.error))?;
    Ok(())
}
