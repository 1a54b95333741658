//! Pipeline document model and builder
//!
//! The server delivers pipeline documents as untyped trees. This module wraps
//! them in [`PipelineDocument`], turns a [`ReceivedBundle`] into the final
//! bytes with [`DocumentBuilder`], and knows which component types the local
//! engine supports ([`ComponentRegistry`]).
//!
//! [`ReceivedBundle`]: crate::controlplane::ReceivedBundle

pub mod builder;
pub mod document;
pub mod registry;

pub use builder::{BuildOptions, BuiltDocument, DocumentBuilder};
pub use document::PipelineDocument;
pub use registry::{ComponentKind, ComponentRegistry};

use std::fmt;
use std::path::Path;
use tracing::debug;

/// Label under which the server returns a document variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// Single host with a reachable container-runtime socket
    Docker,
    /// Single host without a container runtime
    NoDocker,
    /// Cluster controller (single replica)
    Deployment,
    /// Cluster per-node worker set
    DaemonSet,
}

impl Flavor {
    pub fn as_str(&self) -> &'static str {
        match self {
            Flavor::Docker => "docker",
            Flavor::NoDocker => "nodocker",
            Flavor::Deployment => "deployment",
            Flavor::DaemonSet => "daemonset",
        }
    }

    /// Both variants of the deployment family this flavor belongs to
    pub fn family(&self) -> [Flavor; 2] {
        if self.is_cluster() {
            [Flavor::Deployment, Flavor::DaemonSet]
        } else {
            [Flavor::Docker, Flavor::NoDocker]
        }
    }

    pub fn is_cluster(&self) -> bool {
        matches!(self, Flavor::Deployment | Flavor::DaemonSet)
    }

    /// Pick the single-host flavor from the container-runtime endpoint
    ///
    /// `docker` only when the endpoint is a `scheme://path` pair whose path
    /// is an existing unix socket.
    pub fn detect_host(docker_endpoint: &str) -> Flavor {
        let parts: Vec<&str> = docker_endpoint.split("//").collect();
        if parts.len() == 2 && is_socket(Path::new(parts[1])) {
            Flavor::Docker
        } else {
            debug!(endpoint = docker_endpoint, "No container runtime socket found");
            Flavor::NoDocker
        }
    }
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn is_socket(path: &Path) -> bool {
    use std::os::unix::fs::FileTypeExt;

    std::fs::metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}
