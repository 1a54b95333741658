//! Error taxonomy for the supervisor
//!
//! Library code returns [`SupervisorError`]; the binary wraps it in `anyhow`
//! at the launcher boundary.

use std::path::PathBuf;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum SupervisorError {
    /// The tenant target cannot yield a control-plane base URL
    #[error("invalid target {0:?}: expected a URL whose host has at least three labels")]
    InvalidTarget(String),

    /// One element of the host-tag string is not a `key:value` pair
    #[error("invalid host tag {0:?}: expected key:value")]
    InvalidHostTags(String),

    #[error("restart-status API returned HTTP {status}")]
    RestartStatusApiNotOk { status: u16 },

    /// Non-success answer from any other control-plane endpoint
    #[error("{endpoint} API returned HTTP {status}")]
    ApiNotOk { endpoint: &'static str, status: u16 },

    #[error("invalid response from {endpoint} API: {reason}")]
    InvalidResponse {
        endpoint: &'static str,
        reason: String,
    },

    #[error("pipeline document has no receivers section")]
    ReceiverKeyNotFound,

    #[error("malformed pipeline document: {0}")]
    ParseError(String),

    /// The materialized document failed validation and was not applied
    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),

    #[error("{context}: {source}")]
    Transient {
        context: String,
        #[source]
        source: BoxError,
    },

    /// Non-retryable orchestrator failure (forbidden, not found, bad request)
    #[error("{context}: {source}")]
    Orchestrator {
        context: String,
        #[source]
        source: BoxError,
    },

    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("failed to deliver signal: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("operation cancelled")]
    Cancelled,
}

impl SupervisorError {
    pub fn transient(
        context: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        SupervisorError::Transient {
            context: context.into(),
            source: source.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SupervisorError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_response(endpoint: &'static str, reason: impl Into<String>) -> Self {
        SupervisorError::InvalidResponse {
            endpoint,
            reason: reason.into(),
        }
    }

    /// Whether the next tick is expected to succeed without intervention
    pub fn is_transient(&self) -> bool {
        match self {
            SupervisorError::Transient { .. } => true,
            SupervisorError::RestartStatusApiNotOk { status }
            | SupervisorError::ApiNotOk { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, SupervisorError::Cancelled)
    }

    /// Short label used for logging fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            SupervisorError::InvalidTarget(_) => "invalid_target",
            SupervisorError::InvalidHostTags(_) => "invalid_host_tags",
            SupervisorError::RestartStatusApiNotOk { .. } => "restart_status_not_ok",
            SupervisorError::ApiNotOk { .. } => "api_not_ok",
            SupervisorError::InvalidResponse { .. } => "invalid_response",
            SupervisorError::ReceiverKeyNotFound => "receiver_key_not_found",
            SupervisorError::ParseError(_) => "parse_error",
            SupervisorError::InvalidConfig(_) => "invalid_config",
            SupervisorError::Transient { .. } => "transient",
            SupervisorError::Orchestrator { .. } => "orchestrator",
            SupervisorError::Io { .. } => "io",
            SupervisorError::Config(_) => "config",
            SupervisorError::Signal(_) => "signal",
            SupervisorError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = SupervisorError::transient(
            "connect",
            std::io::Error::new(std::io::ErrorKind::TimedOut, "timed out"),
        );
        assert!(err.is_transient());
        assert_eq!(err.to_string(), "connect: timed out");

        assert!(SupervisorError::RestartStatusApiNotOk { status: 503 }.is_transient());
        assert!(!SupervisorError::RestartStatusApiNotOk { status: 401 }.is_transient());
        assert!(!SupervisorError::ReceiverKeyNotFound.is_transient());
    }

    #[test]
    fn test_invalid_host_tags_carries_element() {
        let err = SupervisorError::InvalidHostTags("test".to_string());
        assert!(err.to_string().contains("\"test\""));
        assert_eq!(err.kind(), "invalid_host_tags");
    }

    #[test]
    fn test_cancelled() {
        assert!(SupervisorError::Cancelled.is_cancelled());
        assert!(!SupervisorError::Config("x".into()).is_cancelled());
    }
}
