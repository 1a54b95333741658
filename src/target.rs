//! Tenant target resolution
//!
//! Turns the ingestion target URL into the control-plane base URL and
//! validates the host-tag string before anything else starts.

use crate::error::SupervisorError;
use reqwest::Url;
use std::fmt;

/// Base URL of the control-plane API, without a trailing slash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPlaneBase {
    url: Url,
    raw: String,
}

impl ControlPlaneBase {
    /// Parse an explicit base URL, as given by the config-check override
    pub fn parse(base: &str) -> Result<Self, SupervisorError> {
        let raw = base.trim_end_matches('/').to_string();
        let url = Url::parse(&raw).map_err(|_| SupervisorError::InvalidTarget(base.to_string()))?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(SupervisorError::InvalidTarget(base.to_string()));
        }
        Ok(Self { url, raw })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// Build an endpoint URL by appending path segments to the base
    ///
    /// Segments are percent-encoded, so an API key can never escape its
    /// position in the path.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, SupervisorError> {
        let mut url = self.url.clone();
        url.path_segments_mut()
            .map_err(|_| SupervisorError::InvalidTarget(self.raw.clone()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

impl fmt::Display for ControlPlaneBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Derive the control-plane base from the tenant's ingestion target
///
/// The host must have at least three dot-separated labels
/// (`myaccount.middleware.io`); bare apex domains are rejected.
pub fn derive_control_plane(target: &str) -> Result<ControlPlaneBase, SupervisorError> {
    let url = Url::parse(target).map_err(|_| SupervisorError::InvalidTarget(target.to_string()))?;
    let host = url
        .host_str()
        .ok_or_else(|| SupervisorError::InvalidTarget(target.to_string()))?;

    if host.split('.').count() < 3 {
        return Err(SupervisorError::InvalidTarget(target.to_string()));
    }

    ControlPlaneBase::parse(target)
}

/// Validate a comma-separated list of `key:value` host tags
///
/// The empty string is valid. Otherwise every element must contain exactly
/// one colon with non-empty text on both sides; the first offending element
/// is returned verbatim in the error.
pub fn validate_host_tags(tags: &str) -> Result<(), SupervisorError> {
    if tags.is_empty() {
        return Ok(());
    }

    for element in tags.split(',') {
        let valid = match element.split_once(':') {
            Some((key, value)) => !key.is_empty() && !value.is_empty() && !value.contains(':'),
            None => false,
        };
        if !valid {
            return Err(SupervisorError::InvalidHostTags(element.to_string()));
        }
    }

    Ok(())
}

/// Target handed to the pipeline engine, with the port defaulted to 443
pub fn engine_target(target: &str) -> Result<String, SupervisorError> {
    let trimmed = target.trim_end_matches('/');
    let authority = target
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(target)
        .split('/')
        .next()
        .unwrap_or_default();

    if authority.is_empty() {
        return Err(SupervisorError::InvalidTarget(target.to_string()));
    }

    let has_port = authority
        .rsplit_once(':')
        .map(|(_, port)| !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()))
        .unwrap_or(false);

    if has_port {
        Ok(trimmed.to_string())
    } else {
        Ok(format!("{}:443", trimmed))
    }
}
