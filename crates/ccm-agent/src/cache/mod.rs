//! Pluggable per-source cache maintainers. Each variant runs in its own task,
//! wakes on a fixed maintenance interval plus an internal single-slot
//! fetch-notify signal, and on a successful fetch hands the worker a fresh
//! manifest path via [`crate::worker::ManifestReady`].

pub mod http;
pub mod local;
pub mod object_store;

use crate::error::AgentError;
use std::fmt;

/// Fixed cadence at which remote sources are probed for change.
pub const MAINTENANCE_INTERVAL: std::time::Duration = crate::config::MAINTENANCE_INTERVAL;

/// A manifest source identifier, dispatching to the cache-maintainer variant
/// that knows how to fetch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceIdentifier {
    /// Plain filesystem path, no polling.
    Local(String),
    /// `obj://<bucket>/<key>`.
    ObjectStore { bucket: String, key: String },
    /// `http://` or `https://`.
    Http(String),
}

impl SourceIdentifier {
    pub fn parse(raw: &str) -> Result<Self, AgentError> {
        if let Some(rest) = raw.strip_prefix("obj://") {
            let (bucket, key) = rest.split_once('/').ok_or_else(|| {
                AgentError::UnknownScheme(format!("obj:// source missing a key: {raw}"))
            })?;
            if bucket.is_empty() || key.is_empty() {
                return Err(AgentError::UnknownScheme(format!(
                    "obj:// source missing bucket or key: {raw}"
                )));
            }
            return Ok(SourceIdentifier::ObjectStore {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(SourceIdentifier::Http(raw.to_string()));
        }
        if raw.contains("://") {
            return Err(AgentError::UnknownScheme(raw.to_string()));
        }
        Ok(SourceIdentifier::Local(raw.to_string()))
    }

    /// The identifier as originally written, used for the cache directory
    /// name and for logging (HTTP variants must go through [`crate::redact`]
    /// first).
    pub fn raw(&self) -> String {
        match self {
            SourceIdentifier::Local(path) => path.clone(),
            SourceIdentifier::ObjectStore { bucket, key } => format!("obj://{bucket}/{key}"),
            SourceIdentifier::Http(uri) => uri.clone(),
        }
    }
}

impl fmt::Display for SourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceIdentifier::Local(path) => write!(f, "{path}"),
            SourceIdentifier::ObjectStore { .. } => write!(f, "{}", self.raw()),
            SourceIdentifier::Http(uri) => write!(f, "{}", crate::redact::redact_uri(uri)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_path() {
        assert_eq!(
            SourceIdentifier::parse("/etc/ccm/m.yaml").unwrap(),
            SourceIdentifier::Local("/etc/ccm/m.yaml".to_string())
        );
    }

    #[test]
    fn parses_object_store_uri() {
        let parsed = SourceIdentifier::parse("obj://bucket/path/to/key").unwrap();
        assert_eq!(
            parsed,
            SourceIdentifier::ObjectStore {
                bucket: "bucket".to_string(),
                key: "path/to/key".to_string(),
            }
        );
    }

    #[test]
    fn parses_http_uri() {
        let parsed = SourceIdentifier::parse("https://example.com/m.tgz").unwrap();
        assert_eq!(
            parsed,
            SourceIdentifier::Http("https://example.com/m.tgz".to_string())
        );
    }

    #[test]
    fn rejects_unknown_scheme() {
        assert!(SourceIdentifier::parse("ftp://example.com/m.tgz").is_err());
    }
}
