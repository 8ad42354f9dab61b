//! External collaborator interfaces. Their implementations -- the manifest
//! language, resource providers, fact probes, and hierarchical external-data
//! lookup -- live outside this subsystem; only the contracts it depends on
//! are defined here.

use crate::snapshot::Snapshot;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApplyEngineError {
    #[error("manifest resolve failed: {0}")]
    Resolve(String),
    #[error("manifest execute failed: {0}")]
    Execute(String),
}

/// Aggregate outcome of one apply, reported by the external apply engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub total: u32,
    pub changed: u32,
    pub failed: u32,
    pub errored: u32,
    pub noop: u32,
    pub refreshed: u32,
    pub skipped: u32,
    pub health_check_critical: u32,
    pub health_check_warning: u32,
}

impl SessionSummary {
    pub fn is_healthy(&self) -> bool {
        self.failed == 0 && self.errored == 0 && self.health_check_critical == 0
    }
}

/// The manifest language, resource providers, and the apply engine itself
/// are out of scope here; this trait is the seam this subsystem calls
/// through.
#[async_trait]
pub trait ApplyEngine: Send + Sync {
    /// Pushes the worker's current facts snapshot into the manager.
    async fn set_facts(&self, facts: Snapshot);

    /// Resolves the manifest at `manifest_path`, overriding external data
    /// with `data`.
    async fn resolve(
        &self,
        manifest_path: &Path,
        working_dir: &Path,
        data: Snapshot,
    ) -> Result<(), ApplyEngineError>;

    /// Executes the resolved manifest, returning a session summary.
    async fn execute(&self, health_check_only: bool) -> Result<SessionSummary, ApplyEngineError>;
}

#[derive(Debug, Error)]
#[error("facts gather failed: {0}")]
pub struct FactsGatherError(pub String);

/// System-probe fact gathering; out of scope, interface only.
#[async_trait]
pub trait FactsGatherer: Send + Sync {
    async fn gather(&self) -> Result<Map<String, Value>, FactsGatherError>;
}

#[derive(Debug, Error)]
#[error("data resolve failed for {url}: {reason}")]
pub struct DataResolveError {
    pub url: String,
    pub reason: String,
}

/// Hierarchical external-data resolution; out of scope, interface only.
#[async_trait]
pub trait DataResolver: Send + Sync {
    async fn resolve(&self, url: &str) -> Result<Map<String, Value>, DataResolveError>;
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connect failed: {0}")]
    Connect(String),
    #[error("bucket open failed: {0}")]
    Bind(String),
    #[error("broker timed out")]
    Timeout,
}

/// A notification about a change to a watched object-store key.
#[derive(Debug, Clone)]
pub enum BucketEvent {
    Updated { key: String },
    Deleted { key: String },
}

/// Broker/message-bus connectivity (credentials config only, no wire
/// protocol) -- out of scope collaborator, interface only.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn open_bucket(&self, bucket: &str) -> Result<(), BrokerError>;
    async fn watch(&self, bucket: &str) -> Result<Box<dyn futures::Stream<Item = BucketEvent> + Send + Unpin>, BrokerError>;
    async fn download(&self, bucket: &str, key: &str) -> Result<Vec<u8>, BrokerError>;
}
