//! Local file variant: no polling, no background task. The manifest path is
//! the source identifier itself.

use crate::worker::{ManifestReady, Worker};
use ccm_system::ComponentHandle;
use std::path::PathBuf;

pub async fn install(source_path: &str, worker: &mut ComponentHandle<Worker>) {
    let manifest_path = PathBuf::from(source_path);
    let working_dir = manifest_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));

    if let Err(err) = worker
        .send(
            ManifestReady {
                manifest_path,
                working_dir,
            },
            None,
        )
        .await
    {
        tracing::error!(source = %source_path, error = %err, "failed to notify worker of local manifest path");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ApplyEngine, ApplyEngineError, SessionSummary};
    use crate::metrics::AgentMetrics;
    use crate::snapshot::Snapshot;
    use async_trait::async_trait;
    use ccm_system::System;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    struct NoopEngine;

    #[async_trait]
    impl ApplyEngine for NoopEngine {
        async fn set_facts(&self, _facts: Snapshot) {}
        async fn resolve(
            &self,
            _manifest_path: &std::path::Path,
            _working_dir: &std::path::Path,
            _data: Snapshot,
        ) -> Result<(), ApplyEngineError> {
            Ok(())
        }
        async fn execute(&self, _health_check_only: bool) -> Result<SessionSummary, ApplyEngineError> {
            Ok(SessionSummary {
                total: 1,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn sets_manifest_path_and_triggers_apply() {
        let system = System::new();
        let (tx, _rx) = mpsc::channel(1);
        let engine = Arc::new(NoopEngine);
        let mut handle = system.start_component(Worker::new(
            "test".to_string(),
            engine,
            Arc::new(AgentMetrics::new()),
            tx,
        ));

        install("/tmp/m.yaml", &mut handle).await;
        tokio::task::yield_now().await;

        let summary = handle
            .request(
                crate::worker::ApplyRequest {
                    force: false,
                    health_check_only: false,
                },
                None,
            )
            .await
            .unwrap();
        assert!(summary.is_some());
    }
}
