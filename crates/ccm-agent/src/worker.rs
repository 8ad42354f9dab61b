use crate::coalescing::CoalescingChannel;
use crate::collaborators::{ApplyEngine, SessionSummary};
use crate::config::MIN_INTERVAL;
use crate::metrics::AgentMetrics;
use crate::snapshot::{empty_snapshot, Snapshot};
use async_trait::async_trait;
use ccm_system::{Component, ComponentContext, Handler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Per-manifest actor. Every field here is only ever touched from inside a
/// `Handler::handle` call, so the component mailbox -- which the executor
/// drains one message at a time -- is the mutex the design calls for: no two
/// `ApplyRequest`s, `SetFacts`, or `SetExternalData` calls ever overlap.
#[derive(Debug)]
pub struct Worker {
    pub(crate) source_id: String,
    manifest_path: Option<PathBuf>,
    working_dir: Option<PathBuf>,
    facts: Snapshot,
    external_data: Snapshot,
    last_apply: Option<Instant>,
    min_interval: Duration,
    apply_engine: Arc<dyn ApplyEngine>,
    metrics: Arc<AgentMetrics>,
    priority_tx: mpsc::Sender<String>,
    apply_notify: Arc<CoalescingChannel<()>>,
}

impl Worker {
    pub fn new(
        source_id: String,
        apply_engine: Arc<dyn ApplyEngine>,
        metrics: Arc<AgentMetrics>,
        priority_tx: mpsc::Sender<String>,
    ) -> Self {
        Worker {
            source_id,
            manifest_path: None,
            working_dir: None,
            facts: empty_snapshot(),
            external_data: empty_snapshot(),
            last_apply: None,
            min_interval: MIN_INTERVAL,
            apply_engine,
            metrics,
            priority_tx,
            apply_notify: Arc::new(CoalescingChannel::new()),
        }
    }

    /// Handle cache maintainers use to signal "go check now", coalesced with
    /// any trigger already pending.
    pub fn apply_notify_handle(&self) -> Arc<CoalescingChannel<()>> {
        self.apply_notify.clone()
    }
}

#[derive(Debug)]
pub struct ApplyRequest {
    pub force: bool,
    pub health_check_only: bool,
}

#[derive(Debug)]
pub struct SetFacts(pub Snapshot);

#[derive(Debug)]
pub struct SetExternalData(pub Snapshot);

/// Sent by a cache maintainer once a fetch (or the local pass-through) has
/// produced a manifest path.
#[derive(Debug)]
pub struct ManifestReady {
    pub manifest_path: PathBuf,
    pub working_dir: PathBuf,
}

#[async_trait]
impl Component for Worker {
    fn get_name() -> &'static str {
        "Worker"
    }

    fn queue_size(&self) -> usize {
        32
    }

    async fn on_start(&mut self, ctx: &ComponentContext<Self>) {
        let apply_notify = self.apply_notify.clone();
        let priority_tx = self.priority_tx.clone();
        let source_id = self.source_id.clone();
        let cancel = ctx.cancellation_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = apply_notify.take() => {
                        // Mandatory blocking send: back-pressure from the
                        // agent's single-slot priority channel is the only
                        // place this agent lets a sender wait.
                        if priority_tx.send(source_id.clone()).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl Handler<ApplyRequest> for Worker {
    type Result = Option<SessionSummary>;

    async fn handle(&mut self, message: ApplyRequest, _ctx: &ComponentContext<Self>) -> Self::Result {
        let manifest_path = match &self.manifest_path {
            Some(path) => path.clone(),
            None => {
                tracing::warn!(source = %self.source_id, "no manifest path set, skipping apply");
                return None;
            }
        };

        if !message.force && !message.health_check_only {
            if let Some(last_apply) = self.last_apply {
                if last_apply.elapsed() < self.min_interval {
                    tracing::warn!(source = %self.source_id, "skipping apply: ran too recently");
                    return None;
                }
            }
        }

        let span = tracing::info_span!("apply", source = %self.source_id, health_check = message.health_check_only);
        let _enter = span.enter();

        if !message.health_check_only {
            self.last_apply = Some(Instant::now());
        }

        let started_at = Instant::now();
        self.apply_engine.set_facts(self.facts.clone()).await;

        let working_dir = self
            .working_dir
            .clone()
            .unwrap_or_else(|| manifest_path.parent().map(PathBuf::from).unwrap_or_default());

        if let Err(err) = self
            .apply_engine
            .resolve(&manifest_path, &working_dir, self.external_data.clone())
            .await
        {
            tracing::error!(source = %self.source_id, error = %err, "failed to resolve manifest");
            return None;
        }

        let summary = match self.apply_engine.execute(message.health_check_only).await {
            Ok(summary) => summary,
            Err(err) => {
                tracing::error!(source = %self.source_id, error = %err, "apply engine execution failed");
                return None;
            }
        };

        let elapsed = started_at.elapsed().as_secs_f64();
        if message.health_check_only {
            self.metrics
                .healthcheck_duration_seconds
                .with_label_values(&[&self.source_id])
                .observe(elapsed);
            if summary.health_check_critical > 0 {
                tracing::warn!(source = %self.source_id, critical = summary.health_check_critical, "health check reported critical status");
            }
        } else {
            self.metrics
                .apply_duration_seconds
                .with_label_values(&[&self.source_id])
                .observe(elapsed);
            if summary.is_healthy() {
                tracing::info!(source = %self.source_id, ?summary, "apply completed");
            } else {
                tracing::warn!(source = %self.source_id, ?summary, "apply completed with failures");
            }
        }

        Some(summary)
    }
}

#[async_trait]
impl Handler<SetFacts> for Worker {
    type Result = ();

    async fn handle(&mut self, message: SetFacts, _ctx: &ComponentContext<Self>) {
        self.facts = message.0;
    }
}

#[async_trait]
impl Handler<SetExternalData> for Worker {
    type Result = ();

    async fn handle(&mut self, message: SetExternalData, _ctx: &ComponentContext<Self>) {
        self.external_data = message.0;
    }
}

#[async_trait]
impl Handler<ManifestReady> for Worker {
    type Result = ();

    async fn handle(&mut self, message: ManifestReady, _ctx: &ComponentContext<Self>) {
        self.manifest_path = Some(message.manifest_path);
        self.working_dir = Some(message.working_dir);
        self.apply_notify.offer(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::ApplyEngineError;
    use ccm_system::System;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingEngine {
        executions: AtomicUsize,
    }

    #[async_trait]
    impl ApplyEngine for CountingEngine {
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
            self.executions.fetch_add(1, Ordering::SeqCst);
            Ok(SessionSummary {
                total: 1,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn apply_without_manifest_path_returns_none() {
        let system = System::new();
        let (tx, _rx) = mpsc::channel(1);
        let engine = Arc::new(CountingEngine::default());
        let worker = Worker::new(
            "test".to_string(),
            engine.clone(),
            Arc::new(AgentMetrics::new()),
            tx,
        );
        let mut handle = system.start_component(worker);
        let result = handle
            .request(
                ApplyRequest {
                    force: true,
                    health_check_only: false,
                },
                None,
            )
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(engine.executions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn min_interval_skips_rapid_reapply() {
        let system = System::new();
        let (tx, _rx) = mpsc::channel(1);
        let engine = Arc::new(CountingEngine::default());
        let worker = Worker::new(
            "test".to_string(),
            engine.clone(),
            Arc::new(AgentMetrics::new()),
            tx,
        );
        let mut handle = system.start_component(worker);
        handle
            .send(
                ManifestReady {
                    manifest_path: PathBuf::from("/tmp/m.yaml"),
                    working_dir: PathBuf::from("/tmp"),
                },
                None,
            )
            .await
            .unwrap();
        tokio::task::yield_now().await;

        let first = handle
            .request(
                ApplyRequest {
                    force: false,
                    health_check_only: false,
                },
                None,
            )
            .await
            .unwrap();
        assert!(first.is_some());

        let second = handle
            .request(
                ApplyRequest {
                    force: false,
                    health_check_only: false,
                },
                None,
            )
            .await
            .unwrap();
        assert!(second.is_none());
        assert_eq!(engine.executions.load(Ordering::SeqCst), 1);
    }
}
