use crate::cache::{http, local, object_store, SourceIdentifier};
use crate::collaborators::{Broker, DataResolver, FactsGatherer};
use crate::config::AgentConfig;
use crate::metrics::AgentMetrics;
use crate::redact::redact_uri;
use crate::snapshot::Snapshot;
use crate::worker::{ApplyRequest, Worker};
use async_trait::async_trait;
use ccm_backoff::BackoffPolicy;
use ccm_system::{Component, ComponentContext, ComponentHandle, Handler};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Facts and data refreshes are rate-limited to once per this interval;
/// repeated calls inside the window short-circuit and reuse the last result.
const REFRESH_RATE_LIMIT: Duration = Duration::from_secs(2 * 60);

/// Attempts beyond this many fall back to the previous snapshot rather than
/// blocking the cycle on an unreachable collaborator.
const MAX_REFRESH_ATTEMPTS: usize = 3;

#[derive(Debug, Clone)]
pub struct ApplyTick;

#[derive(Debug, Clone)]
pub struct HealthCheckTick;

#[derive(Debug)]
pub struct PriorityApply(pub String);

struct SourceDeps {
    apply_engine: Arc<dyn crate::collaborators::ApplyEngine>,
    broker: Option<Arc<dyn Broker>>,
}

/// Owns the event loop, the three timer streams, and the cross-cutting
/// invariants (global serialization of non-health-check applies, fact/data
/// refresh rate limiting, priority-apply fan-in).
pub struct Supervisor {
    config: AgentConfig,
    metrics: Arc<AgentMetrics>,
    facts_gatherer: Arc<dyn FactsGatherer>,
    data_resolver: Option<Arc<dyn DataResolver>>,
    source_deps: Vec<(String, SourceDeps)>,

    workers: HashMap<String, ComponentHandle<Worker>>,
    backoff: BackoffPolicy,

    previous_facts: Option<Snapshot>,
    last_facts_refresh: Option<Instant>,
    previous_data: Option<Snapshot>,
    last_data_refresh: Option<Instant>,

    priority_rx: Option<mpsc::Receiver<String>>,
    priority_tx: mpsc::Sender<String>,
    cancellation_token: tokio_util::sync::CancellationToken,
}

impl Supervisor {
    pub fn new(
        config: AgentConfig,
        facts_gatherer: Arc<dyn FactsGatherer>,
        data_resolver: Option<Arc<dyn DataResolver>>,
        apply_engines: Vec<Arc<dyn crate::collaborators::ApplyEngine>>,
        broker: Option<Arc<dyn Broker>>,
        metrics: Arc<AgentMetrics>,
    ) -> Self {
        let (priority_tx, priority_rx) = mpsc::channel(1);
        let source_deps = config
            .manifests
            .iter()
            .cloned()
            .zip(apply_engines)
            .map(|(source, apply_engine)| {
                (
                    source,
                    SourceDeps {
                        apply_engine,
                        broker: broker.clone(),
                    },
                )
            })
            .collect();

        Supervisor {
            config,
            metrics,
            facts_gatherer,
            data_resolver,
            source_deps,
            workers: HashMap::new(),
            backoff: BackoffPolicy::default_network(),
            previous_facts: None,
            last_facts_refresh: None,
            previous_data: None,
            last_data_refresh: None,
            priority_rx: Some(priority_rx),
            priority_tx,
            cancellation_token: tokio_util::sync::CancellationToken::new(),
        }
    }

    async fn update_data(&mut self) {
        self.refresh_facts().await;
        self.refresh_external_data().await;
    }

    async fn refresh_facts(&mut self) {
        if let Some(last) = self.last_facts_refresh {
            if last.elapsed() < REFRESH_RATE_LIMIT {
                return;
            }
        }
        self.last_facts_refresh = Some(Instant::now());

        let started = Instant::now();
        let mut attempt = 0usize;
        let gathered = loop {
            if attempt > MAX_REFRESH_ATTEMPTS {
                if let Some(previous) = &self.previous_facts {
                    tracing::warn!("facts refresh exhausted retries, reusing previous snapshot");
                    break None;
                } else {
                    tracing::error!("facts refresh exhausted retries with no previous snapshot");
                    break None;
                }
            }
            let gather_started = Instant::now();
            let gather_result = self.facts_gatherer.gather().await;
            self.metrics
                .facts_gather_duration_seconds
                .observe(gather_started.elapsed().as_secs_f64());
            match gather_result {
                Ok(facts) => break Some(facts),
                Err(err) => {
                    tracing::warn!(error = %err, attempt, "facts gather failed");
                    self.metrics.facts_resolve_error_count.with_label_values(&["facts"]).inc();
                    self.backoff.try_sleep(&self.cancellation_token.clone(), attempt).await;
                    attempt += 1;
                }
            }
        };
        self.metrics
            .facts_resolve_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        if let Some(facts) = gathered {
            let snapshot: Snapshot = Arc::new(facts);
            self.previous_facts = Some(snapshot.clone());
            self.propagate_facts(snapshot).await;
        } else if let Some(previous) = self.previous_facts.clone() {
            self.propagate_facts(previous).await;
        }
    }

    async fn refresh_external_data(&mut self) {
        let Some(resolver) = self.data_resolver.clone() else {
            return;
        };
        let Some(url) = self.config.external_data_url.clone() else {
            return;
        };
        if let Some(last) = self.last_data_refresh {
            if last.elapsed() < REFRESH_RATE_LIMIT {
                return;
            }
        }
        self.last_data_refresh = Some(Instant::now());

        let started = Instant::now();
        let mut attempt = 0usize;
        let resolved = loop {
            if attempt > MAX_REFRESH_ATTEMPTS {
                if self.previous_data.is_some() {
                    tracing::warn!(url = %url, "data refresh exhausted retries, reusing previous snapshot");
                }
                break None;
            }
            match resolver.resolve(&url).await {
                // An empty resolved map is treated as a failure: it would
                // otherwise silently blank out every worker's external data.
                Ok(data) if data.is_empty() => {
                    tracing::warn!(url = %url, attempt, "data resolve returned an empty map");
                    self.metrics.data_resolve_error_count.with_label_values(&[&url]).inc();
                    self.backoff.try_sleep(&self.cancellation_token.clone(), attempt).await;
                    attempt += 1;
                }
                Ok(data) => break Some(data),
                Err(err) => {
                    tracing::warn!(url = %url, error = %err, attempt, "data resolve failed");
                    self.metrics.data_resolve_error_count.with_label_values(&[&url]).inc();
                    self.backoff.try_sleep(&self.cancellation_token.clone(), attempt).await;
                    attempt += 1;
                }
            }
        };
        self.metrics
            .data_resolve_duration_seconds
            .observe(started.elapsed().as_secs_f64());

        if let Some(data) = resolved {
            let snapshot: Snapshot = Arc::new(data);
            self.previous_data = Some(snapshot.clone());
            self.propagate_data(snapshot).await;
        } else if let Some(previous) = self.previous_data.clone() {
            self.propagate_data(previous).await;
        }
    }

    async fn propagate_facts(&mut self, facts: Snapshot) {
        for handle in self.workers.values_mut() {
            let _ = handle.send(crate::worker::SetFacts(facts.clone()), None).await;
        }
    }

    async fn propagate_data(&mut self, data: Snapshot) {
        for handle in self.workers.values_mut() {
            let _ = handle.send(crate::worker::SetExternalData(data.clone()), None).await;
        }
    }
}

#[async_trait]
impl Component for Supervisor {
    fn get_name() -> &'static str {
        "Supervisor"
    }

    fn queue_size(&self) -> usize {
        64
    }

    async fn on_start(&mut self, ctx: &ComponentContext<Self>) {
        self.cancellation_token = ctx.cancellation_token.clone();
        for (source, deps) in std::mem::take(&mut self.source_deps) {
            let identifier = match SourceIdentifier::parse(&source) {
                Ok(identifier) => identifier,
                Err(err) => {
                    tracing::error!(source = %source, error = %err, "unrecognized source identifier, skipping");
                    continue;
                }
            };

            let worker = Worker::new(
                source.clone(),
                deps.apply_engine,
                self.metrics.clone(),
                self.priority_tx.clone(),
            );
            let mut handle = ctx.system.start_component(worker);

            match identifier {
                SourceIdentifier::Local(path) => {
                    local::install(&path, &mut handle).await;
                }
                SourceIdentifier::Http(uri) => {
                    // A child token, not the Supervisor's own: a terminal
                    // condition on this one source must never cancel the
                    // Supervisor's event loop or any other worker.
                    http::spawn(
                        uri,
                        self.config.cache_dir.clone(),
                        handle.clone(),
                        self.metrics.clone(),
                        self.backoff.clone(),
                        ctx.cancellation_token.child_token(),
                    );
                }
                SourceIdentifier::ObjectStore { bucket, key } => {
                    if let Some(broker) = deps.broker {
                        object_store::spawn(
                            bucket,
                            key,
                            self.config.cache_dir.clone(),
                            handle.clone(),
                            self.metrics.clone(),
                            broker,
                            self.backoff.clone(),
                            ctx.cancellation_token.child_token(),
                        );
                    } else {
                        tracing::error!(source = %redact_uri(&source), "object-store source configured without a broker");
                    }
                }
            }

            self.workers.insert(source, handle);
        }

        if let Some(mut priority_rx) = self.priority_rx.take() {
            let receiver = ctx.receiver::<PriorityApply>();
            let cancellation_token = ctx.cancellation_token.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancellation_token.cancelled() => return,
                        source = priority_rx.recv() => {
                            match source {
                                Some(source) => {
                                    if receiver.send(PriorityApply(source), None).await.is_err() {
                                        return;
                                    }
                                }
                                None => return,
                            }
                        }
                    }
                }
            });
        }

        self.update_data().await;

        ctx.scheduler
            .schedule(ApplyTick, self.config.interval, ctx, || None);
        if let Some(health_check_interval) = self.config.health_check_interval {
            if self.config.health_check_enabled() {
                ctx.scheduler
                    .schedule(HealthCheckTick, health_check_interval, ctx, || None);
            }
        }
    }

    async fn on_stop(&mut self) -> Result<(), Box<dyn ccm_error::CcmError>> {
        for handle in self.workers.values_mut() {
            handle.stop();
        }
        for handle in self.workers.values_mut() {
            let _ = handle.join().await;
        }
        Ok(())
    }
}

#[async_trait]
impl Handler<ApplyTick> for Supervisor {
    type Result = ();

    async fn handle(&mut self, _message: ApplyTick, ctx: &ComponentContext<Self>) {
        ctx.scheduler
            .schedule(ApplyTick, self.config.interval, ctx, || None);

        self.update_data().await;
        // Sequential: two heavyweight applies must never race on the same
        // machine's resource families.
        let sources: Vec<String> = self.workers.keys().cloned().collect();
        for source in sources {
            if let Some(handle) = self.workers.get(&source) {
                let _ = handle
                    .request(
                        ApplyRequest {
                            force: false,
                            health_check_only: false,
                        },
                        None,
                    )
                    .await;
            }
        }
    }
}

#[async_trait]
impl Handler<HealthCheckTick> for Supervisor {
    type Result = ();

    async fn handle(&mut self, _message: HealthCheckTick, ctx: &ComponentContext<Self>) {
        if let Some(health_check_interval) = self.config.health_check_interval {
            ctx.scheduler
                .schedule(HealthCheckTick, health_check_interval, ctx, || None);
        }

        let requests = self.workers.iter().map(|(source, handle)| {
            let source = source.clone();
            let handle = handle.clone();
            async move {
                let summary = handle
                    .request(
                        ApplyRequest {
                            force: false,
                            health_check_only: true,
                        },
                        None,
                    )
                    .await
                    .ok()
                    .flatten();
                (source, summary)
            }
        });
        let results = futures::future::join_all(requests).await;

        // Remediation triggers are queued and fired only after every worker
        // has reported, so they never interleave with the fan-out phase.
        let mut to_remediate = Vec::new();
        for (source, summary) in results {
            if let Some(summary) = summary {
                if summary.health_check_critical > 0 {
                    to_remediate.push(source);
                }
            }
        }

        for source in to_remediate {
            self.update_data().await;
            if let Some(handle) = self.workers.get(&source) {
                self.metrics
                    .healthcheck_remediations_count
                    .with_label_values(&[&source])
                    .inc();
                let _ = handle
                    .request(
                        ApplyRequest {
                            force: true,
                            health_check_only: false,
                        },
                        None,
                    )
                    .await;
            }
        }
    }
}

#[async_trait]
impl Handler<PriorityApply> for Supervisor {
    type Result = ();

    async fn handle(&mut self, message: PriorityApply, _ctx: &ComponentContext<Self>) {
        self.update_data().await;
        if let Some(handle) = self.workers.get(&message.0) {
            let _ = handle
                .request(
                    ApplyRequest {
                        force: true,
                        health_check_only: false,
                    },
                    None,
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ApplyEngine, ApplyEngineError, FactsGatherError, SessionSummary};
    use ccm_system::System;
    use serde_json::{Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

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

    struct CountingFacts {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl FactsGatherer for CountingFacts {
        async fn gather(&self) -> Result<Map<String, Value>, FactsGatherError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Map::new())
        }
    }

    fn test_config() -> AgentConfig {
        AgentConfig {
            interval: Duration::from_secs(30),
            health_check_interval: None,
            manifests: vec!["/tmp/m.yaml".to_string()],
            external_data_url: None,
            cache_dir: std::env::temp_dir().join("ccm-agent-test"),
            monitor_port: 0,
            log_level: "info".to_string(),
            nats_context: None,
            nats_servers: None,
            choria_token_file: None,
            choria_seed_file: None,
            choria_collective: None,
            nats_tls_ca: None,
            nats_tls_insecure: false,
        }
    }

    #[tokio::test]
    async fn repeated_facts_refresh_within_window_gathers_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let facts = Arc::new(CountingFacts { calls: calls.clone() });
        let mut supervisor = Supervisor::new(
            test_config(),
            facts,
            None,
            vec![Arc::new(NoopEngine)],
            None,
            Arc::new(AgentMetrics::new()),
        );
        supervisor.refresh_facts().await;
        supervisor.refresh_facts().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn builds_one_worker_per_manifest() {
        let system = System::new();
        let supervisor = Supervisor::new(
            test_config(),
            Arc::new(CountingFacts {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            None,
            vec![Arc::new(NoopEngine)],
            None,
            Arc::new(AgentMetrics::new()),
        );
        let mut handle = system.start_component(supervisor);
        tokio::task::yield_now().await;
        handle.stop();
        let _ = handle.join().await;
    }
}
