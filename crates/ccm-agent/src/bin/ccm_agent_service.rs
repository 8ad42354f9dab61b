use ccm_agent::supervisor::Supervisor;
use ccm_agent::AgentConfig;
use ccm_system::System;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

const CONFIG_PATH_ENV_VAR: &str = "CCM_AGENT_CONFIG_PATH";

#[tokio::main]
async fn main() {
    info!("Starting ccm agent service");

    match run().await {
        Ok(()) => info!("ccm agent service completed successfully"),
        Err(err) => {
            error!("ccm agent service failed: {:?}", err);
            panic!("ccm agent service failed: {:?}", err);
        }
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::var(CONFIG_PATH_ENV_VAR) {
        Ok(path) => {
            info!(%path, "loading configuration");
            AgentConfig::load_from_path(&path)?
        }
        Err(_) => {
            info!("no config path set, using default location");
            AgentConfig::load()?
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    info!(interval = ?config.interval, manifests = config.manifests.len(), "loaded configuration");

    let metrics = Arc::new(ccm_agent::metrics::AgentMetrics::new());
    let mut metrics_shutdown = None;
    if config.metrics_enabled() {
        let (tx, rx) = tokio::sync::oneshot::channel();
        metrics_shutdown = Some(tx);
        spawn_metrics_server(config.monitor_port, metrics.registry.clone(), rx);
    }

    let facts_gatherer = no_op_collaborators::facts_gatherer();
    let data_resolver = config
        .external_data_url
        .as_ref()
        .map(|_| no_op_collaborators::data_resolver());
    let apply_engines = config
        .manifests
        .iter()
        .map(|_| no_op_collaborators::apply_engine())
        .collect();
    let broker = if config.nats_servers.is_some() {
        Some(no_op_collaborators::broker())
    } else {
        None
    };

    let system = System::new();
    let supervisor = Supervisor::new(
        config,
        facts_gatherer,
        data_resolver,
        apply_engines,
        broker,
        metrics,
    );
    let mut supervisor_handle = system.start_component(supervisor);

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!("service running, waiting for signals");
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("starting graceful shutdown");
    supervisor_handle.stop();
    supervisor_handle
        .join()
        .await
        .map_err(|err| Box::new(err) as Box<dyn std::error::Error>)?;
    system.join().await;

    if let Some(tx) = metrics_shutdown {
        let _ = tx.send(());
    }

    Ok(())
}

fn spawn_metrics_server(
    port: u16,
    registry: prometheus::Registry,
    mut shutdown: tokio::sync::oneshot::Receiver<()>,
) {
    tokio::spawn(async move {
        use std::net::SocketAddr;

        let addr: SocketAddr = ([0, 0, 0, 0], port).into();
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(err) => {
                error!(%port, error = %err, "failed to bind metrics listener");
                return;
            }
        };

        info!(%port, "metrics endpoint listening");
        loop {
            tokio::select! {
                _ = &mut shutdown => return,
                accepted = listener.accept() => {
                    let Ok((mut socket, _)) = accepted else { continue };
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        use prometheus::Encoder;
                        use tokio::io::{AsyncReadExt, AsyncWriteExt};

                        let mut buf = [0u8; 1024];
                        let _ = socket.read(&mut buf).await;

                        let encoder = prometheus::TextEncoder::new();
                        let metric_families = registry.gather();
                        let mut body = Vec::new();
                        if encoder.encode(&metric_families, &mut body).is_err() {
                            return;
                        }
                        let response = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: {}\r\nContent-Length: {}\r\n\r\n",
                            encoder.format_type(),
                            body.len()
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.write_all(&body).await;
                    });
                }
            }
        }
    });
}

/// Placeholder collaborator implementations. The real manifest language,
/// resource providers, fact probes, and broker wiring are out of scope here;
/// these no-ops let the service binary start and exercise its own lifecycle
/// until a real `ApplyEngine`/`FactsGatherer`/`DataResolver`/`Broker` is
/// wired in by the deployment that embeds this crate.
mod no_op_collaborators {
    use async_trait::async_trait;
    use ccm_agent::collaborators::{
        ApplyEngine, ApplyEngineError, Broker, BrokerError, BucketEvent, DataResolveError,
        DataResolver, FactsGatherError, FactsGatherer, SessionSummary,
    };
    use ccm_agent::snapshot::Snapshot;
    use serde_json::{Map, Value};
    use std::path::Path;
    use std::sync::Arc;

    struct NoOpApplyEngine;

    #[async_trait]
    impl ApplyEngine for NoOpApplyEngine {
        async fn set_facts(&self, _facts: Snapshot) {}

        async fn resolve(
            &self,
            _manifest_path: &Path,
            _working_dir: &Path,
            _data: Snapshot,
        ) -> Result<(), ApplyEngineError> {
            Ok(())
        }

        async fn execute(&self, _health_check_only: bool) -> Result<SessionSummary, ApplyEngineError> {
            Ok(SessionSummary::default())
        }
    }

    struct NoOpFactsGatherer;

    #[async_trait]
    impl FactsGatherer for NoOpFactsGatherer {
        async fn gather(&self) -> Result<Map<String, Value>, FactsGatherError> {
            Ok(Map::new())
        }
    }

    struct NoOpDataResolver;

    #[async_trait]
    impl DataResolver for NoOpDataResolver {
        async fn resolve(&self, _url: &str) -> Result<Map<String, Value>, DataResolveError> {
            Ok(Map::new())
        }
    }

    struct NoOpBroker;

    #[async_trait]
    impl Broker for NoOpBroker {
        async fn open_bucket(&self, _bucket: &str) -> Result<(), BrokerError> {
            Err(BrokerError::Connect("no broker configured".to_string()))
        }

        async fn watch(
            &self,
            _bucket: &str,
        ) -> Result<Box<dyn futures::Stream<Item = BucketEvent> + Send + Unpin>, BrokerError> {
            Err(BrokerError::Connect("no broker configured".to_string()))
        }

        async fn download(&self, _bucket: &str, _key: &str) -> Result<Vec<u8>, BrokerError> {
            Err(BrokerError::Connect("no broker configured".to_string()))
        }
    }

    pub fn apply_engine() -> Arc<dyn ApplyEngine> {
        Arc::new(NoOpApplyEngine)
    }

    pub fn facts_gatherer() -> Arc<dyn FactsGatherer> {
        Arc::new(NoOpFactsGatherer)
    }

    pub fn data_resolver() -> Arc<dyn DataResolver> {
        Arc::new(NoOpDataResolver)
    }

    pub fn broker() -> Arc<dyn Broker> {
        Arc::new(NoOpBroker)
    }
}
