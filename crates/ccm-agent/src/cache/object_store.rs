//! Object-store variant: `obj://<bucket>/<key>`. Runs a small state machine
//! per wake-up (connect, bind, watch) plus a concurrent fetcher task driven
//! by a coalescing fetch-notify signal and the shared backoff policy.

use crate::cache::MAINTENANCE_INTERVAL;
use crate::coalescing::CoalescingChannel;
use crate::collaborators::{Broker, BucketEvent};
use crate::fetch_install;
use crate::metrics::AgentMetrics;
use ccm_archive::identifier_to_dir_name;
use ccm_backoff::BackoffPolicy;
use ccm_system::ComponentHandle;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

enum State {
    Connecting,
    Binding,
    Watching,
}

pub fn spawn(
    bucket: String,
    key: String,
    cache_dir: PathBuf,
    mut worker: ComponentHandle<crate::worker::Worker>,
    metrics: Arc<AgentMetrics>,
    broker: Arc<dyn Broker>,
    backoff: BackoffPolicy,
    cancellation_token: CancellationToken,
) -> Arc<CoalescingChannel<()>> {
    let fetch_notify = Arc::new(CoalescingChannel::new());
    let fetcher_notify = fetch_notify.clone();
    let dir_name = identifier_to_dir_name(&format!("obj://{bucket}/{key}"));

    {
        let cancellation_token = cancellation_token.clone();
        let cache_dir = cache_dir.clone();
        let dir_name = dir_name.clone();
        let metrics = metrics.clone();
        let broker = broker.clone();
        let backoff = backoff.clone();
        tokio::spawn(async move {
            run_fetcher(
                fetcher_notify,
                broker,
                bucket.clone(),
                key.clone(),
                cache_dir,
                dir_name,
                &mut worker,
                metrics,
                backoff,
                cancellation_token,
            )
            .await;
        });
    }

    fetch_notify
}

#[allow(clippy::too_many_arguments)]
async fn run_fetcher(
    fetch_notify: Arc<CoalescingChannel<()>>,
    broker: Arc<dyn Broker>,
    bucket: String,
    key: String,
    cache_dir: PathBuf,
    dir_name: String,
    worker: &mut ComponentHandle<crate::worker::Worker>,
    metrics: Arc<AgentMetrics>,
    backoff: BackoffPolicy,
    cancellation_token: CancellationToken,
) {
    let attempt = Arc::new(AtomicUsize::new(0));

    // Every source gets an initial fetch regardless of what the watch
    // stream reports, since a fresh `watch()` subscription only yields
    // events for changes made after it starts, not the object's current
    // state.
    fetch_notify.offer(());

    // Watcher: walks Connecting -> Binding -> Watching, coalescing matching
    // updates into `fetch_notify`, until the bucket reports a terminal
    // delete or the token cancels.
    let watcher = {
        let fetch_notify = fetch_notify.clone();
        let cancellation_token = cancellation_token.clone();
        let broker = broker.clone();
        async move {
            let mut state = State::Connecting;
            loop {
                if cancellation_token.is_cancelled() {
                    return;
                }
                match state {
                    State::Connecting => {
                        // Broker handle acquisition is lazy and retried on
                        // every wake-up; no persistent connection object is
                        // modeled here.
                        state = State::Binding;
                    }
                    State::Binding => match broker.open_bucket(&bucket).await {
                        Ok(()) => state = State::Watching,
                        Err(err) => {
                            tracing::warn!(%bucket, error = %err, "failed to open bucket, retrying");
                            tokio::select! {
                                _ = cancellation_token.cancelled() => return,
                                _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
                            }
                            state = State::Connecting;
                        }
                    },
                    State::Watching => {
                        let stream = match broker.watch(&bucket).await {
                            Ok(stream) => stream,
                            Err(err) => {
                                tracing::warn!(%bucket, error = %err, "failed to watch bucket, retrying");
                                tokio::select! {
                                    _ = cancellation_token.cancelled() => return,
                                    _ = tokio::time::sleep(MAINTENANCE_INTERVAL) => {}
                                }
                                state = State::Connecting;
                                continue;
                            }
                        };
                        consume_events(stream, &key, &fetch_notify, &cancellation_token).await;
                        // Stream ended without a terminal delete (e.g. broker
                        // reconnect); fall back to reconnecting.
                        state = State::Connecting;
                    }
                }
            }
        }
    };

    let fetcher = async move {
        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => return,
                _ = fetch_notify.take() => {}
            }
            match broker.download(&bucket, &key).await {
                Ok(body) => {
                    match fetch_install::install(body, &cache_dir, &dir_name, worker, &metrics, &dir_name).await {
                        Ok(()) => attempt.store(0, Ordering::SeqCst),
                        Err(err) => {
                            tracing::error!(%bucket, %key, error = %err, "failed to install fetched object");
                            schedule_retry(&attempt, &backoff, &fetch_notify, &cancellation_token);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%bucket, %key, error = %err, "failed to download object");
                    schedule_retry(&attempt, &backoff, &fetch_notify, &cancellation_token);
                }
            }
        }
    };

    tokio::join!(watcher, fetcher);
}

async fn consume_events(
    mut stream: Box<dyn futures::Stream<Item = BucketEvent> + Send + Unpin>,
    key: &str,
    fetch_notify: &CoalescingChannel<()>,
    cancellation_token: &CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancellation_token.cancelled() => return,
            event = stream.next() => {
                match event {
                    Some(BucketEvent::Updated { key: event_key }) if event_key == key => {
                        fetch_notify.offer(());
                    }
                    Some(BucketEvent::Updated { .. }) => {}
                    Some(BucketEvent::Deleted { key: event_key }) if event_key == key => {
                        cancellation_token.cancel();
                        tracing::warn!(%key, "file deleted from bucket, worker shutting down");
                        return;
                    }
                    Some(BucketEvent::Deleted { .. }) => {}
                    None => return,
                }
            }
        }
    }
}

fn schedule_retry(
    attempt: &Arc<AtomicUsize>,
    backoff: &BackoffPolicy,
    fetch_notify: &Arc<CoalescingChannel<()>>,
    cancellation_token: &CancellationToken,
) {
    let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
    let fetch_notify = fetch_notify.clone();
    backoff.after_func(n, cancellation_token.clone(), move || async move {
        fetch_notify.offer(());
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dir_name_is_filesystem_safe() {
        let name = identifier_to_dir_name("obj://bucket/path/to/key");
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
    }
}
