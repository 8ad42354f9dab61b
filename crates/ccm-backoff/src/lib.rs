//! A reusable, jittered backoff schedule shared by every retry loop in the
//! agent: fact/data refresh, the HTTP and object-store cache maintainers, and
//! the fetch-and-install pipeline all draw their delays from a
//! [`BackoffPolicy`] rather than rolling their own.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// An ordered list of base delays in milliseconds. The delay used for retry
/// attempt `n` is `base[min(n, len - 1)]`, scaled by a uniform jitter in
/// `[0.5, 1.5]` -- except a base of exactly `0` is always returned verbatim,
/// which lets callers model a delay-free "grace" first attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    base_delays_ms: Vec<u64>,
}

/// The outcome of [`BackoffPolicy::retry`]: either the attempt closure
/// eventually returned success, or the cancellation token fired first.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Completed(T),
    Cancelled,
}

impl<T> RetryOutcome<T> {
    pub fn completed(self) -> Option<T> {
        match self {
            RetryOutcome::Completed(value) => Some(value),
            RetryOutcome::Cancelled => None,
        }
    }
}

impl BackoffPolicy {
    /// Builds a policy from explicit base delays. Panics if the list is
    /// empty: a policy with no steps cannot compute a delay for any attempt.
    pub fn new(base_delays_ms: Vec<u64>) -> Self {
        assert!(
            !base_delays_ms.is_empty(),
            "a backoff policy needs at least one base delay"
        );
        BackoffPolicy { base_delays_ms }
    }

    /// A moderate ladder suitable for network retries: roughly 1s, 2s, 5s,
    /// 10s, 30s, saturating at 30s for any further attempt.
    pub fn default_network() -> Self {
        BackoffPolicy::new(vec![1_000, 2_000, 5_000, 10_000, 30_000])
    }

    /// A zero-delay first attempt followed by a flat five-second step; used
    /// where an immediate retry is desirable before falling back to a steady
    /// cadence (e.g. the object-store fetcher's first re-attempt).
    pub fn five_second_with_grace() -> Self {
        BackoffPolicy::new(vec![0, 5_000])
    }

    /// The jittered delay for retry attempt `n` (0-indexed). The base step is
    /// `base_delays_ms[min(n, len - 1)]`; a base of `0` is returned exactly,
    /// every other base is scaled by a uniform factor in `[0.5, 1.5]`.
    pub fn duration(&self, attempt: usize) -> Duration {
        let idx = attempt.min(self.base_delays_ms.len() - 1);
        let base_ms = self.base_delays_ms[idx];
        if base_ms == 0 {
            return Duration::ZERO;
        }
        let jitter = rand::thread_rng().gen_range(0.5..=1.5);
        Duration::from_secs_f64(base_ms as f64 / 1000.0 * jitter)
    }

    /// Sleeps for `d`, returning early (and reporting as much) if `cancel`
    /// fires first.
    pub async fn sleep(cancel: &CancellationToken, d: Duration) -> bool {
        if d.is_zero() {
            return !cancel.is_cancelled();
        }
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(d) => true,
        }
    }

    /// Sleeps for [`Self::duration`] of `attempt`, cancellable via `cancel`.
    /// Returns `false` if cancellation won the race.
    pub async fn try_sleep(&self, cancel: &CancellationToken, attempt: usize) -> bool {
        Self::sleep(cancel, self.duration(attempt)).await
    }

    /// Repeatedly calls `attempt_fn` with an increasing attempt counter,
    /// sleeping [`Self::duration`] between tries, until it returns `Ok` or
    /// `cancel` fires.
    pub async fn retry<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> RetryOutcome<T>
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return RetryOutcome::Cancelled;
            }
            match attempt_fn(attempt).await {
                Ok(value) => return RetryOutcome::Completed(value),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "attempt failed, backing off");
                    if !self.try_sleep(cancel, attempt).await {
                        return RetryOutcome::Cancelled;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Schedules `f` to run once, after [`Self::duration`] of `attempt`, on
    /// its own task. Used for the object-store fetcher's one-shot
    /// re-notification after a failed download. Cancellation of `cancel`
    /// skips `f` entirely.
    pub fn after_func<F, Fut>(
        &self,
        attempt: usize,
        cancel: CancellationToken,
        f: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let delay = self.duration(attempt);
        tokio::spawn(async move {
            if Self::sleep(&cancel, delay).await {
                f().await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_saturates_at_last_index() {
        let policy = BackoffPolicy::new(vec![100, 200, 300]);
        for attempt in 3..10 {
            let d = policy.duration(attempt).as_secs_f64();
            assert!((0.15..=0.45).contains(&d), "attempt {attempt} gave {d}");
        }
    }

    #[test]
    fn zero_base_is_exact() {
        let policy = BackoffPolicy::five_second_with_grace();
        assert_eq!(policy.duration(0), Duration::ZERO);
        let grace = policy.duration(1).as_secs_f64();
        assert!((2.5..=7.5).contains(&grace));
    }

    #[test]
    fn jitter_stays_within_band() {
        let policy = BackoffPolicy::new(vec![1_000]);
        for attempt in 0..200 {
            let secs = policy.duration(attempt).as_secs_f64();
            assert!((0.5..=1.5).contains(&secs), "attempt {attempt} gave {secs}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_halts_on_success() {
        let policy = BackoffPolicy::new(vec![10]);
        let cancel = CancellationToken::new();
        let mut calls = 0;
        let outcome = policy
            .retry(&cancel, |_attempt| {
                calls += 1;
                let done = calls >= 3;
                async move {
                    if done {
                        Ok::<_, &'static str>(calls)
                    } else {
                        Err("not yet")
                    }
                }
            })
            .await;
        match outcome {
            RetryOutcome::Completed(value) => assert_eq!(value, 3),
            RetryOutcome::Cancelled => panic!("expected completion"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_halts_on_cancel() {
        let policy = BackoffPolicy::new(vec![10_000]);
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1)).await;
            cancel_clone.cancel();
        });
        let outcome: RetryOutcome<()> = policy
            .retry(&cancel, |_attempt| async { Err::<(), _>("always fails") })
            .await;
        assert!(matches!(outcome, RetryOutcome::Cancelled));
    }
}
