//! Fetcher contract plus the rate-limited, retrying dispatcher that drives it.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "trackrec-fetch";

/// Longest gap a [`RateBudget`] keeps between launches.
pub const MAX_LAUNCH_INTERVAL: Duration = Duration::from_secs(86_400);

/// Slowest pacing a [`RateBudget`] honours: one launch per day.
pub const MIN_RATE_PER_SECOND: f64 = 1.0 / 86_400.0;

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FetchError {
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("carrier returned an empty status")]
    Empty,
    #[error("carrier rejected the request: {0}")]
    Rejected(String),
    #[error("fetch failed: {0}")]
    Failed(String),
    #[error("fetch cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Cancelled => RetryDisposition::NonRetryable,
            FetchError::Timeout(_)
            | FetchError::Empty
            | FetchError::Rejected(_)
            | FetchError::Failed(_) => RetryDisposition::Retryable,
        }
    }
}

/// Collaborator that turns a tracking id into raw carrier status text.
///
/// Implementations must not mutate shared state and must tolerate being
/// dropped mid-flight: the dispatcher abandons the future on timeout.
#[async_trait]
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, tracking_id: &str, timeout: Duration) -> Result<String, FetchError>;
}

/// Delay between attempts. Both shapes are monotonically non-decreasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// Delay before retry number `retry_index` (0 = first retry).
    pub fn delay_for_attempt(&self, retry_index: usize) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(retry_index as u32).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            backoff: Backoff::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(8),
            },
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::Fixed(Duration::ZERO),
        }
    }

    pub fn max_attempts(&self) -> usize {
        self.max_retries + 1
    }

    pub fn delay_for_attempt(&self, retry_index: usize) -> Duration {
        self.backoff.delay_for_attempt(retry_index)
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: usize,
}

/// Runs `operation` until it succeeds, `should_retry` refuses the error, or
/// the policy is exhausted, sleeping the policy's backoff between attempts.
pub async fn retry_with_policy<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    mut operation: F,
    should_retry: R,
) -> RetryOutcome<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(err) => {
                if attempt >= policy.max_attempts() || !should_retry(&err) {
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
                tokio::time::sleep(policy.delay_for_attempt(attempt - 1)).await;
            }
        }
    }
}

/// Launch pacing shared by every worker of a dispatcher.
///
/// Virtual-scheduling token bucket: each `take` reserves the next launch slot
/// under the mutex and sleeps outside it, so a slow fetch never holds up the
/// pacing clock for others. Up to `burst` launches may start back to back.
#[derive(Debug)]
pub struct RateBudget {
    interval: Duration,
    tolerance: Duration,
    state: Mutex<Instant>,
}

impl RateBudget {
    /// Intervals are capped at [`MAX_LAUNCH_INTERVAL`]; non-finite or
    /// non-positive rates disable pacing.
    pub fn new(per_second: f64, burst: u32) -> Self {
        let interval = if per_second.is_finite() && per_second > 0.0 {
            Duration::try_from_secs_f64(1.0 / per_second)
                .map_or(MAX_LAUNCH_INTERVAL, |interval| interval.min(MAX_LAUNCH_INTERVAL))
        } else {
            Duration::ZERO
        };
        let tolerance = interval.saturating_mul(burst.max(1) - 1);
        Self {
            interval,
            tolerance,
            state: Mutex::new(Instant::now()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn take(&self) {
        let launch_at = {
            let mut theoretical = self.state.lock().await;
            let now = Instant::now();
            let tat = (*theoretical).max(now);
            *theoretical = tat + self.interval;
            tat.checked_sub(self.tolerance).unwrap_or(now).max(now)
        };
        tokio::time::sleep_until(launch_at).await;
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub concurrency: usize,
    /// Launches per second; `None` disables pacing.
    pub rate_per_second: Option<f64>,
    pub burst: u32,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            rate_per_second: Some(0.8),
            burst: 1,
            timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Settled result for one tracking id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchOutcome {
    pub tracking_id: String,
    pub raw_status: String,
    pub attempts: u32,
    pub error: Option<FetchError>,
}

impl FetchOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && !self.raw_status.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub launched: usize,
    pub succeeded: usize,
    pub exhausted: usize,
    pub peak_in_flight: usize,
}

#[derive(Debug, Clone)]
pub struct DispatchReport {
    /// One outcome per input id, in input order.
    pub outcomes: Vec<FetchOutcome>,
    pub stats: DispatchStats,
}

struct Shared {
    fetcher: Arc<dyn Fetcher>,
    slots: Semaphore,
    budget: Option<RateBudget>,
    timeout: Duration,
    retry: RetryPolicy,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    launched: AtomicUsize,
}

/// Bounded worker pool over a [`Fetcher`].
///
/// At most `concurrency` fetches are in flight, launches are paced by the
/// shared [`RateBudget`], and every attempt is bounded by `timeout`.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(fetcher: Arc<dyn Fetcher>, config: DispatchConfig) -> Self {
        let concurrency = config.concurrency.max(1);
        let budget = config
            .rate_per_second
            .map(|rate| RateBudget::new(rate, config.burst));
        Self {
            shared: Arc::new(Shared {
                fetcher,
                slots: Semaphore::new(concurrency),
                budget,
                timeout: config.timeout,
                retry: config.retry,
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                launched: AtomicUsize::new(0),
            }),
            concurrency,
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn fetcher_name(&self) -> &str {
        self.shared.fetcher.name()
    }

    /// Fetches every id and joins all workers before returning. Outcomes come
    /// back in input order regardless of completion order.
    pub async fn dispatch(&self, tracking_ids: &[String], cancel: &CancellationToken) -> DispatchReport {
        let launched_before = self.shared.launched.load(Ordering::Relaxed);
        self.shared.peak_in_flight.store(0, Ordering::Relaxed);

        let mut workers = JoinSet::new();
        for (index, tracking_id) in tracking_ids.iter().enumerate() {
            let shared = Arc::clone(&self.shared);
            let cancel = cancel.clone();
            let tracking_id = tracking_id.clone();
            let span = info_span!("fetch_item", tracking_id = %tracking_id);
            workers.spawn(
                async move { (index, run_item(&shared, tracking_id, &cancel).await) }.instrument(span),
            );
        }

        let mut slots: Vec<Option<FetchOutcome>> = vec![None; tracking_ids.len()];
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((index, outcome)) => slots[index] = Some(outcome),
                Err(err) => warn!(error = %err, "fetch worker aborted"),
            }
        }

        let outcomes: Vec<FetchOutcome> = slots
            .into_iter()
            .zip(tracking_ids)
            .map(|(slot, tracking_id)| {
                slot.unwrap_or_else(|| FetchOutcome {
                    tracking_id: tracking_id.clone(),
                    raw_status: String::new(),
                    attempts: 0,
                    error: Some(FetchError::Failed("worker task aborted".to_string())),
                })
            })
            .collect();

        let succeeded = outcomes.iter().filter(|o| o.is_success()).count();
        let stats = DispatchStats {
            launched: self.shared.launched.load(Ordering::Relaxed) - launched_before,
            succeeded,
            exhausted: outcomes.len() - succeeded,
            peak_in_flight: self.shared.peak_in_flight.load(Ordering::Relaxed),
        };
        debug!(?stats, "dispatch joined");
        DispatchReport { outcomes, stats }
    }
}

async fn run_item(shared: &Shared, tracking_id: String, cancel: &CancellationToken) -> FetchOutcome {
    let mut attempts = 0u32;
    let mut last_error = None;

    for attempt in 0..shared.retry.max_attempts() {
        if attempt > 0 {
            let delay = shared.retry.delay_for_attempt(attempt - 1);
            tokio::select! {
                _ = cancel.cancelled() => {
                    last_error = Some(FetchError::Cancelled);
                    break;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }

        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                last_error = Some(FetchError::Cancelled);
                break;
            }
            permit = shared.slots.acquire() => match permit {
                Ok(permit) => permit,
                Err(_) => {
                    last_error = Some(FetchError::Failed("dispatcher closed".to_string()));
                    break;
                }
            },
        };

        if let Some(budget) = &shared.budget {
            tokio::select! {
                _ = cancel.cancelled() => {
                    last_error = Some(FetchError::Cancelled);
                    break;
                }
                _ = budget.take() => {}
            }
        }

        attempts += 1;
        shared.launched.fetch_add(1, Ordering::Relaxed);
        let now_in_flight = shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        shared.peak_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            fetched = tokio::time::timeout(shared.timeout, shared.fetcher.fetch(&tracking_id, shared.timeout)) => {
                fetched.unwrap_or(Err(FetchError::Timeout(shared.timeout)))
            }
        };

        shared.in_flight.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        let err = match result {
            Ok(text) => {
                let text = text.trim();
                if !text.is_empty() {
                    return FetchOutcome {
                        tracking_id,
                        raw_status: text.to_string(),
                        attempts,
                        error: None,
                    };
                }
                FetchError::Empty
            }
            Err(err) => err,
        };

        let retryable = err.disposition() == RetryDisposition::Retryable;
        warn!(attempt = attempts, error = %err, retryable, "fetch attempt failed");
        last_error = Some(err);
        if !retryable {
            break;
        }
    }

    FetchOutcome {
        tracking_id,
        raw_status: String::new(),
        attempts,
        error: last_error,
    }
}
