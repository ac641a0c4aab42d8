use crate::request_key::{KeyPattern, RequestDescriptor, RequestKey};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

#[cfg(feature = "graphql")]
use async_graphql::SimpleObject;

pub use tokio_util::sync::CancellationToken;

/// Configuration for request deduplication
#[derive(Clone, Debug)]
pub struct DeduplicationConfig {
    /// How long a single attempt may run before it fails with a timeout
    pub request_timeout: Duration,
    /// Extra attempts after the first one fails
    pub retries: u32,
    /// Successful results stay shareable this long after the request started
    pub coalesce_window: Duration,
    /// Delay before the first retry
    pub retry_base_delay: Duration,
    pub backoff_multiplier: f64,
    /// Upper bound for a single retry delay
    pub max_retry_delay: Duration,
    /// Minimum time between two stale-entry sweeps
    pub sweep_interval: Duration,
    /// Whether deduplication is enabled
    pub enabled: bool,
}

impl Default for DeduplicationConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retries: 2,
            coalesce_window: Duration::from_millis(50),
            retry_base_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            max_retry_delay: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(60),
            enabled: true,
        }
    }
}

/// Per-call overrides of [`DeduplicationConfig`]
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    pub timeout: Option<Duration>,
    pub retries: Option<u32>,
    pub coalesce_window: Option<Duration>,
}

/// Effective timeout and retry policy of one execution
#[derive(Clone, Debug)]
struct ExecutionPolicy {
    timeout: Duration,
    retries: u32,
    coalesce_window: Duration,
    base_delay: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl ExecutionPolicy {
    fn resolve(config: &DeduplicationConfig, options: RequestOptions) -> Self {
        Self {
            timeout: options.timeout.unwrap_or(config.request_timeout),
            retries: options.retries.unwrap_or(config.retries),
            coalesce_window: options.coalesce_window.unwrap_or(config.coalesce_window),
            base_delay: config.retry_base_delay,
            multiplier: config.backoff_multiplier,
            max_delay: config.max_retry_delay,
        }
    }

    /// Delay before retry number `retry` (zero based)
    fn retry_delay(&self, retry: u32) -> Duration {
        let delay = self.base_delay.as_millis() as f64 * self.multiplier.powi(retry as i32);
        let delay_ms = delay.min(self.max_delay.as_millis() as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Longest time a well-behaved execution can stay pending
    fn attempt_budget(&self) -> Duration {
        let attempts = self.timeout.saturating_mul(self.retries.saturating_add(1));
        (0..self.retries)
            .map(|retry| self.retry_delay(retry))
            .fold(attempts, Duration::saturating_add)
    }
}

/// Roughly thirty years
const FAR_FUTURE_SECS: u64 = 86400 * 365 * 30;

type SharedOutcome<T> = Shared<BoxFuture<'static, Result<T, DeduplicationError>>>;

/// Represents a pending request
struct PendingRequest<T> {
    id: u64,
    outcome: SharedOutcome<T>,
    created_at: Instant,
    expires_at: Instant,
    token: CancellationToken,
    waiters: AtomicUsize,
}

/// Successful result kept around for callers arriving inside the coalesce window
struct CoalescedResult<T> {
    value: T,
    expires_at: Instant,
}

struct RequestTables<T> {
    pending: DashMap<RequestKey, PendingRequest<T>>,
    coalesced: DashMap<RequestKey, CoalescedResult<T>>,
    /// Completion time per key. Grows with every distinct key; see `clear_history`.
    history: DashMap<RequestKey, Instant>,
}

impl<T: Clone> RequestTables<T> {
    fn settle(
        &self,
        key: &RequestKey,
        id: u64,
        coalesce_until: Instant,
        result: &Result<T, DeduplicationError>,
    ) {
        let now = Instant::now();
        let removed = self.pending.remove_if(key, |_, pending| pending.id == id);
        self.history.insert(key.clone(), now);

        if let (Some((_, pending)), Ok(value)) = (removed, result) {
            log::debug!(
                "Settled request for key: {} ({} joined callers)",
                key,
                pending.waiters.load(Ordering::Relaxed)
            );
            if now < coalesce_until {
                self.coalesced.insert(
                    key.clone(),
                    CoalescedResult {
                        value: value.clone(),
                        expires_at: coalesce_until,
                    },
                );
            }
        }
    }

    fn coalesced_value(&self, key: &RequestKey, now: Instant) -> Option<T> {
        let hit = self
            .coalesced
            .get(key)
            .filter(|entry| now < entry.expires_at)
            .map(|entry| entry.value.clone());
        if hit.is_none() {
            self.coalesced.remove_if(key, |_, entry| now >= entry.expires_at);
        }
        hit
    }
}

/// Request deduplication system
/// When multiple identical requests come in, only the first one is executed
/// and its outcome is shared with every caller that asked while it was pending
pub struct RequestDeduplicator<T> {
    tables: Arc<RequestTables<T>>,
    config: DeduplicationConfig,
    next_id: AtomicU64,
    last_sweep: Mutex<Instant>,
}

impl<T> RequestDeduplicator<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(config: DeduplicationConfig) -> Self {
        Self {
            tables: Arc::new(RequestTables {
                pending: DashMap::new(),
                coalesced: DashMap::new(),
                history: DashMap::new(),
            }),
            config,
            next_id: AtomicU64::new(0),
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &DeduplicationConfig {
        &self.config
    }

    /// Execute a request with deduplication.
    ///
    /// `call` receives the cancellation token of the shared execution and is
    /// invoked once per attempt. Every caller that joins while the execution
    /// is pending observes the same value or the same error. The key is
    /// derived up front, so the returned future does not borrow `descriptor`.
    pub fn dedupe<F, Fut, E>(
        &self,
        descriptor: &RequestDescriptor,
        call: F,
        options: Option<RequestOptions>,
    ) -> BoxFuture<'static, Result<T, DeduplicationError>>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let policy = ExecutionPolicy::resolve(&self.config, options.unwrap_or_default());

        if !self.config.enabled {
            return async move {
                execute_request(&call, &CancellationToken::new(), &policy).await
            }
            .boxed();
        }

        self.maybe_sweep();

        let key = descriptor.key();
        self.join_or_start(key, call, policy)
    }

    fn join_or_start<F, Fut, E>(
        &self,
        key: RequestKey,
        call: F,
        policy: ExecutionPolicy,
    ) -> BoxFuture<'static, Result<T, DeduplicationError>>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: StdError + Send + Sync + 'static,
    {
        let now = Instant::now();

        let slot = match self.tables.pending.entry(key.clone()) {
            Entry::Occupied(entry) => {
                let pending = entry.get();
                pending.waiters.fetch_add(1, Ordering::Relaxed);
                if now.duration_since(pending.created_at) <= policy.coalesce_window {
                    log::debug!("Coalescing burst request for key: {}", key);
                } else {
                    log::debug!("Request already pending for key: {}", key);
                }
                return pending.outcome.clone().boxed();
            }
            Entry::Vacant(slot) => slot,
        };

        if let Some(value) = self.tables.coalesced_value(&key, now) {
            log::debug!("Reusing result settled inside the coalesce window for key: {}", key);
            return future::ready(Ok(value)).boxed();
        }

        log::debug!("Executing new request for key: {}", key);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let coalesce_until = deadline(now, policy.coalesce_window);
        let expires_at = deadline(now, policy.attempt_budget());

        let tables = Arc::clone(&self.tables);
        let execution_token = token.clone();
        let execution_key = key.clone();
        let outcome = async move {
            let result = execute_request(&call, &execution_token, &policy).await;
            tables.settle(&execution_key, id, coalesce_until, &result);
            result
        }
        .boxed()
        .shared();

        slot.insert(PendingRequest {
            id,
            outcome: outcome.clone(),
            created_at: now,
            expires_at,
            token,
            waiters: AtomicUsize::new(0),
        });

        // Drive the execution even if every caller goes away, so the entry settles
        tokio::spawn(outcome.clone());

        outcome.boxed()
    }

    /// Whether an execution for this request is currently in flight
    pub fn is_pending(&self, descriptor: &RequestDescriptor) -> bool {
        self.tables.pending.contains_key(&descriptor.key())
    }

    /// Time since an identical request last settled, `None` if it never did
    pub fn time_since_last_request(&self, descriptor: &RequestDescriptor) -> Option<Duration> {
        self.tables
            .history
            .get(&descriptor.key())
            .map(|completed_at| Instant::now().duration_since(*completed_at))
    }

    /// Cancel every pending request. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let keys: Vec<_> = self
            .tables
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let cancelled = keys
            .iter()
            .filter(|key| self.evict(key, "cancel_all"))
            .count();
        self.tables.coalesced.clear();

        log::info!("Cancelled {} pending requests", cancelled);
        cancelled
    }

    /// Cancel pending requests whose key matches `pattern`
    pub fn cancel(&self, pattern: impl Into<KeyPattern>) -> usize {
        let pattern = pattern.into();
        let keys: Vec<_> = self
            .tables
            .pending
            .iter()
            .filter(|entry| pattern.matches(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        let cancelled = keys
            .iter()
            .filter(|key| self.evict(key, "pattern"))
            .count();
        self.tables.coalesced.retain(|key, _| !pattern.matches(key));

        log::info!("Cancelled {} pending requests matching {:?}", cancelled, pattern);
        cancelled
    }

    fn evict(&self, key: &RequestKey, reason: &str) -> bool {
        match self.tables.pending.remove(key) {
            Some((_, pending)) => {
                log::debug!(
                    "Cancelling request for key: {} ({}) with {} joined callers",
                    key,
                    reason,
                    pending.waiters.load(Ordering::Relaxed)
                );
                pending.token.cancel();
                true
            }
            None => false,
        }
    }

    fn maybe_sweep(&self) {
        let now = Instant::now();
        {
            let mut last_sweep = match self.last_sweep.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if now.duration_since(*last_sweep) < self.config.sweep_interval {
                return;
            }
            *last_sweep = now;
        }
        self.sweep_expired();
    }

    /// Cancel and evict pending entries that outlived their attempt budget,
    /// and drop coalesced results whose window has passed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired_keys: Vec<_> = self
            .tables
            .pending
            .iter()
            .filter(|entry| now >= entry.value().expires_at)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = 0;
        for key in expired_keys {
            if let Some((_, pending)) = self
                .tables
                .pending
                .remove_if(&key, |_, pending| now >= pending.expires_at)
            {
                log::warn!(
                    "Evicting stale request for key: {} (age {:?})",
                    key,
                    now.duration_since(pending.created_at)
                );
                pending.token.cancel();
                evicted += 1;
            }
        }

        self.tables.coalesced.retain(|_, entry| now < entry.expires_at);

        log::debug!("Evicted {} stale pending requests", evicted);
        evicted
    }

    /// Forget completion times, bounding memory in long-lived sessions
    pub fn clear_history(&self) {
        self.tables.history.clear();
        log::info!("Request history cleared");
    }

    /// Get statistics about pending requests
    pub fn stats(&self) -> DeduplicationStats {
        let now = Instant::now();
        let total_waiters = self
            .tables
            .pending
            .iter()
            .map(|entry| entry.value().waiters.load(Ordering::Relaxed))
            .sum();
        let oldest_pending_age_ms = self
            .tables
            .pending
            .iter()
            .map(|entry| now.duration_since(entry.value().created_at))
            .max()
            .map(|age| age.as_millis() as u64);

        DeduplicationStats {
            pending_requests: self.tables.pending.len(),
            total_waiters,
            oldest_pending_age_ms,
            coalesced_results: self.tables.coalesced.len(),
            tracked_keys: self.tables.history.len(),
        }
    }
}

/// `now + after`, clamped to a far-future instant instead of overflowing
fn deadline(now: Instant, after: Duration) -> Instant {
    now.checked_add(after).unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

/// Runs `call` under the timeout/retry policy until it succeeds, the attempts
/// run out, or `token` is cancelled
async fn execute_request<T, F, Fut, E>(
    call: &F,
    token: &CancellationToken,
    policy: &ExecutionPolicy,
) -> Result<T, DeduplicationError>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: StdError + Send + Sync + 'static,
{
    let attempts = policy.retries.saturating_add(1);
    let mut attempt = 0;

    loop {
        if token.is_cancelled() {
            return Err(DeduplicationError::Cancelled);
        }

        let error = match run_attempt(call, token, policy.timeout).await {
            Ok(value) => return Ok(value),
            Err(DeduplicationError::Cancelled) => return Err(DeduplicationError::Cancelled),
            Err(error) => error,
        };

        attempt += 1;
        if attempt >= attempts {
            if policy.retries == 0 {
                return Err(error);
            }
            return Err(DeduplicationError::RetryExhausted {
                attempts,
                last: Box::new(error),
            });
        }

        let delay = policy.retry_delay(attempt - 1);
        log::debug!(
            "Attempt {}/{} failed ({}), retrying in {:?}",
            attempt,
            attempts,
            error,
            delay
        );

        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DeduplicationError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn run_attempt<T, F, Fut, E>(
    call: &F,
    token: &CancellationToken,
    timeout: Duration,
) -> Result<T, DeduplicationError>
where
    F: Fn(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: StdError + Send + Sync + 'static,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(DeduplicationError::Cancelled),
        result = tokio::time::timeout(timeout, call(token.clone())) => match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(DeduplicationError::call(error)),
            Err(_) => Err(DeduplicationError::Timeout { after: timeout }),
        },
    }
}

/// Statistics for request deduplication
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "graphql", derive(SimpleObject))]
pub struct DeduplicationStats {
    pub pending_requests: usize,
    /// Callers that joined an execution started by someone else
    pub total_waiters: usize,
    pub oldest_pending_age_ms: Option<u64>,
    pub coalesced_results: usize,
    pub tracked_keys: usize,
}

/// Errors that can occur during request deduplication
#[derive(Debug, Clone, thiserror::Error)]
pub enum DeduplicationError {
    #[error("Request timed out after {after:?}")]
    Timeout { after: Duration },
    #[error("Request was cancelled")]
    Cancelled,
    #[error("Request failed: {0}")]
    Call(Arc<dyn StdError + Send + Sync>),
    #[error("All {attempts} attempts failed, last error: {last}")]
    RetryExhausted {
        attempts: u32,
        last: Box<DeduplicationError>,
    },
}

impl DeduplicationError {
    pub fn call(error: impl StdError + Send + Sync + 'static) -> Self {
        DeduplicationError::Call(Arc::new(error))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, DeduplicationError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            DeduplicationError::Timeout { .. } => true,
            DeduplicationError::RetryExhausted { last, .. } => last.is_timeout(),
            _ => false,
        }
    }
}

/// Thread-safe wrapper for the deduplicator
pub type SharedRequestDeduplicator<T> = Arc<RequestDeduplicator<T>>;
