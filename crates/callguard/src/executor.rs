//! Request lifecycle orchestration
//!
//! [`RequestExecutor`] applies the policies in a fixed order:
//!
//! ```text
//! acquire permit ──► attempt 0 under deadline ──► success ──► request_succeeded
//!                          │
//!                          ▼ failure
//!                    fatal? ──────────────────────────────► request_failed (Fatal)
//!                    budget left? ── sleep delay_for(n) ──► attempt n+1
//!                          │
//!                          ▼ no
//!                    request_failed (Exhausted)
//! ```
//!
//! The permit is acquired once per logical operation and held until it
//! returns, so retries never consume additional admissions.

use crate::config::ResilienceConfig;
use crate::error::{Error, Failure, Result};
use crate::limiter::RateLimiter;
use crate::observability::{
    EventKind, EventSink, LifecycleEvent, RequestTimer, TracingSink, generate_request_id,
};
use crate::timeout::TimeoutGuard;
use callguard_core::ConfigError;
use callguard_core::retry::{BackoffPolicy, BackoffStrategy};
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Per-attempt deadline used when none is configured.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Context handed to the operation for each attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    request_id: String,
    number: u32,
    max_attempts: u32,
    timeout: Duration,
}

impl Attempt {
    /// Identity of the logical operation, shared by all of its attempts.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// 0-based attempt number.
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Attempt budget of the operation.
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Deadline this attempt runs under.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether this is the last attempt the budget allows.
    pub fn is_last(&self) -> bool {
        self.number.saturating_add(1) >= self.max_attempts
    }
}

/// Per-call overrides for [`RequestExecutor::run_with`].
#[derive(Clone, Default)]
pub struct RunOptions {
    timeout: Option<Duration>,
    policy: Option<Arc<dyn BackoffStrategy>>,
    tags: BTreeMap<String, String>,
}

impl RunOptions {
    /// No overrides.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-attempt deadline for this call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Backoff policy for this call.
    pub fn policy(mut self, policy: impl BackoffStrategy + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Attach a tag to every event emitted for this call.
    pub fn tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.policy.as_ref().map(|p| p.max_attempts()))
            .field("tags", &self.tags)
            .finish()
    }
}

/// Runs operations under rate limiting, per-attempt deadlines and backoff
/// retries, reporting each transition to an [`EventSink`].
///
/// Cloning is cheap; clones share the limiter and sink.
///
/// # Examples
///
/// ```rust
/// use callguard::{Attempt, Failure, RequestExecutor};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let executor = RequestExecutor::builder()
///     .timeout(Duration::from_secs(5))
///     .build()?;
///
/// let value = executor
///     .run(|attempt: Attempt| async move {
///         if attempt.number() == 0 {
///             Err(Failure::retryable(std::io::Error::other("flaky")))
///         } else {
///             Ok(42)
///         }
///     })
///     .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RequestExecutor {
    policy: Arc<dyn BackoffStrategy>,
    guard: TimeoutGuard,
    limiter: Option<Arc<RateLimiter>>,
    sink: Arc<dyn EventSink>,
}

impl fmt::Debug for RequestExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestExecutor")
            .field("max_attempts", &self.policy.max_attempts())
            .field("guard", &self.guard)
            .field("limiter", &self.limiter)
            .field("sink", &self.sink)
            .finish()
    }
}

impl RequestExecutor {
    /// Create a new builder.
    pub fn builder() -> RequestExecutorBuilder {
        RequestExecutorBuilder::default()
    }

    /// Executor built from a validated [`ResilienceConfig`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] if the configuration is invalid.
    pub fn from_config(
        config: &ResilienceConfig,
        sink: Arc<dyn EventSink>,
    ) -> std::result::Result<Self, ConfigError> {
        let mut builder = Self::builder()
            .policy(config.backoff_policy()?)
            .timeout(config.timeout_guard()?.timeout())
            .shared_sink(sink);
        if let Some(limiter) = config.rate_limiter()? {
            builder = builder.rate_limiter(limiter);
        }
        builder.build()
    }

    /// Attempt budget of the default policy.
    pub fn max_attempts(&self) -> u32 {
        self.policy.max_attempts()
    }

    /// Default per-attempt deadline.
    pub fn timeout(&self) -> Duration {
        self.guard.timeout()
    }

    /// The shared rate limiter, if limiting is enabled.
    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Run `op` with the executor's defaults.
    ///
    /// `op` is called once per attempt with that attempt's [`Attempt`] context.
    ///
    /// # Errors
    ///
    /// See [`run_with`](Self::run_with).
    pub async fn run<T, E, F, Fut>(&self, op: F) -> Result<T, E>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure<E>>>,
        E: fmt::Display,
    {
        self.execute(RunOptions::default(), op, |_| None).await
    }

    /// Run `op` with per-call overrides.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] if `options` carries an invalid timeout or a
    ///   policy with no attempts; nothing was run and the limiter untouched
    /// - [`Error::LimiterClosed`] if the rate limiter was closed
    /// - [`Error::Fatal`] on the first non-retryable failure
    /// - [`Error::Exhausted`] once every attempt failed
    pub async fn run_with<T, E, F, Fut>(&self, options: RunOptions, op: F) -> Result<T, E>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure<E>>>,
        E: fmt::Display,
    {
        self.execute(options, op, |_| None).await
    }

    /// Like [`run_with`](Self::run_with), with `status_of` extracting an HTTP
    /// status from each attempt's outcome for the emitted events.
    ///
    /// # Errors
    ///
    /// See [`run_with`](Self::run_with).
    pub async fn run_with_status<T, E, F, Fut, S>(
        &self,
        options: RunOptions,
        op: F,
        status_of: S,
    ) -> Result<T, E>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure<E>>>,
        S: Fn(std::result::Result<&T, &E>) -> Option<u16>,
        E: fmt::Display,
    {
        self.execute(options, op, status_of).await
    }

    async fn execute<T, E, F, Fut, S>(
        &self,
        options: RunOptions,
        mut op: F,
        status_of: S,
    ) -> Result<T, E>
    where
        F: FnMut(Attempt) -> Fut,
        Fut: Future<Output = std::result::Result<T, Failure<E>>>,
        S: Fn(std::result::Result<&T, &E>) -> Option<u16>,
        E: fmt::Display,
    {
        let RunOptions {
            timeout,
            policy,
            tags,
        } = options;

        let timeout = match timeout {
            Some(timeout) => {
                TimeoutGuard::validate(timeout)?;
                timeout
            }
            None => self.guard.timeout(),
        };
        let policy = policy.unwrap_or_else(|| Arc::clone(&self.policy));
        let max_attempts = policy.max_attempts();
        if max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1").into());
        }

        let request_id = generate_request_id();

        // Held until return; in semaphore mode this keeps the slot for every attempt.
        let _permit = match &self.limiter {
            Some(limiter) => {
                let permit = limiter.acquire().await?;
                if !permit.waited().is_zero() {
                    self.emit(
                        LifecycleEvent::new(EventKind::RateLimited, &request_id)
                            .with_wait(permit.waited())
                            .with_tags(&tags),
                    );
                }
                Some(permit)
            }
            None => None,
        };

        let mut number = 0u32;
        loop {
            let attempt = Attempt {
                request_id: request_id.clone(),
                number,
                max_attempts,
                timeout,
            };

            let timer = RequestTimer::start();
            let outcome = self.guard.run_with_deadline(op(attempt), timeout).await;
            let latency = timer.elapsed();
            let attempts = number.saturating_add(1);

            let failure = match outcome {
                Ok(value) => {
                    self.emit(
                        LifecycleEvent::new(EventKind::RequestSucceeded, &request_id)
                            .with_attempt(number, max_attempts)
                            .with_latency(latency)
                            .with_status(status_of(Ok(&value)))
                            .with_tags(&tags),
                    );
                    return Ok(value);
                }
                Err(failure) => failure,
            };

            let event = |kind| {
                LifecycleEvent::new(kind, &request_id)
                    .with_attempt(number, max_attempts)
                    .with_latency(latency)
                    .with_status(failure.inner().and_then(|e| status_of(Err(e))))
                    .with_failure(failure.kind(), &failure)
                    .with_tags(&tags)
            };

            if !failure.is_retryable() {
                self.emit(event(EventKind::RequestFailed));
                return Err(Error::Fatal {
                    attempts,
                    cause: failure,
                });
            }

            if attempts < max_attempts && policy.should_retry(number) {
                let delay = policy.delay_for(number);
                self.emit(event(EventKind::RetryAttempt).with_delay(delay));
                tokio::time::sleep(delay).await;
                number = attempts;
                continue;
            }

            self.emit(event(EventKind::RequestFailed));
            return Err(Error::Exhausted {
                attempts,
                cause: failure,
            });
        }
    }

    fn emit(&self, event: LifecycleEvent) {
        if let Err(e) = self.sink.emit(&event) {
            tracing::debug!(
                error = %e,
                event = event.event.as_str(),
                request_id = %event.request_id,
                "Event sink failed, dropping event"
            );
        }
    }
}

/// Builder for [`RequestExecutor`].
#[derive(Default)]
pub struct RequestExecutorBuilder {
    policy: Option<Arc<dyn BackoffStrategy>>,
    timeout: Option<Duration>,
    limiter: Option<Arc<RateLimiter>>,
    sink: Option<Arc<dyn EventSink>>,
}

impl RequestExecutorBuilder {
    /// Backoff policy (default: 3 attempts, exponential from one second).
    pub fn policy(mut self, policy: impl BackoffStrategy + 'static) -> Self {
        self.policy = Some(Arc::new(policy));
        self
    }

    /// Backoff policy shared with other owners.
    pub fn shared_policy(mut self, policy: Arc<dyn BackoffStrategy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Default per-attempt deadline (default: 30 seconds).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Rate limiter owned by this executor and its clones.
    pub fn rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = Some(Arc::new(limiter));
        self
    }

    /// Rate limiter shared with other executors.
    pub fn shared_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Event sink (default: [`TracingSink`]).
    pub fn sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Some(Arc::new(sink));
        self
    }

    /// Event sink shared with other owners.
    pub fn shared_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Build the executor.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] for a zero timeout or a policy
    /// allowing no attempts.
    pub fn build(self) -> std::result::Result<RequestExecutor, ConfigError> {
        let guard = TimeoutGuard::new(self.timeout.unwrap_or(DEFAULT_TIMEOUT))?;
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(BackoffPolicy::default()));
        if policy.max_attempts() == 0 {
            return Err(ConfigError::invalid("max_attempts must be at least 1"));
        }

        Ok(RequestExecutor {
            policy,
            guard,
            limiter: self.limiter,
            sink: self.sink.unwrap_or_else(|| Arc::new(TracingSink)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Classify, FailureKind};
    use crate::observability::{MemorySink, SinkError};
    use callguard_core::retry::Strategy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[derive(Debug, thiserror::Error)]
    enum TestError {
        #[error("transient failure on attempt {0}")]
        Transient(u32),
        #[error("corrupt payload")]
        Corrupt,
    }

    impl Classify for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient(_))
        }
    }

    fn executor(max_attempts: u32, sink: Arc<MemorySink>) -> RequestExecutor {
        RequestExecutor::builder()
            .policy(BackoffPolicy::new(max_attempts, Strategy::Exponential).unwrap())
            .timeout(Duration::from_secs(1))
            .shared_sink(sink)
            .build()
            .unwrap()
    }

    fn kinds(sink: &MemorySink) -> Vec<EventKind> {
        sink.events().iter().map(|e| e.event).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_fail_succeed() {
        let sink = Arc::new(MemorySink::new());
        let executor = executor(3, Arc::clone(&sink));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let value = executor
            .run(|attempt: Attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt.number() < 2 {
                        return Err(Failure::from(TestError::Transient(attempt.number())));
                    }
                    Ok("done")
                }
            })
            .await
            .unwrap();

        assert_eq!(value, "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 1s then 2s of backoff
        assert_eq!(start.elapsed(), Duration::from_secs(3));

        assert_eq!(
            kinds(&sink),
            vec![
                EventKind::RetryAttempt,
                EventKind::RetryAttempt,
                EventKind::RequestSucceeded
            ]
        );
        let events = sink.events();
        assert_eq!(events[0].delay_seconds, Some(1.0));
        assert_eq!(events[1].delay_seconds, Some(2.0));
        assert_eq!(events[0].failure, Some(FailureKind::Retryable));
        assert_eq!(events[2].attempt, Some(2));
        assert_eq!(events[2].max_attempts, Some(3));
        assert!(events.iter().all(|e| e.request_id == events[0].request_id));
        assert!(events[0].request_id.starts_with("req_"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_uses_whole_budget() {
        let sink = Arc::new(MemorySink::new());
        let executor = executor(4, Arc::clone(&sink));
        let calls = Arc::new(AtomicU32::new(0));

        let err = executor
            .run(|attempt: Attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Failure::from(TestError::Transient(attempt.number())))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(err.attempts(), 4);
        match err {
            Error::Exhausted { attempts, cause } => {
                assert_eq!(attempts, 4);
                assert!(matches!(cause, Failure::Retryable(TestError::Transient(3))));
            }
            other => panic!("expected Exhausted, got {other:?}"),
        }
        assert_eq!(sink.count(EventKind::RetryAttempt), 3);
        assert_eq!(sink.count(EventKind::RequestFailed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_success_stops_retrying() {
        let sink = Arc::new(MemorySink::new());
        let executor = executor(5, Arc::clone(&sink));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        executor
            .run(|attempt: Attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    if attempt.number() == 0 {
                        return Err(Failure::retryable(TestError::Transient(0)));
                    }
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        assert_eq!(
            kinds(&sink),
            vec![EventKind::RetryAttempt, EventKind::RequestSucceeded]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_are_retried_and_marked() {
        let sink = Arc::new(MemorySink::new());
        let executor = executor(2, Arc::clone(&sink));

        let err = executor
            .run(|_attempt: Attempt| async {
                tokio::time::sleep(Duration::from_secs(2)).await;
                Ok::<_, Failure<TestError>>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert_eq!(err.attempts(), 2);

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, EventKind::RetryAttempt);
        assert_eq!(events[0].failure, Some(FailureKind::TimedOut));
        assert_eq!(events[1].event, EventKind::RequestFailed);
        assert_eq!(events[1].failure, Some(FailureKind::TimedOut));
        assert_eq!(events[1].latency_ms, Some(1000.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_aborts() {
        let sink = Arc::new(MemorySink::new());
        let executor = executor(3, Arc::clone(&sink));
        let calls = Arc::new(AtomicU32::new(0));
        let start = Instant::now();

        let err = executor
            .run(|_attempt: Attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Failure::from(TestError::Corrupt))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(matches!(
            err,
            Error::Fatal {
                attempts: 1,
                cause: Failure::Fatal(TestError::Corrupt)
            }
        ));
        assert_eq!(kinds(&sink), vec![EventKind::RequestFailed]);
        assert_eq!(sink.events()[0].failure, Some(FailureKind::Fatal));
        assert_eq!(sink.events()[0].error.as_deref(), Some("corrupt payload"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_timeout_rejected_before_limiter() {
        let limiter = Arc::new(RateLimiter::token_bucket(1, Duration::from_secs(1)).unwrap());
        let executor = RequestExecutor::builder()
            .shared_rate_limiter(Arc::clone(&limiter))
            .sink(crate::observability::NoopSink)
            .build()
            .unwrap();
        let calls = Arc::new(AtomicU32::new(0));

        let err = executor
            .run_with(RunOptions::new().timeout(Duration::ZERO), |_attempt: Attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Failure<TestError>>(())
                }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::InvalidConfig(_)));
        assert_eq!(err.attempts(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!((limiter.available().await - 1.0).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_event() {
        let sink = Arc::new(MemorySink::new());
        let executor = RequestExecutor::builder()
            .rate_limiter(RateLimiter::token_bucket(1, Duration::from_secs(1)).unwrap())
            .shared_sink(Arc::clone(&sink) as Arc<dyn EventSink>)
            .build()
            .unwrap();

        for _ in 0..2 {
            executor
                .run(|_attempt: Attempt| async { Ok::<_, Failure<TestError>>(()) })
                .await
                .unwrap();
        }

        assert_eq!(
            kinds(&sink),
            vec![
                EventKind::RequestSucceeded,
                EventKind::RateLimited,
                EventKind::RequestSucceeded
            ]
        );
        let events = sink.events();
        assert_eq!(events[1].wait_seconds, Some(1.0));
        assert_eq!(events[1].request_id, events[2].request_id);
        assert_ne!(events[0].request_id, events[2].request_id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_semaphore_slot_held_across_retries() {
        let limiter = Arc::new(RateLimiter::semaphore(1).unwrap());
        let executor = RequestExecutor::builder()
            .shared_rate_limiter(Arc::clone(&limiter))
            .sink(crate::observability::NoopSink)
            .build()
            .unwrap();

        let seen = executor
            .run(|attempt: Attempt| {
                let limiter = Arc::clone(&limiter);
                async move {
                    let free = limiter.available().await;
                    if attempt.number() == 0 {
                        return Err(Failure::retryable(TestError::Transient(0)));
                    }
                    Ok(free)
                }
            })
            .await
            .unwrap();

        assert_eq!(seen, 0.0);
        assert_eq!(limiter.available().await, 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_limiter() {
        let limiter = Arc::new(RateLimiter::token_bucket(5, Duration::from_secs(1)).unwrap());
        let executor = RequestExecutor::builder()
            .shared_rate_limiter(Arc::clone(&limiter))
            .sink(crate::observability::NoopSink)
            .build()
            .unwrap();
        limiter.close();

        let err = executor
            .run(|_attempt: Attempt| async { Ok::<_, Failure<TestError>>(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LimiterClosed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_during_limiter_wait() {
        let sink = Arc::new(MemorySink::new());
        let executor = RequestExecutor::builder()
            .rate_limiter(RateLimiter::token_bucket(1, Duration::from_secs(1)).unwrap())
            .shared_sink(Arc::clone(&sink) as Arc<dyn EventSink>)
            .build()
            .unwrap();
        let start = Instant::now();
        executor
            .run(|_attempt: Attempt| async { Ok::<_, Failure<TestError>>(()) })
            .await
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        let dropped = tokio::time::timeout(
            Duration::from_millis(100),
            executor.run(|_attempt: Attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, Failure<TestError>>(())
                }
            }),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // The abandoned slot goes to the next caller.
        let admitted_at = executor
            .run(|_attempt: Attempt| async move { Ok::<_, Failure<TestError>>(start.elapsed()) })
            .await
            .unwrap();
        assert!(admitted_at.abs_diff(Duration::from_secs(1)) <= Duration::from_millis(5));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(
            kinds(&sink),
            vec![
                EventKind::RequestSucceeded,
                EventKind::RateLimited,
                EventKind::RequestSucceeded
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_during_backoff_sleep() {
        let sink = Arc::new(MemorySink::new());
        let limiter = Arc::new(RateLimiter::semaphore(1).unwrap());
        let executor = RequestExecutor::builder()
            .policy(BackoffPolicy::new(3, Strategy::Exponential).unwrap())
            .timeout(Duration::from_secs(1))
            .shared_rate_limiter(Arc::clone(&limiter))
            .shared_sink(Arc::clone(&sink) as Arc<dyn EventSink>)
            .build()
            .unwrap();

        let calls = Arc::new(AtomicU32::new(0));
        // Attempts at 0s and 1s, then a 2s backoff interrupted at 1.5s.
        let dropped = tokio::time::timeout(
            Duration::from_millis(1500),
            executor.run(|attempt: Attempt| {
                let calls = Arc::clone(&calls);
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(Failure::retryable(TestError::Transient(attempt.number())))
                }
            }),
        )
        .await;
        assert!(dropped.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(
            kinds(&sink),
            vec![EventKind::RetryAttempt, EventKind::RetryAttempt]
        );

        // The in-flight slot was released with the dropped run.
        assert_eq!(limiter.available().await, 1.0);
        let value = executor
            .run(|_attempt: Attempt| async { Ok::<_, Failure<TestError>>(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sink_errors_are_swallowed() {
        #[derive(Debug)]
        struct BrokenSink;
        impl EventSink for BrokenSink {
            fn emit(&self, _event: &LifecycleEvent) -> std::result::Result<(), SinkError> {
                Err(SinkError::Poisoned)
            }
        }

        let executor = RequestExecutor::builder()
            .sink(BrokenSink)
            .policy(BackoffPolicy::new(2, Strategy::Linear).unwrap())
            .build()
            .unwrap();

        let value = executor
            .run(|attempt: Attempt| async move {
                if attempt.number() == 0 {
                    return Err(Failure::retryable(TestError::Transient(0)));
                }
                Ok(attempt.number())
            })
            .await
            .unwrap();
        assert_eq!(value, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_options_override_policy_and_tag_events() {
        let sink = Arc::new(MemorySink::new());
        let executor = executor(5, Arc::clone(&sink));
        let start = Instant::now();

        let options = RunOptions::new()
            .policy(BackoffPolicy::new(2, Strategy::Linear).unwrap())
            .timeout(Duration::from_millis(300))
            .tag("method", "GET")
            .tag("url", "https://api.example.com/items");

        let err = executor
            .run_with(options, |attempt: Attempt| async move {
                assert_eq!(attempt.timeout(), Duration::from_millis(300));
                assert_eq!(attempt.max_attempts(), 2);
                Err::<(), _>(Failure::retryable(TestError::Transient(attempt.number())))
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 2);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
        for event in sink.events() {
            assert_eq!(event.tags["method"], "GET");
            assert_eq!(event.tags["url"], "https://api.example.com/items");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reported_in_events() {
        let sink = Arc::new(MemorySink::new());
        let executor = executor(2, Arc::clone(&sink));

        executor
            .run_with_status(
                RunOptions::new(),
                |attempt: Attempt| async move {
                    if attempt.number() == 0 {
                        return Err(Failure::retryable(503u16));
                    }
                    Ok(201u16)
                },
                |outcome| match outcome {
                    Ok(status) | Err(status) => Some(*status),
                },
            )
            .await
            .unwrap();

        let events = sink.events();
        assert_eq!(events[0].status, Some(503));
        assert_eq!(events[1].status, Some(201));
    }

    #[test]
    fn test_builder_rejects_empty_budget() {
        struct Never;
        impl BackoffStrategy for Never {
            fn max_attempts(&self) -> u32 {
                0
            }
            fn delay_for(&self, _attempt: u32) -> Duration {
                Duration::ZERO
            }
        }

        assert!(RequestExecutor::builder().policy(Never).build().is_err());
        assert!(
            RequestExecutor::builder()
                .timeout(Duration::ZERO)
                .build()
                .is_err()
        );
    }

    #[test]
    fn test_attempt_is_last() {
        let attempt = Attempt {
            request_id: "req_1".into(),
            number: 2,
            max_attempts: 3,
            timeout: DEFAULT_TIMEOUT,
        };
        assert!(attempt.is_last());
    }
}
