//! Admission control for outbound calls
//!
//! [`RateLimiter`] gates how many operations may proceed, in one of two modes
//! fixed at construction:
//!
//! - **Token bucket** (default): at most `capacity` admissions per `window`,
//!   with bursts of up to `capacity`. Tokens refill continuously at
//!   `capacity / window` per second.
//! - **Semaphore**: at most `capacity` operations in flight at once. The slot is
//!   held by the returned [`RatePermit`] until it is released or dropped.
//!
//! # Token bucket bookkeeping
//!
//! The `(tokens, last_refill)` pair is guarded by an async mutex that is held
//! only while refilling and deciding. A caller that finds the bucket empty
//! reserves the instant its token becomes available by moving `last_refill`
//! forward to it, then releases the lock and sleeps. Callers therefore queue in
//! FIFO order on the lock and are admitted `window / capacity` apart, while the
//! lock itself is never held across a sleep.
//!
//! A waiter dropped before its turn hands its reservation back: the next caller
//! to take the lock moves `last_refill` back by one token's worth of time.
//! Closing the limiter wakes every sleeping waiter.

use callguard_core::ConfigError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

/// Returned by [`RateLimiter::acquire`] once the limiter has been closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rate limiter closed")]
pub struct LimiterClosed;

impl<E> From<LimiterClosed> for crate::Error<E> {
    fn from(_: LimiterClosed) -> Self {
        crate::Error::LimiterClosed
    }
}

/// Which admission discipline a [`RateLimiter`] applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitMode {
    /// At most `capacity` admissions per window.
    #[default]
    TokenBucket,
    /// At most `capacity` operations in flight.
    Semaphore,
}

impl fmt::Display for RateLimitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenBucket => f.write_str("token_bucket"),
            Self::Semaphore => f.write_str("semaphore"),
        }
    }
}

impl FromStr for RateLimitMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "token_bucket" | "token-bucket" => Ok(Self::TokenBucket),
            "semaphore" => Ok(Self::Semaphore),
            other => Err(ConfigError::invalid(format!(
                "unknown rate limit mode '{other}', expected 'token_bucket' or 'semaphore'"
            ))),
        }
    }
}

/// Stand-in deadline when a wait does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// Token bucket state. Only touched while holding the limiter's mutex.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, capacity: f64, rate: f64) {
        // `last_refill` may lie in the future while a reservation is pending.
        let elapsed = now.saturating_duration_since(self.last_refill);
        if !elapsed.is_zero() {
            self.tokens = (self.tokens + elapsed.as_secs_f64() * rate).min(capacity);
            self.last_refill = now;
        }
    }

    /// Take one token. Returns the instant the caller must wait for when the
    /// bucket is empty.
    fn reserve(&mut self, now: Instant, capacity: f64, rate: f64) -> Option<Instant> {
        self.refill(now, capacity, rate);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            return None;
        }

        let wait = Duration::try_from_secs_f64((1.0 - self.tokens) / rate).unwrap_or(FAR_FUTURE);
        let from = self.last_refill.max(now);
        let ready_at = from
            .checked_add(wait)
            .or_else(|| now.checked_add(FAR_FUTURE))
            .unwrap_or(from);
        self.tokens = 0.0;
        self.last_refill = ready_at;
        Some(ready_at)
    }

    /// Hand back `count` reservations whose waiters left before their turn.
    fn restore(&mut self, count: u32, now: Instant, rate: f64) {
        if count == 0 {
            return;
        }
        let credit = Duration::try_from_secs_f64(f64::from(count) / rate).ok();
        self.last_refill = match credit.and_then(|c| self.last_refill.checked_sub(c)) {
            Some(earlier) => earlier,
            None => self.last_refill.min(now),
        };
    }

    fn available(&self, now: Instant, capacity: f64, rate: f64) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill);
        (self.tokens + elapsed.as_secs_f64() * rate).min(capacity)
    }
}

#[derive(Debug)]
enum Discipline {
    TokenBucket {
        bucket: Mutex<Bucket>,
        rate: f64,
        /// Reservations abandoned since the bucket was last locked.
        abandoned: AtomicU32,
    },
    Semaphore(Arc<Semaphore>),
}

/// Admission-control primitive shared by every operation of an executor.
///
/// # Examples
///
/// ```rust
/// use callguard::RateLimiter;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// // 10 requests per second
/// let limiter = RateLimiter::token_bucket(10, Duration::from_secs(1))?;
///
/// let permit = limiter.acquire().await?;
/// assert_eq!(permit.waited(), Duration::ZERO);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    window: Duration,
    mode: RateLimitMode,
    closed: AtomicBool,
    closing: Notify,
    discipline: Discipline,
}

impl RateLimiter {
    /// Create a limiter in the given mode.
    ///
    /// `window` is only meaningful in token-bucket mode.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] if `capacity` is zero, or if the
    /// mode is token bucket and `window` is zero.
    pub fn new(capacity: u32, window: Duration, mode: RateLimitMode) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::invalid("rate limit capacity must be positive, got 0"));
        }

        let discipline = match mode {
            RateLimitMode::TokenBucket => {
                if window.is_zero() {
                    return Err(ConfigError::invalid("rate limit window must be positive"));
                }
                let capacity = f64::from(capacity);
                Discipline::TokenBucket {
                    bucket: Mutex::new(Bucket::full(capacity, Instant::now())),
                    rate: capacity / window.as_secs_f64(),
                    abandoned: AtomicU32::new(0),
                }
            }
            RateLimitMode::Semaphore => {
                Discipline::Semaphore(Arc::new(Semaphore::new(capacity as usize)))
            }
        };

        Ok(Self {
            capacity,
            window,
            mode,
            closed: AtomicBool::new(false),
            closing: Notify::new(),
            discipline,
        })
    }

    /// At most `capacity` admissions per `window`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] for a zero capacity or window.
    pub fn token_bucket(capacity: u32, window: Duration) -> Result<Self, ConfigError> {
        Self::new(capacity, window, RateLimitMode::TokenBucket)
    }

    /// At most `capacity` operations in flight.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] for a zero capacity.
    pub fn semaphore(capacity: u32) -> Result<Self, ConfigError> {
        Self::new(capacity, Duration::ZERO, RateLimitMode::Semaphore)
    }

    /// Maximum permits.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Refill window (token bucket) or zero (semaphore).
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Admission discipline.
    pub fn mode(&self) -> RateLimitMode {
        self.mode
    }

    /// Permits that could be granted right now without waiting.
    ///
    /// For a token bucket this is the fractional token count after lazy refill.
    pub async fn available(&self) -> f64 {
        match &self.discipline {
            Discipline::TokenBucket {
                bucket,
                rate,
                abandoned,
            } => {
                let mut state = bucket.lock().await;
                let now = Instant::now();
                state.restore(abandoned.swap(0, Ordering::SeqCst), now, *rate);
                state.available(now, f64::from(self.capacity), *rate)
            }
            Discipline::Semaphore(semaphore) => semaphore.available_permits() as f64,
        }
    }

    /// Wait until a permit is available and consume it.
    ///
    /// Suspends only the calling task. The returned permit records how long the
    /// caller waited; in semaphore mode it also holds the slot until released.
    ///
    /// # Errors
    ///
    /// Returns [`LimiterClosed`] if [`close`](Self::close) was called before or
    /// during the wait.
    pub async fn acquire(&self) -> Result<RatePermit, LimiterClosed> {
        if self.is_closed() {
            return Err(LimiterClosed);
        }

        match &self.discipline {
            Discipline::TokenBucket {
                bucket,
                rate,
                abandoned,
            } => {
                // Registered before the closed check so a concurrent close()
                // cannot slip between the two.
                let closing = self.closing.notified();
                tokio::pin!(closing);
                closing.as_mut().enable();
                if self.is_closed() {
                    return Err(LimiterClosed);
                }

                let ready_at = {
                    let mut state = bucket.lock().await;
                    let now = Instant::now();
                    state.restore(abandoned.swap(0, Ordering::SeqCst), now, *rate);
                    state.reserve(now, f64::from(self.capacity), *rate)
                };

                let Some(ready_at) = ready_at else {
                    return Ok(RatePermit::immediate());
                };
                let reservation = Reservation::new(abandoned);

                let waited = ready_at.saturating_duration_since(Instant::now());
                tracing::debug!(
                    wait_ms = waited.as_millis() as u64,
                    capacity = self.capacity,
                    "Rate limited, waiting for token"
                );
                tokio::select! {
                    () = tokio::time::sleep_until(ready_at) => {}
                    () = closing.as_mut() => return Err(LimiterClosed),
                }

                if self.is_closed() {
                    return Err(LimiterClosed);
                }
                reservation.redeem();
                Ok(RatePermit {
                    waited,
                    slot: None,
                })
            }
            Discipline::Semaphore(semaphore) => {
                let started = Instant::now();
                let slot = Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| LimiterClosed)?;
                Ok(RatePermit {
                    waited: started.elapsed(),
                    slot: Some(slot),
                })
            }
        }
    }

    /// Close the limiter. Pending and future [`acquire`](Self::acquire) calls
    /// fail with [`LimiterClosed`]; permits already granted stay valid.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.closing.notify_waiters();
        if let Discipline::Semaphore(semaphore) = &self.discipline {
            semaphore.close();
        }
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// A token reserved by a sleeping waiter. Dropping it unredeemed returns the
/// token to the bucket.
struct Reservation<'a> {
    abandoned: &'a AtomicU32,
    redeemed: bool,
}

impl<'a> Reservation<'a> {
    fn new(abandoned: &'a AtomicU32) -> Self {
        Self {
            abandoned,
            redeemed: false,
        }
    }

    fn redeem(mut self) {
        self.redeemed = true;
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.redeemed {
            self.abandoned.fetch_add(1, Ordering::SeqCst);
        }
    }
}

/// Proof of admission returned by [`RateLimiter::acquire`].
///
/// In semaphore mode the slot is returned to the limiter when the permit is
/// released or dropped. In token-bucket mode the token is consumed for good and
/// releasing is a no-op.
#[derive(Debug)]
#[must_use = "dropping a semaphore permit releases its slot immediately"]
pub struct RatePermit {
    waited: Duration,
    slot: Option<OwnedSemaphorePermit>,
}

impl RatePermit {
    fn immediate() -> Self {
        Self {
            waited: Duration::ZERO,
            slot: None,
        }
    }

    /// How long the caller was suspended before admission.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    /// Return the slot to the limiter (semaphore mode).
    pub fn release(self) {
        drop(self);
    }
}
