//! Structured lifecycle events and the sinks that receive them
//!
//! Every state transition of an operation that matters to an operator is
//! described by a [`LifecycleEvent`] and handed to an [`EventSink`]. The sink is
//! injected into the executor; there is no process-wide logger registry.
//!
//! Sinks are best-effort. A failing sink never aborts the operation being
//! observed: the executor swallows [`SinkError`]s after noting them at `debug`.

use crate::error::FailureKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;

/// Which transition an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// The operation waited for rate-limiter admission.
    RateLimited,
    /// An attempt failed and another one is scheduled.
    RetryAttempt,
    /// An attempt succeeded; the operation is done.
    RequestSucceeded,
    /// The operation ended in failure.
    RequestFailed,
}

impl EventKind {
    /// Stable event name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimited => "rate_limited",
            Self::RetryAttempt => "retry_attempt",
            Self::RequestSucceeded => "request_succeeded",
            Self::RequestFailed => "request_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FailureKind {
    /// Stable name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TimedOut => "timed_out",
            Self::Retryable => "retryable",
            Self::Fatal => "fatal",
        }
    }
}

/// One structured record of an operation's lifecycle.
///
/// Optional fields are omitted from serialized output when unset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LifecycleEvent {
    /// Transition described
    pub event: EventKind,
    /// Identity shared by every attempt of one logical operation
    pub request_id: String,
    /// 0-based attempt number
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    /// Attempt budget of the operation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    /// Latency of the attempt in milliseconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    /// HTTP status, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Failure message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Failure classification, distinguishes deadline overruns
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,
    /// Backoff before the next attempt
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<f64>,
    /// Time spent waiting for admission
    #[serde(skip_serializing_if = "Option::is_none")]
    pub wait_seconds: Option<f64>,
    /// Caller-supplied context such as `method` and `url`
    #[serde(flatten)]
    pub tags: BTreeMap<String, String>,
}

impl LifecycleEvent {
    /// Event of the given kind with only the request id set.
    pub fn new(event: EventKind, request_id: impl Into<String>) -> Self {
        Self {
            event,
            request_id: request_id.into(),
            attempt: None,
            max_attempts: None,
            latency_ms: None,
            status: None,
            error: None,
            failure: None,
            delay_seconds: None,
            wait_seconds: None,
            tags: BTreeMap::new(),
        }
    }

    /// Set the attempt number and budget.
    pub fn with_attempt(mut self, attempt: u32, max_attempts: u32) -> Self {
        self.attempt = Some(attempt);
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the attempt latency, rounded to two decimals.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency_ms = Some(round_to(latency.as_secs_f64() * 1000.0, 2));
        self
    }

    /// Set the HTTP status, if known.
    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.status = status;
        self
    }

    /// Set the failure message and classification.
    pub fn with_failure(mut self, kind: FailureKind, error: impl fmt::Display) -> Self {
        self.failure = Some(kind);
        self.error = Some(error.to_string());
        self
    }

    /// Set the backoff delay.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay_seconds = Some(round_to(delay.as_secs_f64(), 3));
        self
    }

    /// Set the admission wait.
    pub fn with_wait(mut self, wait: Duration) -> Self {
        self.wait_seconds = Some(round_to(wait.as_secs_f64(), 3));
        self
    }

    /// Attach caller-supplied tags.
    pub fn with_tags(mut self, tags: &BTreeMap<String, String>) -> Self {
        self.tags.extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// The event as a flat field map, as handed to log pipelines.
    pub fn fields(&self) -> serde_json::Map<String, serde_json::Value> {
        match serde_json::to_value(self) {
            Ok(serde_json::Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        }
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Errors a sink may report. They never propagate past the executor.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Writing the record failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Encoding the record failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The sink's lock was poisoned by a panicking writer
    #[error("sink poisoned")]
    Poisoned,
}

/// Destination for lifecycle events.
///
/// `emit` runs on the operation's task, so it should do no more than format
/// and hand off the record.
pub trait EventSink: Send + Sync + fmt::Debug {
    /// Record one event.
    fn emit(&self, event: &LifecycleEvent) -> Result<(), SinkError>;
}

macro_rules! trace_event {
    ($level:expr, $event:ident) => {
        tracing::event!(
            $level,
            event = $event.event.as_str(),
            request_id = %$event.request_id,
            attempt = $event.attempt,
            max_attempts = $event.max_attempts,
            latency_ms = $event.latency_ms,
            status = $event.status,
            error = $event.error.as_deref(),
            failure = $event.failure.as_ref().map(FailureKind::as_str),
            delay_seconds = $event.delay_seconds,
            wait_seconds = $event.wait_seconds,
            tags = ?$event.tags,
            "{}",
            $event.event
        )
    };
}

/// Forwards events to `tracing`.
///
/// Successes and admission waits are logged at `info`, retries at `warn` and
/// terminal failures at `error`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &LifecycleEvent) -> Result<(), SinkError> {
        match event.event {
            EventKind::RateLimited | EventKind::RequestSucceeded => {
                trace_event!(tracing::Level::INFO, event)
            }
            EventKind::RetryAttempt => trace_event!(tracing::Level::WARN, event),
            EventKind::RequestFailed => trace_event!(tracing::Level::ERROR, event),
        }
        Ok(())
    }
}

/// Writes one JSON object per event, one per line, with an RFC 3339 timestamp.
///
/// ```text
/// {"event":"retry_attempt","request_id":"req_1f0c9a2b3c4d","attempt":0,...,"timestamp":"2024-05-01T12:00:00.000000Z"}
/// ```
#[derive(Debug)]
pub struct JsonSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonSink<W> {
    /// Sink writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl JsonSink<std::io::Stdout> {
    /// Sink writing to standard output.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write + Send + fmt::Debug> EventSink for JsonSink<W> {
    fn emit(&self, event: &LifecycleEvent) -> Result<(), SinkError> {
        let mut record = event.fields();
        record.insert(
            "timestamp".to_string(),
            serde_json::Value::String(chrono::Utc::now().to_rfc3339()),
        );

        let mut writer = self.writer.lock().map_err(|_| SinkError::Poisoned)?;
        serde_json::to_writer(&mut *writer, &record)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: &LifecycleEvent) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Keeps events in memory for later inspection.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<LifecycleEvent>>,
}

impl MemorySink {
    /// Empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the recorded events, oldest first.
    pub fn events(&self) -> Vec<LifecycleEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of recorded events of `kind`.
    pub fn count(&self, kind: EventKind) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.event == kind)
            .count()
    }

    /// Forget every recorded event.
    pub fn clear(&self) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &LifecycleEvent) -> Result<(), SinkError> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
        Ok(())
    }
}

/// Generate a request id of the form `req_` followed by 12 hex digits.
pub fn generate_request_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("req_{}", &id[..12])
}

/// Timer for measuring attempt and operation duration
#[derive(Debug, Clone, Copy)]
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// Start a new timer
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Install a `tracing-subscriber` fmt subscriber honoring `RUST_LOG`.
///
/// Defaults to `info` when `RUST_LOG` is unset. Does nothing if a global
/// subscriber is already installed.
#[cfg(feature = "trace")]
#[cfg_attr(docsrs, doc(cfg(feature = "trace")))]
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
