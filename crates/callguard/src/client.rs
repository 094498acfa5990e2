//! HTTP client with retries, deadlines and rate limiting
//!
//! [`ApiClient`] issues JSON-oriented HTTP calls through a [`Transport`],
//! running every call under a [`RequestExecutor`].

use crate::config::ResilienceConfig;
use crate::error::{Error, Failure, Result};
use crate::executor::{Attempt, RequestExecutor, RunOptions};
use crate::observability::{EventSink, TracingSink};
use callguard_core::ConfigError;
use callguard_core::retry::{BackoffPolicy, Strategy};
use callguard_transport::{HttpRequest, HttpResponse, HttpTransport, Transport, TransportError};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Per-request settings for [`ApiClient::request`].
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    headers: HashMap<String, String>,
    query: Vec<(String, String)>,
    json: Option<Value>,
    timeout: Option<Duration>,
}

impl RequestOptions {
    /// No extra settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header, overriding a default header of the same name.
    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Append a query parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Send `body` as JSON.
    pub fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    /// Per-attempt deadline for this request.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// HTTP client applying rate limiting, per-attempt deadlines and backoff
/// retries to every request.
///
/// Responses are returned as JSON: a JSON content type is parsed, anything
/// else is wrapped as `{"text": <body>}`. Error statuses (400 and above) fail
/// the attempt with [`TransportError::Status`], retryable unless the status
/// was registered with
/// [`non_retryable_status`](ApiClientBuilder::non_retryable_status).
///
/// # Examples
///
/// ```no_run
/// use callguard::ApiClient;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = ApiClient::builder()
///     .base_url("https://api.example.com")
///     .timeout(Duration::from_secs(10))
///     .max_attempts(3)
///     .rate_limit(10)
///     .build()?;
///
/// let users = client.get("/users").await?;
/// let created = client
///     .post("/users", serde_json::json!({"name": "Ada"}))
///     .await?;
/// # let _ = (users, created);
/// client.close();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ApiClient {
    base_url: Option<String>,
    default_headers: HashMap<String, String>,
    non_retryable: HashSet<u16>,
    transport: Arc<dyn Transport>,
    executor: RequestExecutor,
}

impl fmt::Debug for ApiClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiClient")
            .field("base_url", &self.base_url)
            .field("default_headers", &self.default_headers.keys())
            .field("non_retryable", &self.non_retryable)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Create a new builder.
    pub fn builder() -> ApiClientBuilder {
        ApiClientBuilder::default()
    }

    /// Client for `base_url` with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] if the HTTP transport cannot be
    /// created.
    pub fn new(base_url: impl Into<String>) -> std::result::Result<Self, ConfigError> {
        Self::builder().base_url(base_url).build()
    }

    /// Base URL relative endpoints are joined to.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// The executor every request runs under.
    pub fn executor(&self) -> &RequestExecutor {
        &self.executor
    }

    /// Resolve `endpoint` against the base URL.
    ///
    /// Absolute `http://` and `https://` endpoints are returned unchanged.
    /// Otherwise leading slashes are stripped and the endpoint is joined to
    /// the base URL with a single `/`.
    ///
    /// ```rust
    /// # use callguard::ApiClient;
    /// let client = ApiClient::new("https://api.example.com/").unwrap();
    /// assert_eq!(client.build_url("/v1/items"), "https://api.example.com/v1/items");
    /// assert_eq!(client.build_url("http://other.test/x"), "http://other.test/x");
    /// ```
    pub fn build_url(&self, endpoint: &str) -> String {
        if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            return endpoint.to_string();
        }
        let endpoint = endpoint.trim_start_matches('/');
        match &self.base_url {
            Some(base) => format!("{base}/{endpoint}"),
            None => endpoint.to_string(),
        }
    }

    /// Issue a request.
    ///
    /// # Errors
    ///
    /// Returns the executor's terminal [`Error`]. The cause is a
    /// [`TransportError`]: `Status` for error responses, `Serialization` for
    /// undecodable JSON bodies (not retried).
    pub async fn request(
        &self,
        method: &str,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Value, TransportError> {
        let method = method.to_ascii_uppercase();
        let url = self.build_url(endpoint);

        let mut request = HttpRequest::new(method.as_str(), url.as_str());
        for (key, value) in self.default_headers.iter().chain(options.headers.iter()) {
            request = request.with_header(key.as_str(), value.as_str());
        }
        for (key, value) in options.query {
            request = request.with_query(key, value);
        }
        if let Some(body) = &options.json {
            request = request.with_json(body).map_err(|e| Error::Fatal {
                attempts: 0,
                cause: Failure::fatal(e),
            })?;
        }

        let mut run_options = RunOptions::new()
            .tag("method", method.as_str())
            .tag("url", url.as_str());
        if let Some(timeout) = options.timeout {
            run_options = run_options.timeout(timeout);
        }

        let (_status, body) = self
            .executor
            .run_with_status(
                run_options,
                |_attempt: Attempt| self.attempt(request.clone()),
                |outcome| match outcome {
                    Ok((status, _)) => Some(*status),
                    Err(e) => e.status(),
                },
            )
            .await?;
        Ok(body)
    }

    /// `GET endpoint`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn get(&self, endpoint: &str) -> Result<Value, TransportError> {
        self.request("GET", endpoint, RequestOptions::new()).await
    }

    /// `POST endpoint` with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn post(&self, endpoint: &str, body: Value) -> Result<Value, TransportError> {
        self.request("POST", endpoint, RequestOptions::new().json(body))
            .await
    }

    /// `POST endpoint` with any serializable body.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::Fatal`] after zero attempts if `body` cannot be
    /// serialized; otherwise see [`request`](Self::request).
    pub async fn post_json<B: Serialize + ?Sized>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<Value, TransportError> {
        let body = serde_json::to_value(body).map_err(|e| Error::Fatal {
            attempts: 0,
            cause: Failure::fatal(TransportError::from(e)),
        })?;
        self.post(endpoint, body).await
    }

    /// `PUT endpoint` with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn put(&self, endpoint: &str, body: Value) -> Result<Value, TransportError> {
        self.request("PUT", endpoint, RequestOptions::new().json(body))
            .await
    }

    /// `DELETE endpoint`.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn delete(&self, endpoint: &str) -> Result<Value, TransportError> {
        self.request("DELETE", endpoint, RequestOptions::new()).await
    }

    /// `PATCH endpoint` with a JSON body.
    ///
    /// # Errors
    ///
    /// See [`request`](Self::request).
    pub async fn patch(&self, endpoint: &str, body: Value) -> Result<Value, TransportError> {
        self.request("PATCH", endpoint, RequestOptions::new().json(body))
            .await
    }

    /// Close the client's rate limiter. Later requests fail with
    /// [`Error::LimiterClosed`]; without a limiter this does nothing.
    pub fn close(&self) {
        if let Some(limiter) = self.executor.rate_limiter() {
            limiter.close();
        }
    }

    async fn attempt(
        &self,
        request: HttpRequest,
    ) -> std::result::Result<(u16, Value), Failure<TransportError>> {
        let response = self.transport.send_http(request).await?;

        if response.is_error() {
            let status = response.status;
            let error = TransportError::Status {
                status,
                body: response.text(),
            };
            return Err(if self.non_retryable.contains(&status) {
                Failure::fatal(error)
            } else {
                Failure::retryable(error)
            });
        }

        let body = parse_body(&response)?;
        Ok((response.status, body))
    }
}

fn parse_body(response: &HttpResponse) -> std::result::Result<Value, TransportError> {
    let is_json = response.content_type().is_some_and(|ct| {
        let essence = ct.split(';').next().unwrap_or_default().trim();
        essence.eq_ignore_ascii_case("application/json") || essence.ends_with("+json")
    });

    if !is_json {
        return Ok(serde_json::json!({ "text": response.text() }));
    }
    if response.body.is_empty() {
        return Ok(Value::Null);
    }
    response.json()
}

/// Builder for [`ApiClient`].
#[derive(Default)]
pub struct ApiClientBuilder {
    base_url: Option<String>,
    config: ResilienceConfig,
    policy: Option<BackoffPolicy>,
    default_headers: HashMap<String, String>,
    non_retryable: HashSet<u16>,
    sink: Option<Arc<dyn EventSink>>,
    transport: Option<Arc<dyn Transport>>,
}

impl ApiClientBuilder {
    /// Base URL for relative endpoints. Trailing slashes are dropped.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let trimmed = base_url.trim_end_matches('/');
        self.base_url = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    /// Start from a resilience configuration. Later setters override it.
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Per-attempt deadline (default: 30 seconds).
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config = self.config.with_timeout(timeout);
        self
    }

    /// Attempt budget per request (default: 3).
    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.config = self.config.with_max_attempts(max_attempts);
        self
    }

    /// Backoff growth (default: exponential).
    pub fn backoff_strategy(mut self, strategy: Strategy) -> Self {
        self.config = self.config.with_backoff_strategy(strategy);
        self
    }

    /// Full backoff policy, replacing `max_attempts` and `backoff_strategy`.
    pub fn backoff_policy(mut self, policy: BackoffPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// At most `requests_per_second` requests admitted per second.
    pub fn rate_limit(mut self, requests_per_second: u32) -> Self {
        self.config = self
            .config
            .with_token_bucket(requests_per_second, Duration::from_secs(1));
        self
    }

    /// Header sent with every request.
    pub fn default_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }

    /// Treat responses with `status` as final instead of retrying them.
    pub fn non_retryable_status(mut self, status: u16) -> Self {
        self.non_retryable.insert(status);
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

    /// Transport to issue requests through (default: [`HttpTransport`]).
    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] if the resilience settings are
    /// invalid or the default HTTP transport cannot be created.
    pub fn build(self) -> std::result::Result<ApiClient, ConfigError> {
        let sink = self.sink.unwrap_or_else(|| Arc::new(TracingSink));
        let mut executor = RequestExecutor::builder()
            .timeout(self.config.timeout_guard()?.timeout())
            .shared_sink(sink);
        executor = match self.policy {
            Some(policy) => executor.policy(policy),
            None => executor.policy(self.config.backoff_policy()?),
        };
        if let Some(limiter) = self.config.rate_limiter()? {
            executor = executor.rate_limiter(limiter);
        }

        let transport: Arc<dyn Transport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(
                HttpTransport::new()
                    .map_err(|e| ConfigError::invalid(format!("http transport: {e}")))?,
            ),
        };

        Ok(ApiClient {
            base_url: self.base_url,
            default_headers: self.default_headers,
            non_retryable: self.non_retryable,
            transport,
            executor: executor.build()?,
        })
    }
}
