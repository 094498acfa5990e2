//! Transport trait and request/response types
//!
//! Defines the `Transport` trait that the resilience layer issues requests
//! through, independent of how the bytes actually travel.

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// HTTP request specification
///
/// Represents one HTTP request to be sent via a [`Transport`]. Cheap to clone,
/// so the same request can be replayed on every retry attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    /// HTTP method (GET, POST, etc.)
    pub method: String,

    /// Request URL
    pub url: String,

    /// Request headers
    pub headers: HashMap<String, String>,

    /// Query string parameters, appended in order
    pub query: Vec<(String, String)>,

    /// Request body (optional)
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    /// Create a new HTTP request
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            headers: HashMap::new(),
            query: Vec::new(),
            body: None,
        }
    }

    /// Add a header to the request
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Add a query string parameter
    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Set the request body
    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = Some(body);
        self
    }

    /// Serialize `value` as the JSON body and set the content type
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Serialization`](crate::TransportError::Serialization)
    /// if `value` cannot be encoded.
    pub fn with_json<T: serde::Serialize + ?Sized>(mut self, value: &T) -> Result<Self> {
        self.body = Some(serde_json::to_vec(value)?);
        self.headers
            .insert("content-type".to_string(), "application/json".to_string());
        Ok(self)
    }
}

/// HTTP response
///
/// Represents an HTTP response received from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,

    /// Response headers, names lowercased
    pub headers: HashMap<String, String>,

    /// Response body
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Create a new HTTP response
    pub fn new(status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// Check if response is successful (2xx)
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Check if response is an error (4xx or 5xx)
    pub fn is_error(&self) -> bool {
        self.status >= 400
    }

    /// Get the response body as a string, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Parse response body as JSON
    ///
    /// # Errors
    ///
    /// Returns an error if the response body cannot be parsed as valid JSON
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    /// Get a header value by name (case-insensitive)
    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Media type of the body without parameters, e.g. `application/json`
    pub fn content_type(&self) -> Option<&str> {
        self.get_header("content-type")
            .and_then(|value| value.split(';').next())
            .map(str::trim)
    }
}

/// Narrow interface for issuing a single request
///
/// Implementations perform exactly one exchange per call and must be cancel
/// safe: dropping the returned future abandons the request and releases its
/// connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send an HTTP request and receive a response
    ///
    /// Error statuses are returned as ordinary responses; only failures to
    /// complete the exchange are errors.
    async fn send_http(&self, request: HttpRequest) -> Result<HttpResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_builder() {
        let request = HttpRequest::new("POST", "https://api.example.com/items")
            .with_header("Authorization", "Bearer token123")
            .with_query("page", "2")
            .with_body(b"{}".to_vec());

        assert_eq!(request.method, "POST");
        assert_eq!(request.headers.get("Authorization").unwrap(), "Bearer token123");
        assert_eq!(request.query, vec![("page".to_string(), "2".to_string())]);
        assert_eq!(request.body.as_deref(), Some(&b"{}"[..]));
    }

    #[test]
    fn test_request_with_json() {
        let request = HttpRequest::new("POST", "https://api.example.com")
            .with_json(&serde_json::json!({"key": "value"}))
            .unwrap();

        assert_eq!(request.headers.get("content-type").unwrap(), "application/json");
        let body: serde_json::Value = serde_json::from_slice(request.body.as_ref().unwrap()).unwrap();
        assert_eq!(body["key"], "value");
    }

    #[test]
    fn test_response_status_helpers() {
        let ok = HttpResponse::new(204, HashMap::new(), Vec::new());
        assert!(ok.is_success());
        assert!(!ok.is_error());

        let redirect = HttpResponse::new(304, HashMap::new(), Vec::new());
        assert!(!redirect.is_success());
        assert!(!redirect.is_error());

        let failed = HttpResponse::new(503, HashMap::new(), Vec::new());
        assert!(failed.is_error());
    }

    #[test]
    fn test_response_headers_case_insensitive() {
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/json; charset=utf-8".to_string(),
        );
        let response = HttpResponse::new(200, headers, br#"{"n":1}"#.to_vec());

        assert_eq!(
            response.get_header("Content-Type"),
            Some("application/json; charset=utf-8")
        );
        assert_eq!(response.content_type(), Some("application/json"));

        let parsed: serde_json::Value = response.json().unwrap();
        assert_eq!(parsed["n"], 1);
    }

    #[test]
    fn test_response_text_lossy() {
        let response = HttpResponse::new(200, HashMap::new(), vec![b'h', b'i', 0xff]);
        assert_eq!(response.text(), "hi\u{fffd}");
    }
}
