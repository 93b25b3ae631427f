//! HTTP client abstraction.
//!
//! Long-polling issues plain GET / POST requests and only needs the status,
//! a couple of headers and the raw body. [`HttpClient`] keeps that surface
//! small so tests can substitute a scripted client.

// ============================================================================
// Imports
// ============================================================================

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::error::Result;

// ============================================================================
// Constants
// ============================================================================

/// Connect timeout of the default client.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// HttpResponse
// ============================================================================

/// A fully read HTTP response.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    /// Status code.
    pub status: u16,
    /// Headers with lower-cased names.
    pub headers: FxHashMap<String, String>,
    /// Body bytes.
    pub body: Bytes,
}

impl HttpResponse {
    /// Creates a response without headers.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: FxHashMap::default(),
            body: body.into(),
        }
    }

    /// Adds a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Looks up a header case-insensitively.
    #[inline]
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}

// ============================================================================
// HttpClient
// ============================================================================

/// Minimal HTTP client used by request-based transports.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Performs a GET request.
    async fn get(&self, url: &str) -> Result<HttpResponse>;

    /// Performs a POST request with a raw body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse>;
}

// ============================================================================
// ReqwestHttpClient
// ============================================================================

/// [`HttpClient`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Creates a client with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Http`] if the TLS backend fails to initialize.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;
        Ok(Self { client })
    }

    /// Wraps an existing `reqwest` client.
    #[must_use]
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn read(response: reqwest::Response) -> Result<HttpResponse> {
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.bytes().await?;
        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str) -> Result<HttpResponse> {
        let response = self.client.get(url).send().await?;
        Self::read(response).await
    }

    async fn post(&self, url: &str, body: Vec<u8>) -> Result<HttpResponse> {
        let response = self.client.post(url).body(body).send().await?;
        Self::read(response).await
    }
}

// ============================================================================
// Tests
// ============================================================================
