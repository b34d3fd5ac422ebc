//! Outbound request execution against a selected instance.
//!
//! The balancer never talks to the network directly; it hands the instance's
//! base URL and the request to a `Transport`. Timeouts are applied by the
//! balancer around each call so every transport gets the same semantics.

use async_trait::async_trait;
use reqwest::Client as HttpClient;
use tracing::debug;

use crate::core::error::{RouterError, RouterResult};
use crate::core::types::{UpstreamRequest, UpstreamResponse};

/// Executes one attempt of a request against one instance
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` to the instance reachable at `base_url`
    ///
    /// Any response the instance produced is `Ok`, whatever its status; `Err`
    /// means no response was received.
    async fn send(&self, base_url: &str, request: &UpstreamRequest) -> RouterResult<UpstreamResponse>;
}

/// HTTP transport backed by a pooled `reqwest` client
#[derive(Clone)]
pub struct HttpTransport {
    client: HttpClient,
}

impl HttpTransport {
    pub fn new() -> RouterResult<Self> {
        let client = HttpClient::builder()
            .build()
            .map_err(|e| RouterError::config(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// Use a preconfigured client (proxies, TLS roots, pool sizing)
    pub fn with_client(client: HttpClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, base_url: &str, request: &UpstreamRequest) -> RouterResult<UpstreamResponse> {
        let url = request.url(base_url);
        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        debug!(url = %url, status = status.as_u16(), bytes = body.len(), "Upstream responded");
        Ok(UpstreamResponse::new(status, headers, body))
    }
}
