//! HTTP transport to the classification server.
//!
//! [`TriggerTransport`] abstracts the two calls the edge makes so the trigger
//! logic can be exercised without a network.

use async_trait::async_trait;
use halo_protocol::ClassificationRequest;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors that can occur while talking to the server.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),

    #[error("Server unreachable: {0}")]
    Unreachable(String),
}

/// Raw response from the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as a string
    pub body: String,
}

/// Calls the edge makes against the server.
#[async_trait]
pub trait TriggerTransport: Send + Sync {
    /// Bare GET against the server root.
    async fn probe(&self) -> Result<HttpResponse, TransportError>;

    /// POST a trigger request and return the raw reply.
    async fn send_trigger(
        &self,
        request: &ClassificationRequest,
    ) -> Result<HttpResponse, TransportError>;
}

/// Production transport using reqwest.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: reqwest::Client,
    root_url: String,
    trigger_url: String,
    request_timeout: Duration,
    probe_timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(
        base_url: &str,
        trigger_path: &str,
        request_timeout: Duration,
        probe_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let base = base_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(TransportError::InvalidUrl(base_url.to_string()));
        }

        let path = if trigger_path.starts_with('/') {
            trigger_path.to_string()
        } else {
            format!("/{}", trigger_path)
        };

        Ok(Self {
            client: reqwest::Client::new(),
            root_url: format!("{}/", base),
            trigger_url: format!("{}{}", base, path),
            request_timeout,
            probe_timeout,
        })
    }

    pub fn trigger_url(&self) -> &str {
        &self.trigger_url
    }
}

#[async_trait]
impl TriggerTransport for ReqwestTransport {
    async fn probe(&self) -> Result<HttpResponse, TransportError> {
        let response = self
            .client
            .get(&self.root_url)
            .timeout(self.probe_timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(HttpResponse { status, body })
    }

    #[instrument(skip(self, request), fields(url = %self.trigger_url))]
    async fn send_trigger(
        &self,
        request: &ClassificationRequest,
    ) -> Result<HttpResponse, TransportError> {
        debug!(value = request.value, "Sending trigger request");

        let response = self
            .client
            .post(&self.trigger_url)
            .json(request)
            .timeout(self.request_timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await?;

        debug!(status = status, response_len = body.len(), "Trigger request completed");
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_are_joined() {
        let transport = ReqwestTransport::new(
            "http://172.20.10.3:5000/",
            "run",
            Duration::from_secs(30),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(transport.trigger_url(), "http://172.20.10.3:5000/run");
        assert_eq!(transport.root_url, "http://172.20.10.3:5000/");
    }

    #[test]
    fn test_empty_base_url_is_rejected() {
        let result = ReqwestTransport::new("", "/run", Duration::ZERO, Duration::ZERO);
        assert!(matches!(result, Err(TransportError::InvalidUrl(_))));
    }
}
