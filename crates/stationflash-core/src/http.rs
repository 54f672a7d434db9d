//! HTTP fetch abstraction.
//!
//! Defines the `HttpFetch` trait used for the manifest and the binary
//! images, so the orchestrator can be driven without a network in tests.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, instrument};
use url::Url;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpError {
    #[error("HTTP {status} for {url}")]
    Status { url: String, status: u16 },

    #[error("Request to {url} failed: {reason}")]
    Transport { url: String, reason: String },

    #[error("Failed to build HTTP client: {0}")]
    Client(String),
}

/// Abstract HTTP GET returning the full body.
///
/// Non-2xx responses must be reported as [`HttpError::Status`].
#[async_trait]
pub trait HttpFetch: Send + Sync {
    async fn get(&self, url: &Url) -> Result<Bytes, HttpError>;
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const USER_AGENT: &str = concat!("stationflash/", env!("CARGO_PKG_VERSION"));

/// reqwest-based fetcher.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    /// Client with a connect timeout and a `stationflash/<version>` user agent.
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| HttpError::Client(e.to_string()))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpFetch for ReqwestFetcher {
    #[instrument(skip(self), fields(url = %url))]
    async fn get(&self, url: &Url) -> Result<Bytes, HttpError> {
        let transport_err = |e: reqwest::Error| HttpError::Transport {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let response = self
            .client
            .get(url.as_str())
            .send()
            .await
            .map_err(transport_err)?;

        let status = response.status();
        if !status.is_success() {
            return Err(HttpError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let body = response.bytes().await.map_err(transport_err)?;
        debug!(bytes = body.len(), "GET complete");
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds_with_defaults() {
        assert!(ReqwestFetcher::new().is_ok());
    }

    #[test]
    fn test_client_error_converts_to_unreachable() {
        let err = crate::catalog::FetchError::from(HttpError::Client("no TLS backend".into()));
        assert_eq!(
            err.to_string(),
            "Failed to fetch versions: Failed to build HTTP client: no TLS backend"
        );
    }
}
