//! HTTP access used for marketplace lookups and artifact downloads.
//!
//! The manager only talks to the network through [`HttpTransport`], which keeps
//! timeout and redirect policy in one place and lets tests substitute an
//! in-memory implementation.

use crate::error::PluginError;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Network policy applied to every request.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Total time budget for a marketplace lookup
    pub lookup_timeout: Duration,
    /// Total time budget for an artifact download, body included
    pub download_timeout: Duration,
    /// Maximum redirects followed before giving up
    pub max_redirects: usize,
    /// User agent sent with every request
    pub user_agent: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            lookup_timeout: Duration::from_secs(15),
            download_timeout: Duration::from_secs(300),
            max_redirects: 5,
            user_agent: concat!("horizon-admin/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// An open response body.
pub struct ByteStream {
    /// Length announced by the server, if any
    pub content_length: Option<u64>,
    /// Body chunks
    pub body: BoxStream<'static, Result<Bytes, PluginError>>,
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Fetches and decodes a JSON document.
    async fn get_json(&self, url: &Url) -> Result<serde_json::Value, PluginError>;

    /// Opens a streaming download.
    async fn get_stream(&self, url: &Url) -> Result<ByteStream, PluginError>;
}

/// [`HttpTransport`] backed by `reqwest`.
pub struct ReqwestTransport {
    client: reqwest::Client,
    config: TransportConfig,
}

impl ReqwestTransport {
    pub fn new(config: TransportConfig) -> Result<Self, PluginError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(config.connect_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| PluginError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }
}

fn map_reqwest_error(url: &Url, err: reqwest::Error) -> PluginError {
    if err.is_timeout() {
        PluginError::DownloadTimeout(format!("request to {} timed out", url))
    } else {
        PluginError::Network(format!("request to {} failed: {}", url, err))
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get_json(&self, url: &Url) -> Result<serde_json::Value, PluginError> {
        debug!("GET (json) {}", url);
        let response = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(self.config.lookup_timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PluginError::Network(format!(
                "lookup {} returned status {}",
                url, status
            )));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| map_reqwest_error(url, e))
    }

    async fn get_stream(&self, url: &Url) -> Result<ByteStream, PluginError> {
        debug!("GET (stream) {}", url);
        let response = self
            .client
            .get(url.clone())
            .timeout(self.config.download_timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PluginError::Network(format!(
                "download {} returned status {}",
                url, status
            )));
        }

        let content_length = response.content_length();
        let owned_url = url.clone();
        let body = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| map_reqwest_error(&owned_url, e)))
            .boxed();

        Ok(ByteStream {
            content_length,
            body,
        })
    }
}
