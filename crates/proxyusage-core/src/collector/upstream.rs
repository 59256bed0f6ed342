//! HTTP client for the proxy's management API

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::error::{Error, Result};

/// Pulls usage snapshots from the upstream proxy
#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    usage_url: String,
    api_key: Option<String>,
}

impl UpstreamClient {
    /// Create a client for the configured management API
    pub fn new(config: &UpstreamConfig) -> Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;

        Ok(Self {
            client,
            usage_url: usage_url(&config.base_url),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
        })
    }

    /// URL of the usage endpoint
    pub fn usage_url(&self) -> &str {
        &self.usage_url
    }

    /// Fetch the current usage payload
    pub async fn fetch_usage(&self) -> Result<Value> {
        let mut request = self.client.get(&self.usage_url);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        debug!(url = %self.usage_url, "Fetching upstream usage");
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Upstream usage request failed");
            return Err(Error::Upstream {
                status: status.as_u16(),
                message: if body.is_empty() {
                    status.canonical_reason().unwrap_or("error").to_string()
                } else {
                    body.chars().take(200).collect()
                },
            });
        }

        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::payload_format(format!("upstream returned invalid JSON: {e}")))
    }
}

fn usage_url(base_url: &str) -> String {
    format!("{}/usage", base_url.trim_end_matches('/'))
}
