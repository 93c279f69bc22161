use async_trait::async_trait;
use log::debug;
use reqwest::Client;
use std::time::Duration;

use crate::config::HttpConfig;
use crate::error::{AgentError, Result};
use crate::sender::{Endpoint, MetricEntry};

/// Delivers one batch of entries to one endpoint
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, endpoint: &Endpoint, entries: &[MetricEntry]) -> Result<()>;
}

/// HTTP transport speaking the `/api/put` JSON protocol
pub struct HttpTransport {
    client: Client,
    ssl: bool,
    path: String,
    credentials: Option<(String, String)>,
}

impl HttpTransport {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .no_proxy()
            .build()
            .map_err(|e| AgentError::Config(format!("Failed to create HTTP client: {}", e)))?;

        // Basic auth is only sent when both halves are configured
        let credentials = match (&config.username, &config.password) {
            (Some(username), Some(password)) => Some((username.clone(), password.clone())),
            _ => None,
        };

        let path = if config.path.starts_with('/') {
            config.path.clone()
        } else {
            format!("/{}", config.path)
        };

        Ok(Self {
            client,
            ssl: config.ssl,
            path,
            credentials,
        })
    }

    /// Full ingestion URL for an endpoint
    pub fn url(&self, endpoint: &Endpoint) -> String {
        let scheme = if self.ssl { "https" } else { "http" };
        format!("{}://{}{}", scheme, endpoint, self.path)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn deliver(&self, endpoint: &Endpoint, entries: &[MetricEntry]) -> Result<()> {
        let url = self.url(endpoint);
        debug!("Sending {} metrics to {}", entries.len(), url);

        let delivery_error = |reason: String| AgentError::Delivery {
            endpoint: endpoint.to_string(),
            reason,
        };

        let mut request = self.client.post(&url).json(entries);
        if let Some((username, password)) = &self.credentials {
            request = request.basic_auth(username, Some(password));
        }

        let response = request
            .send()
            .await
            .map_err(|e| delivery_error(e.to_string()))?;

        let status = response.status();
        debug!("Received response {}", status);

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(delivery_error(format!("HTTP {}: {}", status, body.trim())).into());
        }

        Ok(())
    }
}
