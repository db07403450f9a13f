use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Client, RequestBuilder, Url};
use serde_json::Value;
use tracing::debug;

use super::{Reply, Transport};
use crate::error::{ControlError, Result};

/// `reqwest`-backed transport speaking JSON to the controller's REST API.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(request_timeout)
            .pool_max_idle_per_host(1)
            .build()
            .map_err(|e| ControlError::Transport {
                url: String::new(),
                detail: format!("failed to build HTTP client: {}", e),
            })?;
        Ok(Self { client })
    }

    async fn send(&self, url: &Url, request: RequestBuilder) -> Result<Reply> {
        let response = request.send().await.map_err(|e| ControlError::Transport {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(|e| ControlError::Transport {
            url: url.to_string(),
            detail: format!("failed to read body: {}", e),
        })?;

        debug!(%url, status, ?location, "reply received");
        Ok(Reply {
            url: url.to_string(),
            status,
            location,
            body,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, url: &Url, body: Option<&Value>) -> Result<Reply> {
        let request = match body {
            Some(json) => self.client.post(url.clone()).json(json),
            None => self
                .client
                .post(url.clone())
                .header(CONTENT_TYPE, "application/json"),
        };
        self.send(url, request).await
    }

    async fn get(&self, url: &Url) -> Result<Reply> {
        self.send(url, self.client.get(url.clone())).await
    }

    async fn delete(&self, url: &Url) -> Result<Reply> {
        let request = self
            .client
            .delete(url.clone())
            .header(CONTENT_TYPE, "application/json");
        self.send(url, request).await
    }
}
