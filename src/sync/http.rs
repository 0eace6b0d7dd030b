// sync/http.rs - HTTP transport for custom sync endpoints
//
// JSON POST to the configured push/pull URLs. Authentication, retries, and
// provider-specific routing live behind whatever is serving those URLs.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::sync::transport::{PullRequest, PullResponse, PushRequest, PushResponse, Transport};
use crate::{Error, Result};

/// Transport speaking the push/pull contract over HTTP
#[derive(Clone)]
pub struct HttpTransport {
    push_url: String,
    pull_url: String,
    http_client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(push_url: String, pull_url: String, timeout: Duration) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            push_url: push_url.trim_end_matches('/').to_string(),
            pull_url: pull_url.trim_end_matches('/').to_string(),
            http_client,
        })
    }

    async fn post_json<T: Serialize, R: DeserializeOwned>(&self, url: &str, body: &T) -> Result<R> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let response = self
            .http_client
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());

            return Err(match status.as_u16() {
                404 => Error::NotFound(error_text),
                408 | 429 | 502 | 503 | 504 => Error::Network(format!(
                    "Sync endpoint unavailable ({}): {}",
                    status, error_text
                )),
                _ => Error::Transport(format!(
                    "Request failed with status {}: {}",
                    status, error_text
                )),
            });
        }

        response
            .json::<R>()
            .await
            .map_err(|e| Error::Transport(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        tracing::debug!(
            "Pushing {} changes to {}",
            request.changes.len(),
            self.push_url
        );
        self.post_json(&self.push_url, &request).await
    }

    async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        tracing::debug!(
            "Pulling up to {} changes from {} (cursor {:?})",
            request.limit,
            self.pull_url,
            request.cursor
        );
        self.post_json(&self.pull_url, &request).await
    }
}
