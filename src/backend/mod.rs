use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::Config;
use crate::model::MetricsRecord;

pub mod model;

pub use model::{
    BatchStatusResponse, PageRequest, PageResponse, RefreshRequest, RefreshResult, Submission,
    WireEntry,
};
use model::{MetricsBatchRequest, MetricsBatchResponse, SubmitResponse};

/// The three upstream collaborators of the engine: the source catalog's page
/// endpoint, the metrics service and the refresh job backend.
#[async_trait]
pub trait FeedService: Send + Sync {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse>;

    async fn fetch_metrics(&self, identities: &[String]) -> Result<HashMap<String, MetricsRecord>>;

    async fn submit_refresh(&self, request: &RefreshRequest) -> Result<Submission>;

    async fn poll_batch(&self, batch_id: &str) -> Result<BatchStatusResponse>;

    /// Synchronous refresh that bypasses the job queue.
    async fn refresh_direct(&self, request: &RefreshRequest) -> Result<RefreshResult>;
}

#[derive(Clone)]
pub struct HttpFeedClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl fmt::Debug for HttpFeedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFeedClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl HttpFeedClient {
    pub fn new(base_url: Url, token: String, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("feed-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let base_url = Url::parse(&cfg.backend.base_url)
            .with_context(|| format!("invalid backend.base_url {}", cfg.backend.base_url))?;
        Self::new(base_url, cfg.backend.token.clone(), cfg.request_timeout())
    }

    pub fn build_request<B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .with_context(|| format!("invalid endpoint path {path}"))?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Accept", "application/json");
        if let Some(body) = body {
            builder = builder.json(body);
        }
        builder.build().context("failed to build feed backend request")
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T> {
        let method = request.method().clone();
        let url = request.url().clone();
        debug!(%method, %url, "feed backend request");

        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach feed backend at {url}"))?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, "rate limited by feed backend");
            return Err(anyhow!("received 429 from feed backend: {}", body));
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            warn!(%url, %status, "feed backend error");
            return Err(anyhow!("feed backend error {}: {}", status, body));
        }

        let body = res
            .text()
            .await
            .context("failed to read feed backend response")?;
        debug!(%url, bytes = body.len(), "feed backend response");
        serde_json::from_str(&body).with_context(|| format!("invalid JSON from {url}"))
    }
}

#[async_trait]
impl FeedService for HttpFeedClient {
    async fn fetch_page(&self, request: &PageRequest) -> Result<PageResponse> {
        let req = self.build_request(Method::POST, "v1/feed/page", Some(request))?;
        self.execute(req).await
    }

    async fn fetch_metrics(&self, identities: &[String]) -> Result<HashMap<String, MetricsRecord>> {
        let body = MetricsBatchRequest {
            identities: identities.to_vec(),
        };
        let req = self.build_request(Method::POST, "v1/metrics/batch", Some(&body))?;
        let resp: MetricsBatchResponse = self.execute(req).await?;
        Ok(resp.into_map(identities))
    }

    async fn submit_refresh(&self, request: &RefreshRequest) -> Result<Submission> {
        let req = self.build_request(Method::POST, "v1/refresh", Some(request))?;
        let resp: SubmitResponse = self.execute(req).await?;
        resp.into_submission()
    }

    async fn poll_batch(&self, batch_id: &str) -> Result<BatchStatusResponse> {
        let path = format!("v1/refresh/{batch_id}");
        let req = self.build_request::<()>(Method::GET, &path, None)?;
        self.execute(req).await
    }

    async fn refresh_direct(&self, request: &RefreshRequest) -> Result<RefreshResult> {
        let req = self.build_request(Method::POST, "v1/refresh/direct", Some(request))?;
        self.execute(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> HttpFeedClient {
        HttpFeedClient::new(
            Url::parse("https://feeds.example.com/api/").unwrap(),
            "token".into(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn build_request_sets_headers_and_body() {
        let request = PageRequest {
            offset: 30,
            limit: 30,
            source_catalog_signature: "a,b".into(),
            known_entry_count: Some(30),
        };
        let req = client()
            .build_request(Method::POST, "v1/feed/page", Some(&request))
            .unwrap();
        assert_eq!(req.method(), Method::POST);
        assert_eq!(req.url().path(), "/api/v1/feed/page");
        let headers = req.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
        let body: serde_json::Value =
            serde_json::from_slice(req.body().and_then(|b| b.as_bytes()).unwrap()).unwrap();
        assert_eq!(body["offset"], 30);
        assert_eq!(body["sourceCatalogSignature"], "a,b");
        assert_eq!(body["knownEntryCount"], 30);
    }

    #[test]
    fn poll_request_has_no_body() {
        let req = client()
            .build_request::<()>(Method::GET, "v1/refresh/batch-7", None)
            .unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.url().path(), "/api/v1/refresh/batch-7");
        assert!(req.body().is_none());
    }
}
