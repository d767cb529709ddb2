//! Edge cache purge boundary
//!
//! Purges are asynchronous on every real CDN: a successful call only means
//! the request was accepted. Devices re-verify chunk checksums, so a stale
//! edge copy is detected rather than trusted.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::DistributionConfig;
use crate::error::Result;

#[async_trait]
pub trait EdgeCache: Send + Sync {
    /// Request a purge of the given paths (`*` suffix = prefix purge).
    /// Returns the provider's reference for the request, if any.
    async fn purge(&self, paths: &[String]) -> Result<Option<String>>;

    fn name(&self) -> &'static str;
}

/// Used when the origin is served directly without an edge cache
#[derive(Debug, Clone, Default)]
pub struct NoopEdgeCache;

#[async_trait]
impl EdgeCache for NoopEdgeCache {
    async fn purge(&self, paths: &[String]) -> Result<Option<String>> {
        tracing::debug!("No edge cache configured, skipping purge of {:?}", paths);
        Ok(None)
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Edge cache selected by configuration: the HTTP purge client when a purge
/// endpoint is configured, otherwise [`NoopEdgeCache`].
pub fn edge_cache_for(config: &DistributionConfig) -> Arc<dyn EdgeCache> {
    if let Some(endpoint) = &config.purge_endpoint {
        #[cfg(feature = "cdn")]
        return Arc::new(HttpEdgeCache::new(endpoint.clone(), config.purge_token.clone()));

        #[cfg(not(feature = "cdn"))]
        tracing::warn!(
            endpoint = %endpoint,
            "Purge endpoint configured but the `cdn` feature is disabled; purges are skipped"
        );
    }
    Arc::new(NoopEdgeCache)
}

#[cfg(feature = "cdn")]
pub use http::HttpEdgeCache;

#[cfg(feature = "cdn")]
mod http {
    use async_trait::async_trait;
    use serde::Deserialize;

    use super::EdgeCache;
    use crate::error::{BundlecastError, Result};

    /// Generic purge API client: `POST <endpoint>` with `{"paths": [...]}`
    /// and a bearer token.
    pub struct HttpEdgeCache {
        client: reqwest::Client,
        endpoint: String,
        token: Option<String>,
    }

    impl HttpEdgeCache {
        pub fn new(endpoint: impl Into<String>, token: Option<String>) -> Self {
            Self {
                client: reqwest::Client::new(),
                endpoint: endpoint.into(),
                token,
            }
        }
    }

    #[derive(Deserialize)]
    struct PurgeResponse {
        id: Option<String>,
    }

    #[async_trait]
    impl EdgeCache for HttpEdgeCache {
        async fn purge(&self, paths: &[String]) -> Result<Option<String>> {
            let mut request = self
                .client
                .post(&self.endpoint)
                .json(&serde_json::json!({ "paths": paths }));
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| BundlecastError::Distribution(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(BundlecastError::Distribution(format!(
                    "Purge rejected with status {}: {}",
                    status, body
                )));
            }

            // Providers that do not return a body still accepted the purge
            let body = response.text().await.unwrap_or_default();
            let reference = serde_json::from_str::<PurgeResponse>(&body)
                .ok()
                .and_then(|r| r.id);
            Ok(reference)
        }

        fn name(&self) -> &'static str {
            "http"
        }
    }
}
