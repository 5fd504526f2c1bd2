use std::time::Duration;

use gleaner_core::error::AppError;
use gleaner_core::traits::Fetcher;
use reqwest::Client;

const USER_AGENT: &str = "Gleaner/0.1 (article collector)";

/// HTTP fetcher using reqwest.
///
/// Downloads raw page or feed bodies with a fixed User-Agent and timeout,
/// mapping transport failures onto the retryable [`AppError`] variants.
#[derive(Clone)]
pub struct ReqwestFetcher {
    client: Client,
    timeout_secs: u64,
}

impl ReqwestFetcher {
    pub fn new() -> Result<Self, AppError> {
        Self::with_timeout(Duration::from_secs(30))
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AppError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::HttpError(e.to_string()))?;

        Ok(Self {
            client,
            timeout_secs: timeout.as_secs(),
        })
    }
}

impl Fetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                AppError::Timeout(self.timeout_secs)
            } else if e.is_connect() {
                AppError::NetworkError(format!("Connection failed: {e}"))
            } else {
                AppError::HttpError(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::HttpError(format!(
                "HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        response
            .text()
            .await
            .map_err(|e| AppError::HttpError(format!("Failed to read response body: {e}")))
    }
}

/// Serves canned bodies keyed by URL.
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct StaticFetcher {
    pages: std::sync::Arc<std::collections::HashMap<String, String>>,
}

#[cfg(test)]
impl StaticFetcher {
    pub(crate) fn with_page(url: &str, body: &str) -> Self {
        let mut pages = std::collections::HashMap::new();
        pages.insert(url.to_string(), body.to_string());
        Self {
            pages: std::sync::Arc::new(pages),
        }
    }
}

#[cfg(test)]
impl Fetcher for StaticFetcher {
    async fn fetch(&self, url: &str) -> Result<String, AppError> {
        self.pages
            .get(url)
            .cloned()
            .ok_or_else(|| AppError::HttpError(format!("HTTP 404 for {url}")))
    }
}
