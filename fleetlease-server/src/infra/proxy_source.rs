//! Plain-text proxy list fetched over HTTP.

use std::time::Duration;

use async_trait::async_trait;
use fleetlease_core::error::{CoreError, Result};
use fleetlease_core::proxy_pool::ProxySource;
use fleetlease_core::types::ProxyCandidate;
use tracing::{debug, info};

/// Fetches one proxy per line from `url`. Lines that do not parse are
/// skipped.
#[derive(Debug, Clone)]
pub struct HttpProxySource {
    client: reqwest::Client,
    url: String,
}

impl HttpProxySource {
    pub fn new(url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| CoreError::ProxySource(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

/// Parses a proxy list body. Returns the candidates and the number of
/// non-blank lines that were rejected.
pub fn parse_proxy_list(body: &str) -> (Vec<ProxyCandidate>, usize) {
    let mut skipped = 0;
    let candidates = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match line.parse::<ProxyCandidate>() {
            Ok(candidate) => Some(candidate),
            Err(err) => {
                debug!(error = %err, "skipping unparseable proxy line");
                skipped += 1;
                None
            }
        })
        .collect();
    (candidates, skipped)
}

#[async_trait]
impl ProxySource for HttpProxySource {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn fetch(&self) -> Result<Vec<ProxyCandidate>> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| CoreError::ProxySource(format!("proxy list request failed: {}", e.without_url())))?;
        let body = response
            .text()
            .await
            .map_err(|e| CoreError::ProxySource(format!("proxy list body unreadable: {}", e.without_url())))?;

        let (candidates, skipped) = parse_proxy_list(&body);
        info!(parsed = candidates.len(), skipped, "proxy list fetched");
        Ok(candidates)
    }
}
