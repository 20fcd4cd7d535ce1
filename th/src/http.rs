//! HTTP probe used as the work function for URL batches
//!
//! One GET per target. The response body is read to completion (so latency
//! covers the full transfer) and then discarded; only the status code and
//! body size are reported. Non-2xx statuses are successful probes: the
//! endpoint answered. Transport failures and timeouts are errors.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

/// HTTP probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Per-request timeout in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// User-Agent header sent with every request
    #[serde(rename = "user-agent")]
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 30_000,
            user_agent: format!("throttler/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// What a probed endpoint answered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub status: u16,
    /// Size of the response body in bytes
    pub bytes: usize,
}

impl ProbeResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A probe that got no HTTP answer
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request to {url} timed out")]
    Timeout { url: String },

    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl ProbeError {
    fn from_reqwest(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            ProbeError::Timeout { url: url.to_string() }
        } else {
            ProbeError::Request {
                url: url.to_string(),
                source,
            }
        }
    }
}

/// Issues one GET per target
#[derive(Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(config: &HttpConfig) -> Result<Self, reqwest::Error> {
        debug!(?config, "HttpProbe::new: called");
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout())
            .build()?;
        Ok(Self { client })
    }

    /// GET `url` and read the whole body
    pub async fn get(&self, url: String) -> Result<ProbeResponse, ProbeError> {
        debug!(%url, "HttpProbe::get: called");
        let start = Instant::now();

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProbeError::from_reqwest(&url, e))?;
        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|e| ProbeError::from_reqwest(&url, e))?;

        info!(
            %url,
            status,
            latency_secs = start.elapsed().as_secs_f64(),
            "Completed request"
        );
        Ok(ProbeResponse {
            status,
            bytes: body.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HttpConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.user_agent.starts_with("throttler/"));
    }

    #[test]
    fn test_response_success_range() {
        assert!(ProbeResponse { status: 204, bytes: 0 }.is_success());
        assert!(!ProbeResponse { status: 429, bytes: 17 }.is_success());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_an_error() {
        let probe = HttpProbe::new(&HttpConfig {
            timeout_ms: 2_000,
            ..Default::default()
        })
        .unwrap();

        // Port 9 (discard) on localhost is closed in any sane test environment
        let result = probe.get("http://127.0.0.1:9/".to_string()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_invalid_url_is_an_error() {
        let probe = HttpProbe::new(&HttpConfig::default()).unwrap();
        let err = probe.get("not a url".to_string()).await.unwrap_err();
        assert!(matches!(err, ProbeError::Request { .. }));
        assert!(err.to_string().contains("not a url"));
    }
}
