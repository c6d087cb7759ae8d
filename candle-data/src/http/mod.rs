//! Outbound HTTP to the upstream data API, throttled per logical request key.

use crate::config::RateLimitConfig;
use std::time::Duration;

/// Per-key request window bookkeeping.
pub mod rate_limit;

pub use rate_limit::RateLimiter;

/// [`reqwest::Client`] wrapper that accounts every request against a [`RateLimiter`] key before
/// sending it.
///
/// Transport and status failures are returned untouched; this client never retries.
#[derive(Debug)]
pub struct RateLimitedHttpClient {
    http: reqwest::Client,
    limiter: RateLimiter,
}

impl RateLimitedHttpClient {
    pub fn new(config: RateLimitConfig, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(http, config))
    }

    pub fn with_client(http: reqwest::Client, config: RateLimitConfig) -> Self {
        Self {
            http,
            limiter: RateLimiter::new(config),
        }
    }

    /// Underlying client, used to build [`reqwest::Request`]s for [`Self::execute`].
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Send `request`, first holding the caller if `request_key` is near its budget.
    pub async fn execute(
        &self,
        request_key: &str,
        request: reqwest::Request,
    ) -> Result<reqwest::Response, reqwest::Error> {
        self.limiter.acquire(request_key).await;
        self.http.execute(request).await
    }
}
