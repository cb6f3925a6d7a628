//! ip-api Fetcher
//!
//! Implements Fetcher against the ip-api.com batch endpoint.

use crate::domain::entities::{FailureKind, LookupKey, LookupResult};
use crate::domain::ports::{FetchError, Fetcher};
use crate::domain::value_objects::Fields;
use crate::infrastructure::{RateLimitConfig, RateLimiter};
use async_trait::async_trait;
use bytes::Bytes;
use rand::Rng;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::Duration;

/// Most queries the batch endpoint accepts per request.
pub const IPAPI_MAX_BATCH: usize = 100;

/// Free endpoint.
pub const IPAPI_FREE_URL: &str = "http://ip-api.com";

/// Pro endpoint, used when an API key is configured.
pub const IPAPI_PRO_URL: &str = "https://pro.ip-api.com";

/// ip-api client configuration.
#[derive(Debug, Clone)]
pub struct IpApiConfig {
    /// Base URL without trailing slash
    pub base_url: String,
    /// Pro API key; lifts the request budget
    pub api_key: Option<String>,
    /// Timeout for one upstream request
    pub timeout: Duration,
    /// Extra attempts after a transport error or 5xx
    pub retries: u32,
    /// Delay before the first retry, doubled for every further one
    pub retry_backoff: Duration,
    /// Request budget; ignored with an API key
    pub rate_limit: Option<RateLimitConfig>,
}

impl Default for IpApiConfig {
    fn default() -> Self {
        Self {
            base_url: IPAPI_FREE_URL.to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
            retries: 2,
            retry_backoff: Duration::from_millis(250),
            rate_limit: Some(RateLimitConfig::default()),
        }
    }
}

/// One entry of the batch request body.
#[derive(Debug, Serialize)]
struct BatchQuery {
    query: String,
    fields: u32,
    lang: &'static str,
}

/// ip-api batch client.
///
/// Always asks the upstream for `status`, `message` and `query` so failed
/// entries can be told apart, then trims each record back to the fields the
/// caller requested.
pub struct IpApiFetcher {
    config: IpApiConfig,
    client: reqwest::Client,
    limiter: Option<RateLimiter>,
}

impl IpApiFetcher {
    pub fn new(config: IpApiConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        let limiter = match (&config.api_key, &config.rate_limit) {
            (None, Some(rate_limit)) => Some(RateLimiter::new(rate_limit.clone())),
            _ => None,
        };

        Ok(Self {
            config,
            client,
            limiter,
        })
    }

    fn batch_url(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        match &self.config.api_key {
            Some(key) => format!("{}/batch?key={}", base, key),
            None => format!("{}/batch", base),
        }
    }

    /// Requests left in the upstream budget, if one is enforced.
    pub fn remaining_budget(&self) -> Option<u64> {
        self.limiter.as_ref().map(RateLimiter::remaining)
    }

    /// POST the batch, retrying transient failures with exponential backoff.
    async fn post_batch(&self, body: &[BatchQuery]) -> Result<Bytes, FetchError> {
        let mut attempt = 0;
        loop {
            if let Some(limiter) = &self.limiter {
                limiter.acquire().await;
            }

            match self.try_post(body).await {
                Err(e) if is_retryable(&e) && attempt < self.config.retries => {
                    attempt += 1;
                    let jitter = rand::thread_rng().gen_range(0..=50u64);
                    let backoff = self.config.retry_backoff * 2u32.pow(attempt - 1)
                        + Duration::from_millis(jitter);
                    tracing::warn!(
                        "ip-api request failed ({}), retry {}/{} in {:?}",
                        e,
                        attempt,
                        self.config.retries,
                        backoff
                    );
                    tokio::time::sleep(backoff).await;
                }
                other => return other,
            }
        }
    }

    async fn try_post(&self, body: &[BatchQuery]) -> Result<Bytes, FetchError> {
        let response = self
            .client
            .post(self.batch_url())
            .json(body)
            .send()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))?;

        self.observe_quota(response.headers());

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::RateLimited);
        }
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        response
            .bytes()
            .await
            .map_err(|e| FetchError::Transport(e.to_string()))
    }

    /// Sync the local budget with the `X-Rl` / `X-Ttl` headers.
    fn observe_quota(&self, headers: &HeaderMap) {
        let Some(limiter) = &self.limiter else {
            return;
        };

        let header = |name: &str| -> Option<u64> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        };

        if let (Some(remaining), Some(ttl)) = (header("X-Rl"), header("X-Ttl")) {
            tracing::debug!("ip-api quota: {} requests left, resets in {}s", remaining, ttl);
            limiter.observe(remaining, Duration::from_secs(ttl));
        }
    }
}

fn is_retryable(e: &FetchError) -> bool {
    match e {
        FetchError::Transport(_) => true,
        FetchError::Status(code) => (500..600).contains(code),
        FetchError::RateLimited | FetchError::Malformed(_) => false,
    }
}

/// Turn one upstream record into the result for `key`.
fn record_to_result(key: &LookupKey, mut record: Map<String, Value>) -> Result<LookupResult, FetchError> {
    match record.get("status").and_then(Value::as_str) {
        Some("success") => {
            record.retain(|name, _| key.fields.contains_name(name));
            let payload =
                serde_json::to_vec(&record).map_err(|e| FetchError::Malformed(e.to_string()))?;
            Ok(LookupResult::Success(Bytes::from(payload)))
        }
        Some("fail") => {
            let message = record
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("lookup failed");
            Ok(LookupResult::failure(FailureKind::Rejected, message))
        }
        _ => Ok(LookupResult::failure(
            FailureKind::Missing,
            "upstream record without status",
        )),
    }
}

#[async_trait]
impl Fetcher for IpApiFetcher {
    async fn fetch_batch(
        &self,
        keys: &[LookupKey],
    ) -> Result<HashMap<LookupKey, LookupResult>, FetchError> {
        let body: Vec<BatchQuery> = keys
            .iter()
            .map(|key| BatchQuery {
                query: key.ip.to_string(),
                fields: key.fields.union(Fields::CONTROL).mask(),
                lang: key.lang.as_code(),
            })
            .collect();

        let raw = self.post_batch(&body).await?;

        let records: Vec<Map<String, Value>> =
            serde_json::from_slice(&raw).map_err(|e| FetchError::Malformed(e.to_string()))?;

        if records.len() != keys.len() {
            return Err(FetchError::Malformed(format!(
                "expected {} records, got {}",
                keys.len(),
                records.len()
            )));
        }

        let mut results = HashMap::with_capacity(keys.len());
        for (key, record) in keys.iter().zip(records) {
            results.insert(key.clone(), record_to_result(key, record)?);
        }
        Ok(results)
    }

    fn max_batch_size(&self) -> usize {
        IPAPI_MAX_BATCH
    }
}
