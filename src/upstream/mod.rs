pub mod capture;
pub mod limits;
pub mod models;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::Config;
use crate::db::models::Device;

use self::limits::{CircuitBreaker, TokenBucket};
use self::models::{HistoryResponse, LatestResponse, NormalizedReading};

/// Gateway to the external telemetry provider.
///
/// Failure semantics: rate limiting, circuit-open, network errors, and
/// malformed payloads all degrade to "no data" — callers treat the empty
/// result uniformly and never see an upstream error.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch_latest(&self, device: &Device) -> Option<NormalizedReading>;
    async fn fetch_history(&self, device: &Device, window_days: u32) -> Vec<NormalizedReading>;
}

#[derive(Clone)]
pub struct UpstreamClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    capture_responses: bool,
    limiter: Mutex<TokenBucket>,
    breaker: Mutex<CircuitBreaker>,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.upstream_timeout_secs))
            .build()
            .context("failed to build upstream HTTP client")?;
        let now = Instant::now();
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url: config.upstream_base_url.clone(),
                api_key: config.upstream_api_key.clone(),
                capture_responses: config.capture_responses,
                limiter: Mutex::new(TokenBucket::new(
                    config.rate_limit_capacity,
                    config.rate_limit_refill_per_sec,
                    now,
                )),
                breaker: Mutex::new(CircuitBreaker::new(
                    config.breaker_failure_threshold,
                    Duration::from_secs(config.breaker_recovery_secs),
                )),
            }),
        })
    }

    /// Gate a call on the rate limiter and the circuit breaker. Returns
    /// false when the call must be skipped.
    async fn admit(&self, device_key: &str) -> bool {
        let now = Instant::now();
        if !self.inner.limiter.lock().await.try_acquire(now) {
            debug!(device_key = %device_key, "upstream call skipped: rate limited");
            return false;
        }
        if !self.inner.breaker.lock().await.allow(now) {
            debug!(device_key = %device_key, "upstream call skipped: circuit open");
            return false;
        }
        true
    }

    async fn record_success(&self) {
        self.inner.breaker.lock().await.record_success();
    }

    async fn record_failure(&self) {
        self.inner.breaker.lock().await.record_failure(Instant::now());
    }

    async fn get_json(&self, endpoint: &str, path: &str, device_key: &str) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.inner.base_url, path);
        debug!(device_key = %device_key, url = %url, "fetching from upstream");

        let mut req = self.inner.http.get(&url);
        if let Some(ref key) = self.inner.api_key {
            req = req.bearer_auth(key);
        }

        let bytes = req
            .send()
            .await
            .context("upstream request failed")?
            .error_for_status()
            .context("upstream returned error status")?
            .bytes()
            .await
            .context("failed to read upstream response body")?;

        if self.inner.capture_responses {
            capture::save(endpoint, device_key, &bytes).await;
        }

        Ok(bytes.to_vec())
    }

    async fn call_latest(&self, device: &Device) -> Result<Option<NormalizedReading>> {
        let path = format!("/v1/devices/{}/latest", device.device_key);
        let bytes = self.get_json("latest", &path, &device.device_key).await?;

        let sample = serde_json::from_slice::<LatestResponse>(&bytes)
            .context("failed to deserialize latest-sample response")?
            .into_result()
            .context("latest-sample API call failed")?;

        let field_map = models::parse_field_map(&device.field_map);
        Ok(sample.map(|s| models::normalize(&s, &field_map)))
    }

    async fn call_history(
        &self,
        device: &Device,
        window_days: u32,
    ) -> Result<Vec<NormalizedReading>> {
        let path = format!(
            "/v1/devices/{}/history?days={}",
            device.device_key, window_days
        );
        let bytes = self.get_json("history", &path, &device.device_key).await?;

        let samples = serde_json::from_slice::<HistoryResponse>(&bytes)
            .context("failed to deserialize history response")?
            .into_result()
            .context("history API call failed")?;

        let field_map = models::parse_field_map(&device.field_map);
        Ok(samples.iter().map(|s| models::normalize(s, &field_map)).collect())
    }
}

#[async_trait]
impl Upstream for UpstreamClient {
    async fn fetch_latest(&self, device: &Device) -> Option<NormalizedReading> {
        if !self.admit(&device.device_key).await {
            return None;
        }
        match self.call_latest(device).await {
            Ok(reading) => {
                self.record_success().await;
                reading
            }
            Err(e) => {
                self.record_failure().await;
                warn!(device_key = %device.device_key, error = %e, "upstream fetch failed");
                None
            }
        }
    }

    async fn fetch_history(&self, device: &Device, window_days: u32) -> Vec<NormalizedReading> {
        if !self.admit(&device.device_key).await {
            return Vec::new();
        }
        match self.call_history(device, window_days).await {
            Ok(readings) => {
                self.record_success().await;
                readings
            }
            Err(e) => {
                self.record_failure().await;
                warn!(device_key = %device.device_key, error = %e, "upstream history fetch failed");
                Vec::new()
            }
        }
    }
}
