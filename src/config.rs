use std::str::FromStr;

use anyhow::{Context, Result};

// ---------------------------------------------------------------------------
// CacheBackendKind
// ---------------------------------------------------------------------------

/// Cache backend selected at startup. The rest of the system only ever sees
/// the `CacheBackend` trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBackendKind {
    /// In-process map; per-instance, lost on restart.
    Local,
    /// Shared Postgres-backed table; safe across instances.
    Postgres,
}

impl FromStr for CacheBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Self::Local),
            "postgres" => Ok(Self::Postgres),
            other => Err(anyhow::anyhow!("unknown cache backend: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Config {
    /// Absent → run against the in-memory repository (no persistence).
    pub database_url: Option<String>,
    pub server_host: String,
    pub server_port: u16,

    pub upstream_base_url: String,
    pub upstream_api_key: Option<String>,
    /// Per-call timeout for upstream requests, in seconds.
    pub upstream_timeout_secs: u64,
    /// Save raw upstream response bodies under `captures/` for offline
    /// analysis.
    pub capture_responses: bool,

    /// Token bucket: burst capacity and refill rate per second.
    pub rate_limit_capacity: f64,
    pub rate_limit_refill_per_sec: f64,
    /// Circuit breaker: consecutive failures before opening, and seconds
    /// before a half-open trial call is allowed.
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_secs: u64,

    /// Polling loop interval in seconds.
    pub poll_interval_secs: u64,
    /// Simultaneous upstream calls per cycle.
    pub poll_concurrency: usize,
    /// Consecutive failed/empty polls before an online device flips offline.
    pub offline_failure_threshold: u32,

    pub cache_backend: CacheBackendKind,

    pub max_connections: usize,
    /// Outbound queue capacity per connection.
    pub connection_queue_capacity: usize,
    pub heartbeat_secs: u64,

    /// Anomaly detection: sliding window size, z-score flag threshold, and
    /// the hard ceiling above which an anomaly alert is raised directly.
    pub anomaly_window_size: usize,
    pub anomaly_z_threshold: f64,
    pub anomaly_alert_ceiling: f64,

    pub cleanup_interval_hours: u64,
    pub retention_readings_days: i64,
    pub retention_resolved_alerts_days: i64,
    pub retention_audit_days: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL").ok(),
            server_host: optional("SERVER_HOST", "0.0.0.0"),
            server_port: optional("SERVER_PORT", "8080")
                .parse()
                .context("SERVER_PORT must be a valid port number")?,

            upstream_base_url: required("UPSTREAM_BASE_URL")?,
            upstream_api_key: std::env::var("UPSTREAM_API_KEY").ok(),
            upstream_timeout_secs: parse_var("UPSTREAM_TIMEOUT_SECS", "5")?,
            capture_responses: optional("CAPTURE_RESPONSES", "false")
                .parse()
                .context("CAPTURE_RESPONSES must be true or false")?,

            rate_limit_capacity: parse_var("RATE_LIMIT_CAPACITY", "10")?,
            rate_limit_refill_per_sec: parse_var("RATE_LIMIT_REFILL_PER_SEC", "5")?,
            breaker_failure_threshold: parse_var("BREAKER_FAILURE_THRESHOLD", "5")?,
            breaker_recovery_secs: parse_var("BREAKER_RECOVERY_SECS", "60")?,

            poll_interval_secs: parse_var("POLL_INTERVAL_SECS", "60")?,
            poll_concurrency: parse_var("POLL_CONCURRENCY", "10")?,
            offline_failure_threshold: parse_var("OFFLINE_FAILURE_THRESHOLD", "3")?,

            cache_backend: optional("CACHE_BACKEND", "local")
                .parse()
                .context("CACHE_BACKEND must be 'local' or 'postgres'")?,

            max_connections: parse_var("MAX_CONNECTIONS", "500")?,
            connection_queue_capacity: parse_var("CONNECTION_QUEUE_CAPACITY", "100")?,
            heartbeat_secs: parse_var("HEARTBEAT_SECS", "30")?,

            anomaly_window_size: parse_var("ANOMALY_WINDOW_SIZE", "200")?,
            anomaly_z_threshold: parse_var("ANOMALY_Z_THRESHOLD", "2.5")?,
            anomaly_alert_ceiling: parse_var("ANOMALY_ALERT_CEILING", "3.0")?,

            cleanup_interval_hours: parse_var("CLEANUP_INTERVAL_HOURS", "24")?,
            retention_readings_days: parse_var("RETENTION_READINGS_DAYS", "30")?,
            retention_resolved_alerts_days: parse_var("RETENTION_RESOLVED_ALERTS_DAYS", "90")?,
            retention_audit_days: parse_var("RETENTION_AUDIT_DAYS", "365")?,
        })
    }

    /// Readings expected per device per day, derived from the polling
    /// interval (one reading per cycle). Feeds the confidence score.
    pub fn expected_readings_per_day(&self) -> f64 {
        86_400.0 / self.poll_interval_secs.max(1) as f64
    }
}

fn required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn optional(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

fn parse_var<T>(key: &str, default: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    optional(key, default)
        .parse()
        .with_context(|| format!("{key} is not a valid value"))
}

/// Fixed config for unit tests across the crate; never reads the
/// environment.
#[cfg(test)]
pub fn test_config() -> Config {
    Config {
        database_url: None,
        server_host: "127.0.0.1".into(),
        server_port: 0,
        upstream_base_url: "http://127.0.0.1:1".into(),
        upstream_api_key: None,
        upstream_timeout_secs: 5,
        capture_responses: false,
        rate_limit_capacity: 10.0,
        rate_limit_refill_per_sec: 5.0,
        breaker_failure_threshold: 5,
        breaker_recovery_secs: 60,
        poll_interval_secs: 60,
        poll_concurrency: 10,
        offline_failure_threshold: 3,
        cache_backend: CacheBackendKind::Local,
        max_connections: 500,
        connection_queue_capacity: 100,
        heartbeat_secs: 30,
        anomaly_window_size: 200,
        anomaly_z_threshold: 2.5,
        anomaly_alert_ceiling: 3.0,
        cleanup_interval_hours: 24,
        retention_readings_days: 30,
        retention_resolved_alerts_days: 90,
        retention_audit_days: 365,
    }
}
