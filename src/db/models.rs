use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums — each mirrors a Postgres enum of the same snake_case name.
// ---------------------------------------------------------------------------

/// Connectivity status of a device.
///
/// Lifecycle: `provisioning → online ⇄ offline`. `alert` is an orthogonal
/// flag raised while threshold alerts are active; it never blocks the
/// online/offline transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "device_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Provisioning,
    Online,
    Offline,
    Alert,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceStatus::Provisioning => "provisioning",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Alert => "alert",
        };
        f.write_str(s)
    }
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    ToSchema,
)]
#[sqlx(type_name = "alert_severity", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "alert_category", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AlertCategory {
    /// Opened by a configured rule crossing its threshold.
    Threshold,
    /// Opened directly by the anomaly detector (no rule attached).
    Anomaly,
    /// Synthetic alert opened by the poller on consecutive failed polls.
    Offline,
}

/// Comparison operator of an alert rule, serialized as the literal operator
/// (`">"`, `"<"`, `"=="`) in JSON and as `gt`/`lt`/`eq` in Postgres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type, ToSchema)]
#[sqlx(type_name = "compare_op", rename_all = "snake_case")]
pub enum CompareOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "==")]
    Eq,
}

impl CompareOp {
    /// Apply the operator. `==` is bitwise float equality against the stored
    /// threshold; no epsilon is applied.
    #[allow(clippy::float_cmp)]
    pub fn matches(self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Gt => value > threshold,
            CompareOp::Lt => value < threshold,
            CompareOp::Eq => value == threshold,
        }
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Eq => "==",
        };
        f.write_str(s)
    }
}

impl FromStr for CompareOp {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            ">" => Ok(Self::Gt),
            "<" => Ok(Self::Lt),
            "==" => Ok(Self::Eq),
            other => Err(anyhow::anyhow!("unknown comparison operator: {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A field node polled for telemetry, identified by a stable `device_key`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct Device {
    pub id: Uuid,
    /// Stable external key, e.g. the provider-side hardware ID.
    pub device_key: String,
    pub name: String,
    pub status: DeviceStatus,
    /// Excluded from the polling cycle when false.
    pub poll_enabled: bool,
    /// Provider field name → canonical metric name. Fields absent from the
    /// map pass through verbatim.
    pub field_map: serde_json::Value,
    pub last_seen: Option<DateTime<Utc>>,
}

/// One timestamped numeric observation for one field of one device.
/// Immutable once stored; one row per field per sample.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Reading {
    pub id: Uuid,
    pub device_id: Uuid,
    pub field: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
    /// Raw provider payload the value was extracted from, when captured.
    pub raw: Option<serde_json::Value>,
}

/// Insert form of [`Reading`]; the row ID is assigned by the repository.
#[derive(Debug, Clone)]
pub struct NewReading {
    pub device_id: Uuid,
    pub field: String,
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
    pub raw: Option<serde_json::Value>,
}

/// Derived per-device state, upserted after every ingested batch.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct DeviceState {
    pub device_id: Uuid,
    pub current_value: Option<f64>,
    pub current_status: DeviceStatus,
    /// Operational soundness estimate, always within `[0, 1]`.
    pub health_score: f64,
    /// How much data backs the health score, always within `[0, 1]`.
    pub confidence_score: f64,
    /// Worst z-score of the latest batch; `None` until warm-up completes.
    pub anomaly_score: Option<f64>,
    pub last_reading_at: Option<DateTime<Utc>>,
    pub readings_24h: i64,
    pub updated_at: DateTime<Utc>,
}

/// A configured threshold condition on one metric of one device.
/// Created and edited externally; consumed read-only here.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct AlertRule {
    pub id: Uuid,
    pub device_id: Uuid,
    pub metric: String,
    pub op: CompareOp,
    pub threshold: f64,
    pub severity: Severity,
    pub enabled: bool,
    /// Minimum gap between a resolved event and the next one this rule may
    /// open. Zero disables the gate.
    pub cooldown_minutes: i64,
}

/// One instance of an alert condition, tracked through
/// `open → acknowledged → resolved` (acknowledging is optional).
///
/// Invariant: at most one unresolved event per (device, rule) — and, for
/// rule-less anomaly events, per (device, metric).
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct AlertEvent {
    pub id: Uuid,
    pub device_id: Uuid,
    /// Absent for anomaly- and offline-category events.
    pub rule_id: Option<Uuid>,
    /// Metric the event fired on; `None` for offline events.
    pub metric: Option<String>,
    pub severity: Severity,
    pub category: AlertCategory,
    pub message: String,
    pub value_at_trigger: Option<f64>,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_comment: Option<String>,
}

impl AlertEvent {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }
}

/// Insert form of [`AlertEvent`].
#[derive(Debug, Clone)]
pub struct NewAlertEvent {
    pub device_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub metric: Option<String>,
    pub severity: Severity,
    pub category: AlertCategory,
    pub message: String,
    pub value_at_trigger: Option<f64>,
}

/// While "now" falls inside a window, new alert creation for the device is
/// suppressed. Resolution and acknowledgment are never suppressed.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, ToSchema)]
pub struct MaintenanceWindow {
    pub id: Uuid,
    pub device_id: Uuid,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub reason: Option<String>,
}

/// An outbound webhook endpoint. `event_filter` is `"*"` or an exact event
/// name such as `alert.triggered`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct WebhookSubscription {
    pub id: Uuid,
    pub url: String,
    /// When present, payloads are HMAC-SHA256 signed with this secret.
    pub secret: Option<String>,
    pub event_filter: String,
    pub active: bool,
}

/// Partial update applied to [`DeviceState`] by the scoring engine.
#[derive(Debug, Clone, Default)]
pub struct DeviceStatePatch {
    pub current_value: Option<f64>,
    pub current_status: Option<DeviceStatus>,
    pub health_score: Option<f64>,
    pub confidence_score: Option<f64>,
    /// Outer `Some` applies the patch; inner `None` clears the score.
    pub anomaly_score: Option<Option<f64>>,
    pub last_reading_at: Option<DateTime<Utc>>,
    pub readings_24h: Option<i64>,
}
