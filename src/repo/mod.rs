pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::db::models::{
    AlertCategory, AlertEvent, AlertRule, Device, DeviceState, DeviceStatePatch, DeviceStatus,
    MaintenanceWindow, NewAlertEvent, NewReading, Reading, WebhookSubscription,
};

/// Rows removed by one retention pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneCounts {
    pub readings: u64,
    pub resolved_alerts: u64,
    pub audit_entries: u64,
}

/// Storage abstraction the core consumes. Postgres in production, the
/// in-memory implementation for tests and database-less runs; the pipeline
/// never knows which one is active.
///
/// Methods return `anyhow::Result`; typed `CoreError` conditions (e.g.
/// `AlreadyResolved`) travel inside it and are downcast where the
/// distinction matters.
#[async_trait]
pub trait DeviceRepository: Send + Sync {
    async fn get_device(&self, id: Uuid) -> Result<Option<Device>>;
    async fn get_device_by_key(&self, key: &str) -> Result<Option<Device>>;
    /// Devices eligible for the polling cycle (`poll_enabled`, any status).
    async fn list_pollable_devices(&self) -> Result<Vec<Device>>;
    async fn update_device_status(
        &self,
        id: Uuid,
        status: DeviceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()>;

    async fn insert_reading(&self, reading: &NewReading) -> Result<Reading>;
    async fn count_readings_since(&self, device_id: Uuid, since: DateTime<Utc>) -> Result<i64>;

    async fn get_or_create_device_state(&self, device_id: Uuid) -> Result<DeviceState>;
    async fn update_device_state(&self, device_id: Uuid, patch: DeviceStatePatch) -> Result<()>;

    async fn enabled_rules(&self, device_id: Uuid) -> Result<Vec<AlertRule>>;

    async fn unresolved_alerts(&self, device_id: Uuid) -> Result<Vec<AlertEvent>>;
    async fn unresolved_alert_for_rule(
        &self,
        device_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<AlertEvent>>;
    /// Unresolved rule-less event of `category` — offline events, or anomaly
    /// events keyed by metric.
    async fn unresolved_alert_for_category(
        &self,
        device_id: Uuid,
        category: AlertCategory,
        metric: Option<&str>,
    ) -> Result<Option<AlertEvent>>;
    /// Most recent resolution timestamp for this rule; feeds the cooldown
    /// gate.
    async fn last_resolved_at_for_rule(
        &self,
        device_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>>;
    async fn insert_alert(&self, alert: NewAlertEvent) -> Result<AlertEvent>;
    /// Errors with `CoreError::AlreadyResolved` when the event is closed.
    async fn acknowledge_alert(&self, id: Uuid, by: &str) -> Result<AlertEvent>;
    /// Stamps `resolved_at` and auto-acknowledges when needed. Errors with
    /// `CoreError::AlreadyResolved` when the event is already closed.
    async fn resolve_alert(&self, id: Uuid, comment: Option<&str>) -> Result<AlertEvent>;
    async fn alerts_for_device(&self, device_id: Uuid) -> Result<Vec<AlertEvent>>;

    async fn active_maintenance_window(
        &self,
        device_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<MaintenanceWindow>>;

    async fn active_webhooks(&self) -> Result<Vec<WebhookSubscription>>;

    /// Delete readings recorded before `readings_before`, alerts resolved
    /// before `alerts_before`, and audit entries older than `audit_before`.
    async fn prune(
        &self,
        readings_before: DateTime<Utc>,
        alerts_before: DateTime<Utc>,
        audit_before: DateTime<Utc>,
    ) -> Result<PruneCounts>;
}

/// Audit trail consumed as an external collaborator. Failures are logged by
/// callers and never abort the pipeline.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_action(
        &self,
        actor: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: serde_json::Value,
    ) -> Result<()>;
}
