use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::models::{
    AlertCategory, AlertEvent, AlertRule, Device, DeviceState, DeviceStatePatch, DeviceStatus,
    MaintenanceWindow, NewAlertEvent, NewReading, Reading, WebhookSubscription,
};
use crate::errors::CoreError;
use crate::repo::{AuditSink, DeviceRepository, PruneCounts};

/// One audit trail row kept by the in-memory sink.
#[derive(Debug, Clone)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: String,
    pub details: serde_json::Value,
}

#[derive(Default)]
struct Inner {
    devices: HashMap<Uuid, Device>,
    readings: Vec<Reading>,
    states: HashMap<Uuid, DeviceState>,
    rules: Vec<AlertRule>,
    alerts: Vec<AlertEvent>,
    windows: Vec<MaintenanceWindow>,
    webhooks: Vec<WebhookSubscription>,
    audit: Vec<AuditEntry>,
}

/// Full in-memory implementation of [`DeviceRepository`] and [`AuditSink`].
///
/// Used by every unit test and by database-less runs (`DATABASE_URL` unset).
/// Wrapped in `Arc` so it can be cheaply cloned and shared across tasks.
#[derive(Clone, Default)]
pub struct MemoryRepository {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_device(&self, device: Device) {
        self.inner.write().await.devices.insert(device.id, device);
    }

    pub async fn add_rule(&self, rule: AlertRule) {
        self.inner.write().await.rules.push(rule);
    }

    pub async fn add_maintenance_window(&self, window: MaintenanceWindow) {
        self.inner.write().await.windows.push(window);
    }

    pub async fn add_webhook(&self, sub: WebhookSubscription) {
        self.inner.write().await.webhooks.push(sub);
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.read().await.audit.clone()
    }

    pub async fn reading_count(&self) -> usize {
        self.inner.read().await.readings.len()
    }
}

#[async_trait]
impl DeviceRepository for MemoryRepository {
    async fn get_device(&self, id: Uuid) -> Result<Option<Device>> {
        Ok(self.inner.read().await.devices.get(&id).cloned())
    }

    async fn get_device_by_key(&self, key: &str) -> Result<Option<Device>> {
        Ok(self
            .inner
            .read()
            .await
            .devices
            .values()
            .find(|d| d.device_key == key)
            .cloned())
    }

    async fn list_pollable_devices(&self) -> Result<Vec<Device>> {
        let mut devices: Vec<Device> = self
            .inner
            .read()
            .await
            .devices
            .values()
            .filter(|d| d.poll_enabled)
            .cloned()
            .collect();
        devices.sort_by(|a, b| a.device_key.cmp(&b.device_key));
        Ok(devices)
    }

    async fn update_device_status(
        &self,
        id: Uuid,
        status: DeviceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(device) = inner.devices.get_mut(&id) {
            device.status = status;
            if last_seen.is_some() {
                device.last_seen = last_seen;
            }
        }
        Ok(())
    }

    async fn insert_reading(&self, reading: &NewReading) -> Result<Reading> {
        let row = Reading {
            id: Uuid::new_v4(),
            device_id: reading.device_id,
            field: reading.field.clone(),
            value: reading.value,
            recorded_at: reading.recorded_at,
            raw: reading.raw.clone(),
        };
        self.inner.write().await.readings.push(row.clone());
        Ok(row)
    }

    async fn count_readings_since(&self, device_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        Ok(self
            .inner
            .read()
            .await
            .readings
            .iter()
            .filter(|r| r.device_id == device_id && r.recorded_at >= since)
            .count() as i64)
    }

    async fn get_or_create_device_state(&self, device_id: Uuid) -> Result<DeviceState> {
        let mut inner = self.inner.write().await;
        let status = inner
            .devices
            .get(&device_id)
            .map(|d| d.status)
            .unwrap_or(DeviceStatus::Provisioning);
        let state = inner
            .states
            .entry(device_id)
            .or_insert_with(|| DeviceState {
                device_id,
                current_value: None,
                current_status: status,
                health_score: 1.0,
                confidence_score: 0.0,
                anomaly_score: None,
                last_reading_at: None,
                readings_24h: 0,
                updated_at: Utc::now(),
            });
        Ok(state.clone())
    }

    async fn update_device_state(&self, device_id: Uuid, patch: DeviceStatePatch) -> Result<()> {
        // Ensure the row exists, then apply the patch under one lock scope.
        drop(self.get_or_create_device_state(device_id).await?);
        let mut inner = self.inner.write().await;
        if let Some(state) = inner.states.get_mut(&device_id) {
            if let Some(v) = patch.current_value {
                state.current_value = Some(v);
            }
            if let Some(s) = patch.current_status {
                state.current_status = s;
            }
            if let Some(h) = patch.health_score {
                state.health_score = h;
            }
            if let Some(c) = patch.confidence_score {
                state.confidence_score = c;
            }
            if let Some(a) = patch.anomaly_score {
                state.anomaly_score = a;
            }
            if let Some(t) = patch.last_reading_at {
                state.last_reading_at = Some(t);
            }
            if let Some(n) = patch.readings_24h {
                state.readings_24h = n;
            }
            state.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn enabled_rules(&self, device_id: Uuid) -> Result<Vec<AlertRule>> {
        Ok(self
            .inner
            .read()
            .await
            .rules
            .iter()
            .filter(|r| r.device_id == device_id && r.enabled)
            .cloned()
            .collect())
    }

    async fn unresolved_alerts(&self, device_id: Uuid) -> Result<Vec<AlertEvent>> {
        Ok(self
            .inner
            .read()
            .await
            .alerts
            .iter()
            .filter(|a| a.device_id == device_id && !a.is_resolved())
            .cloned()
            .collect())
    }

    async fn unresolved_alert_for_rule(
        &self,
        device_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<AlertEvent>> {
        Ok(self
            .inner
            .read()
            .await
            .alerts
            .iter()
            .find(|a| a.device_id == device_id && a.rule_id == Some(rule_id) && !a.is_resolved())
            .cloned())
    }

    async fn unresolved_alert_for_category(
        &self,
        device_id: Uuid,
        category: AlertCategory,
        metric: Option<&str>,
    ) -> Result<Option<AlertEvent>> {
        Ok(self
            .inner
            .read()
            .await
            .alerts
            .iter()
            .find(|a| {
                a.device_id == device_id
                    && a.category == category
                    && a.metric.as_deref() == metric
                    && !a.is_resolved()
            })
            .cloned())
    }

    async fn last_resolved_at_for_rule(
        &self,
        device_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .inner
            .read()
            .await
            .alerts
            .iter()
            .filter(|a| a.device_id == device_id && a.rule_id == Some(rule_id))
            .filter_map(|a| a.resolved_at)
            .max())
    }

    async fn insert_alert(&self, alert: NewAlertEvent) -> Result<AlertEvent> {
        let row = AlertEvent {
            id: Uuid::new_v4(),
            device_id: alert.device_id,
            rule_id: alert.rule_id,
            metric: alert.metric,
            severity: alert.severity,
            category: alert.category,
            message: alert.message,
            value_at_trigger: alert.value_at_trigger,
            triggered_at: Utc::now(),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_at: None,
            resolution_comment: None,
        };
        self.inner.write().await.alerts.push(row.clone());
        Ok(row)
    }

    async fn acknowledge_alert(&self, id: Uuid, by: &str) -> Result<AlertEvent> {
        let mut inner = self.inner.write().await;
        let alert = inner
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| CoreError::DeviceNotFound(format!("alert {id}")))?;
        if alert.is_resolved() {
            return Err(CoreError::AlreadyResolved.into());
        }
        alert.acknowledged_by = Some(by.to_owned());
        alert.acknowledged_at = Some(Utc::now());
        Ok(alert.clone())
    }

    async fn resolve_alert(&self, id: Uuid, comment: Option<&str>) -> Result<AlertEvent> {
        let mut inner = self.inner.write().await;
        let alert = inner
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| CoreError::DeviceNotFound(format!("alert {id}")))?;
        if alert.is_resolved() {
            return Err(CoreError::AlreadyResolved.into());
        }
        let now = Utc::now();
        alert.resolved_at = Some(now);
        alert.resolution_comment = comment.map(str::to_owned);
        if alert.acknowledged_at.is_none() {
            alert.acknowledged_by = Some("system".to_owned());
            alert.acknowledged_at = Some(now);
        }
        Ok(alert.clone())
    }

    async fn alerts_for_device(&self, device_id: Uuid) -> Result<Vec<AlertEvent>> {
        let mut rows: Vec<AlertEvent> = self
            .inner
            .read()
            .await
            .alerts
            .iter()
            .filter(|a| a.device_id == device_id)
            .cloned()
            .collect();
        rows.sort_by_key(|a| std::cmp::Reverse(a.triggered_at));
        Ok(rows)
    }

    async fn active_maintenance_window(
        &self,
        device_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<MaintenanceWindow>> {
        Ok(self
            .inner
            .read()
            .await
            .windows
            .iter()
            .find(|w| w.device_id == device_id && w.starts_at <= at && at < w.ends_at)
            .cloned())
    }

    async fn active_webhooks(&self) -> Result<Vec<WebhookSubscription>> {
        Ok(self
            .inner
            .read()
            .await
            .webhooks
            .iter()
            .filter(|s| s.active)
            .cloned()
            .collect())
    }

    async fn prune(
        &self,
        readings_before: DateTime<Utc>,
        alerts_before: DateTime<Utc>,
        audit_before: DateTime<Utc>,
    ) -> Result<PruneCounts> {
        let mut inner = self.inner.write().await;

        let before = inner.readings.len();
        inner.readings.retain(|r| r.recorded_at >= readings_before);
        let readings = (before - inner.readings.len()) as u64;

        let before = inner.alerts.len();
        inner
            .alerts
            .retain(|a| a.resolved_at.map_or(true, |t| t >= alerts_before));
        let resolved_alerts = (before - inner.alerts.len()) as u64;

        let before = inner.audit.len();
        inner.audit.retain(|e| e.at >= audit_before);
        let audit_entries = (before - inner.audit.len()) as u64;

        Ok(PruneCounts {
            readings,
            resolved_alerts,
            audit_entries,
        })
    }
}

#[async_trait]
impl AuditSink for MemoryRepository {
    async fn log_action(
        &self,
        actor: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        self.inner.write().await.audit.push(AuditEntry {
            at: Utc::now(),
            actor: actor.to_owned(),
            action: action.to_owned(),
            resource_type: resource_type.to_owned(),
            resource_id: resource_id.to_owned(),
            details,
        });
        Ok(())
    }
}
