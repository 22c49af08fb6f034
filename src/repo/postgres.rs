use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use crate::db::models::{
    AlertCategory, AlertEvent, AlertRule, Device, DeviceState, DeviceStatePatch, DeviceStatus,
    MaintenanceWindow, NewAlertEvent, NewReading, Reading, WebhookSubscription,
};
use crate::errors::CoreError;
use crate::repo::{AuditSink, DeviceRepository, PruneCounts};

/// Postgres-backed repository.
///
/// Uses the runtime query API (not the `query!` macros) so the crate builds
/// without a live database; row mapping goes through `FromRow` derives on
/// the model structs.
#[derive(Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Why a guarded alert update matched no row: the event exists but is
    /// already closed, or the id is unknown entirely.
    async fn closed_or_missing(&self, id: Uuid) -> Result<anyhow::Error> {
        let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM alert_events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(if exists.is_some() {
            CoreError::AlreadyResolved.into()
        } else {
            CoreError::DeviceNotFound(format!("alert {id}")).into()
        })
    }
}

const DEVICE_COLS: &str = "id, device_key, name, status, poll_enabled, field_map, last_seen";
const ALERT_COLS: &str = "id, device_id, rule_id, metric, severity, category, message, \
                          value_at_trigger, triggered_at, acknowledged_by, acknowledged_at, \
                          resolved_at, resolution_comment";

#[async_trait]
impl DeviceRepository for PgRepository {
    async fn get_device(&self, id: Uuid) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLS} FROM devices WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_device_by_key(&self, key: &str) -> Result<Option<Device>> {
        let row = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLS} FROM devices WHERE device_key = $1"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_pollable_devices(&self) -> Result<Vec<Device>> {
        let rows = sqlx::query_as::<_, Device>(&format!(
            "SELECT {DEVICE_COLS} FROM devices WHERE poll_enabled ORDER BY device_key"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn update_device_status(
        &self,
        id: Uuid,
        status: DeviceStatus,
        last_seen: Option<DateTime<Utc>>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE devices SET status = $2, last_seen = COALESCE($3, last_seen) WHERE id = $1",
        )
        .bind(id)
        .bind(status)
        .bind(last_seen)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_reading(&self, reading: &NewReading) -> Result<Reading> {
        let row = sqlx::query_as::<_, Reading>(
            "INSERT INTO readings (device_id, field, value, recorded_at, raw) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING id, device_id, field, value, recorded_at, raw",
        )
        .bind(reading.device_id)
        .bind(&reading.field)
        .bind(reading.value)
        .bind(reading.recorded_at)
        .bind(&reading.raw)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn count_readings_since(&self, device_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM readings WHERE device_id = $1 AND recorded_at >= $2",
        )
        .bind(device_id)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    async fn get_or_create_device_state(&self, device_id: Uuid) -> Result<DeviceState> {
        // DO UPDATE on conflict so the row is always returned.
        let row = sqlx::query_as::<_, DeviceState>(
            "INSERT INTO device_state (device_id) VALUES ($1) \
             ON CONFLICT (device_id) DO UPDATE SET device_id = EXCLUDED.device_id \
             RETURNING device_id, current_value, current_status, health_score, \
                       confidence_score, anomaly_score, last_reading_at, readings_24h, updated_at",
        )
        .bind(device_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn update_device_state(&self, device_id: Uuid, patch: DeviceStatePatch) -> Result<()> {
        self.get_or_create_device_state(device_id).await?;
        sqlx::query(
            "UPDATE device_state SET \
                current_value    = COALESCE($2, current_value), \
                current_status   = COALESCE($3, current_status), \
                health_score     = COALESCE($4, health_score), \
                confidence_score = COALESCE($5, confidence_score), \
                anomaly_score    = CASE WHEN $6 THEN $7 ELSE anomaly_score END, \
                last_reading_at  = COALESCE($8, last_reading_at), \
                readings_24h     = COALESCE($9, readings_24h), \
                updated_at       = now() \
             WHERE device_id = $1",
        )
        .bind(device_id)
        .bind(patch.current_value)
        .bind(patch.current_status)
        .bind(patch.health_score)
        .bind(patch.confidence_score)
        .bind(patch.anomaly_score.is_some())
        .bind(patch.anomaly_score.flatten())
        .bind(patch.last_reading_at)
        .bind(patch.readings_24h)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn enabled_rules(&self, device_id: Uuid) -> Result<Vec<AlertRule>> {
        let rows = sqlx::query_as::<_, AlertRule>(
            "SELECT id, device_id, metric, op, threshold, severity, enabled, cooldown_minutes \
             FROM alert_rules WHERE device_id = $1 AND enabled",
        )
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn unresolved_alerts(&self, device_id: Uuid) -> Result<Vec<AlertEvent>> {
        let rows = sqlx::query_as::<_, AlertEvent>(&format!(
            "SELECT {ALERT_COLS} FROM alert_events \
             WHERE device_id = $1 AND resolved_at IS NULL"
        ))
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn unresolved_alert_for_rule(
        &self,
        device_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<AlertEvent>> {
        let row = sqlx::query_as::<_, AlertEvent>(&format!(
            "SELECT {ALERT_COLS} FROM alert_events \
             WHERE device_id = $1 AND rule_id = $2 AND resolved_at IS NULL \
             LIMIT 1"
        ))
        .bind(device_id)
        .bind(rule_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn unresolved_alert_for_category(
        &self,
        device_id: Uuid,
        category: AlertCategory,
        metric: Option<&str>,
    ) -> Result<Option<AlertEvent>> {
        let row = sqlx::query_as::<_, AlertEvent>(&format!(
            "SELECT {ALERT_COLS} FROM alert_events \
             WHERE device_id = $1 AND category = $2 \
               AND metric IS NOT DISTINCT FROM $3 \
               AND resolved_at IS NULL \
             LIMIT 1"
        ))
        .bind(device_id)
        .bind(category)
        .bind(metric)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn last_resolved_at_for_rule(
        &self,
        device_id: Uuid,
        rule_id: Uuid,
    ) -> Result<Option<DateTime<Utc>>> {
        let at: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(resolved_at) FROM alert_events \
             WHERE device_id = $1 AND rule_id = $2 AND resolved_at IS NOT NULL",
        )
        .bind(device_id)
        .bind(rule_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(at)
    }

    async fn insert_alert(&self, alert: NewAlertEvent) -> Result<AlertEvent> {
        let row = sqlx::query_as::<_, AlertEvent>(&format!(
            "INSERT INTO alert_events \
                 (device_id, rule_id, metric, severity, category, message, value_at_trigger) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) \
             RETURNING {ALERT_COLS}"
        ))
        .bind(alert.device_id)
        .bind(alert.rule_id)
        .bind(&alert.metric)
        .bind(alert.severity)
        .bind(alert.category)
        .bind(&alert.message)
        .bind(alert.value_at_trigger)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn acknowledge_alert(&self, id: Uuid, by: &str) -> Result<AlertEvent> {
        let row = sqlx::query_as::<_, AlertEvent>(&format!(
            "UPDATE alert_events \
             SET acknowledged_by = $2, acknowledged_at = now() \
             WHERE id = $1 AND resolved_at IS NULL \
             RETURNING {ALERT_COLS}"
        ))
        .bind(id)
        .bind(by)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(alert) => Ok(alert),
            None => Err(self.closed_or_missing(id).await?),
        }
    }

    async fn resolve_alert(&self, id: Uuid, comment: Option<&str>) -> Result<AlertEvent> {
        let row = sqlx::query_as::<_, AlertEvent>(&format!(
            "UPDATE alert_events \
             SET resolved_at = now(), \
                 resolution_comment = $2, \
                 acknowledged_by = COALESCE(acknowledged_by, 'system'), \
                 acknowledged_at = COALESCE(acknowledged_at, now()) \
             WHERE id = $1 AND resolved_at IS NULL \
             RETURNING {ALERT_COLS}"
        ))
        .bind(id)
        .bind(comment)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(alert) => Ok(alert),
            None => Err(self.closed_or_missing(id).await?),
        }
    }

    async fn alerts_for_device(&self, device_id: Uuid) -> Result<Vec<AlertEvent>> {
        let rows = sqlx::query_as::<_, AlertEvent>(&format!(
            "SELECT {ALERT_COLS} FROM alert_events \
             WHERE device_id = $1 ORDER BY triggered_at DESC"
        ))
        .bind(device_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn active_maintenance_window(
        &self,
        device_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<MaintenanceWindow>> {
        let row = sqlx::query_as::<_, MaintenanceWindow>(
            "SELECT id, device_id, starts_at, ends_at, reason \
             FROM maintenance_windows \
             WHERE device_id = $1 AND starts_at <= $2 AND $2 < ends_at \
             LIMIT 1",
        )
        .bind(device_id)
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn active_webhooks(&self) -> Result<Vec<WebhookSubscription>> {
        let rows = sqlx::query_as::<_, WebhookSubscription>(
            "SELECT id, url, secret, event_filter, active \
             FROM webhook_subscriptions WHERE active",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn prune(
        &self,
        readings_before: DateTime<Utc>,
        alerts_before: DateTime<Utc>,
        audit_before: DateTime<Utc>,
    ) -> Result<PruneCounts> {
        let readings = sqlx::query("DELETE FROM readings WHERE recorded_at < $1")
            .bind(readings_before)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let resolved_alerts =
            sqlx::query("DELETE FROM alert_events WHERE resolved_at IS NOT NULL AND resolved_at < $1")
                .bind(alerts_before)
                .execute(&self.pool)
                .await?
                .rows_affected();
        let audit_entries = sqlx::query("DELETE FROM audit_log WHERE created_at < $1")
            .bind(audit_before)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(PruneCounts {
            readings,
            resolved_alerts,
            audit_entries,
        })
    }
}

#[async_trait]
impl AuditSink for PgRepository {
    async fn log_action(
        &self,
        actor: &str,
        action: &str,
        resource_type: &str,
        resource_id: &str,
        details: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO audit_log (actor, action, resource_type, resource_id, details) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(actor)
        .bind(action)
        .bind(resource_type)
        .bind(resource_id)
        .bind(details)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
