pub mod notify;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info, warn};

use crate::db::models::{
    AlertCategory, AlertEvent, AlertRule, Device, NewAlertEvent, Severity,
};
use crate::repo::{AuditSink, DeviceRepository};

pub use self::notify::Notifier;

/// What one evaluation pass did to a device's alert set.
#[derive(Debug, Default)]
pub struct EvaluationOutcome {
    pub opened: Vec<AlertEvent>,
    pub resolved: Vec<AlertEvent>,
}

/// Drives the alert lifecycle: opens events when rule conditions hold,
/// resolves them when conditions clear, and keeps the synthetic offline and
/// anomaly events consistent with the same invariants.
///
/// Creation of new events is suppressed during an active maintenance window;
/// resolution and acknowledgment never are. Every lifecycle transition is
/// audited and fanned out to webhook subscribers.
#[derive(Clone)]
pub struct AlertEngine {
    repo: Arc<dyn DeviceRepository>,
    audit: Arc<dyn AuditSink>,
    notifier: Notifier,
}

impl AlertEngine {
    pub fn new(
        repo: Arc<dyn DeviceRepository>,
        audit: Arc<dyn AuditSink>,
        notifier: Notifier,
    ) -> Self {
        Self {
            repo,
            audit,
            notifier,
        }
    }

    /// Evaluate every enabled rule of `device` against the latest batch of
    /// field values. Rules whose metric is absent from the batch are left
    /// untouched.
    pub async fn evaluate(
        &self,
        device: &Device,
        fields: &BTreeMap<String, f64>,
    ) -> Result<EvaluationOutcome> {
        let mut outcome = EvaluationOutcome::default();

        for rule in self.repo.enabled_rules(device.id).await? {
            let Some(&value) = fields.get(&rule.metric) else {
                continue;
            };
            let existing = self.repo.unresolved_alert_for_rule(device.id, rule.id).await?;

            if rule.op.matches(value, rule.threshold) {
                if existing.is_some() {
                    continue; // already open, nothing to do
                }
                if self.in_maintenance(device).await? {
                    debug!(
                        device_key = %device.device_key,
                        metric = %rule.metric,
                        "alert suppressed by maintenance window"
                    );
                    continue;
                }
                if self.in_cooldown(device, &rule).await? {
                    debug!(
                        device_key = %device.device_key,
                        metric = %rule.metric,
                        cooldown_minutes = rule.cooldown_minutes,
                        "alert suppressed by cooldown"
                    );
                    continue;
                }

                let alert = self
                    .repo
                    .insert_alert(NewAlertEvent {
                        device_id: device.id,
                        rule_id: Some(rule.id),
                        metric: Some(rule.metric.clone()),
                        severity: rule.severity,
                        category: AlertCategory::Threshold,
                        message: format!(
                            "{} {} {} (observed {})",
                            rule.metric, rule.op, rule.threshold, value
                        ),
                        value_at_trigger: Some(value),
                    })
                    .await?;
                info!(
                    device_key = %device.device_key,
                    alert_id = %alert.id,
                    metric = %rule.metric,
                    value,
                    "threshold alert opened"
                );
                self.emit("alert.triggered", device, &alert).await;
                outcome.opened.push(alert);
            } else if let Some(existing) = existing {
                let resolved = self
                    .repo
                    .resolve_alert(existing.id, Some("condition cleared"))
                    .await?;
                info!(
                    device_key = %device.device_key,
                    alert_id = %resolved.id,
                    metric = %rule.metric,
                    "threshold alert resolved"
                );
                self.emit("alert.resolved", device, &resolved).await;
                outcome.resolved.push(resolved);
            }
        }

        Ok(outcome)
    }

    /// Open the synthetic offline event for a device, unless one is already
    /// unresolved or a maintenance window is active.
    pub async fn create_offline_alert(
        &self,
        device: &Device,
        failed_polls: u32,
    ) -> Result<Option<AlertEvent>> {
        if self
            .repo
            .unresolved_alert_for_category(device.id, AlertCategory::Offline, None)
            .await?
            .is_some()
        {
            return Ok(None);
        }
        if self.in_maintenance(device).await? {
            debug!(device_key = %device.device_key, "offline alert suppressed by maintenance window");
            return Ok(None);
        }

        let alert = self
            .repo
            .insert_alert(NewAlertEvent {
                device_id: device.id,
                rule_id: None,
                metric: None,
                severity: Severity::High,
                category: AlertCategory::Offline,
                message: format!("device unreachable after {failed_polls} consecutive failed polls"),
                value_at_trigger: None,
            })
            .await?;
        info!(device_key = %device.device_key, alert_id = %alert.id, "offline alert opened");
        self.emit("alert.triggered", device, &alert).await;
        Ok(Some(alert))
    }

    /// Resolve the device's offline event, if one is open. Called when a
    /// poll succeeds again.
    pub async fn auto_resolve_offline_alert(&self, device: &Device) -> Result<Option<AlertEvent>> {
        let Some(open) = self
            .repo
            .unresolved_alert_for_category(device.id, AlertCategory::Offline, None)
            .await?
        else {
            return Ok(None);
        };

        let resolved = self
            .repo
            .resolve_alert(open.id, Some("device back online"))
            .await?;
        info!(device_key = %device.device_key, alert_id = %resolved.id, "offline alert resolved");
        self.emit("alert.resolved", device, &resolved).await;
        Ok(Some(resolved))
    }

    /// Open an anomaly event for one metric. Idempotent per (device, metric)
    /// while unresolved; suppressed during maintenance.
    #[allow(clippy::too_many_arguments)]
    pub async fn raise_anomaly_alert(
        &self,
        device: &Device,
        metric: &str,
        value: f64,
        z_score: f64,
        mean: f64,
        stddev: f64,
        severity: Severity,
    ) -> Result<Option<AlertEvent>> {
        if self
            .repo
            .unresolved_alert_for_category(device.id, AlertCategory::Anomaly, Some(metric))
            .await?
            .is_some()
        {
            return Ok(None);
        }
        if self.in_maintenance(device).await? {
            debug!(
                device_key = %device.device_key,
                metric = %metric,
                "anomaly alert suppressed by maintenance window"
            );
            return Ok(None);
        }

        let alert = self
            .repo
            .insert_alert(NewAlertEvent {
                device_id: device.id,
                rule_id: None,
                metric: Some(metric.to_owned()),
                severity,
                category: AlertCategory::Anomaly,
                message: format!(
                    "anomalous {metric} reading {value}: z-score {z_score:.2} \
                     (window mean {mean:.2}, stddev {stddev:.2})"
                ),
                value_at_trigger: Some(value),
            })
            .await?;
        info!(
            device_key = %device.device_key,
            alert_id = %alert.id,
            metric = %metric,
            z_score,
            "anomaly alert opened"
        );
        self.emit("alert.triggered", device, &alert).await;
        Ok(Some(alert))
    }

    /// Acknowledge an open event on behalf of `by`.
    pub async fn acknowledge(&self, id: uuid::Uuid, by: &str) -> Result<AlertEvent> {
        let alert = self.repo.acknowledge_alert(id, by).await?;
        self.audit_action(by, "alert.acknowledged", &alert).await;
        Ok(alert)
    }

    /// Resolve an event manually, auto-acknowledging it first when needed.
    pub async fn resolve(
        &self,
        id: uuid::Uuid,
        comment: Option<&str>,
        actor: &str,
    ) -> Result<AlertEvent> {
        let alert = self.repo.resolve_alert(id, comment).await?;
        self.audit_action(actor, "alert.resolved", &alert).await;
        if let Some(device) = self.repo.get_device(alert.device_id).await? {
            self.notify_webhooks("alert.resolved", &device, &alert).await;
        }
        Ok(alert)
    }

    async fn in_maintenance(&self, device: &Device) -> Result<bool> {
        Ok(self
            .repo
            .active_maintenance_window(device.id, Utc::now())
            .await?
            .is_some())
    }

    async fn in_cooldown(&self, device: &Device, rule: &AlertRule) -> Result<bool> {
        if rule.cooldown_minutes <= 0 {
            return Ok(false);
        }
        let Some(resolved_at) = self
            .repo
            .last_resolved_at_for_rule(device.id, rule.id)
            .await?
        else {
            return Ok(false);
        };
        Ok(Utc::now() - resolved_at < Duration::minutes(rule.cooldown_minutes))
    }

    /// Audit + webhook fan-out for a pipeline-driven transition. Both legs
    /// are best-effort.
    async fn emit(&self, event: &str, device: &Device, alert: &AlertEvent) {
        self.audit_action("system", event, alert).await;
        self.notify_webhooks(event, device, alert).await;
    }

    async fn audit_action(&self, actor: &str, action: &str, alert: &AlertEvent) {
        let details = serde_json::json!({
            "device_id": alert.device_id,
            "category": alert.category,
            "severity": alert.severity,
            "message": &alert.message,
        });
        if let Err(e) = self
            .audit
            .log_action(actor, action, "alert", &alert.id.to_string(), details)
            .await
        {
            warn!(alert_id = %alert.id, action = %action, error = %e, "audit write failed");
        }
    }

    async fn notify_webhooks(&self, event: &str, device: &Device, alert: &AlertEvent) {
        let subscriptions = match self.repo.active_webhooks().await {
            Ok(subs) => subs,
            Err(e) => {
                warn!(error = %e, "failed to load webhook subscriptions");
                return;
            }
        };
        if subscriptions.is_empty() {
            return;
        }
        let payload = serde_json::json!({
            "event": event,
            "device_id": device.id,
            "device_key": &device.device_key,
            "alert": alert,
        });
        self.notifier.dispatch(&subscriptions, event, &payload).await;
    }
}
