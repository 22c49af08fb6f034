use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::alerts::AlertEngine;
use crate::db::models::{Device, NewReading};
use crate::errors::CoreError;
use crate::realtime::protocol::ServerMessage;
use crate::realtime::FanoutHub;
use crate::repo::DeviceRepository;
use crate::scoring::ScoringEngine;
use crate::upstream::models::NormalizedReading;

/// Topic the ingestion pipeline publishes `TELEMETRY_UPDATE` frames to.
pub const TELEMETRY_TOPIC: &str = "telemetry";

/// What one ingested batch produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub readings_stored: usize,
}

/// Central ingestion pipeline: persist readings, evaluate alert rules,
/// rescore the device, and announce the batch to realtime subscribers.
///
/// Both the HTTP ingest endpoint and the polling orchestrator feed through
/// here, so the downstream effects are identical regardless of how a batch
/// arrived. Alerting and scoring are fault-isolated: a failure in either is
/// logged and never voids the stored readings.
pub struct IngestService {
    repo: Arc<dyn DeviceRepository>,
    alerts: AlertEngine,
    scoring: ScoringEngine,
    hub: FanoutHub,
}

impl IngestService {
    pub fn new(
        repo: Arc<dyn DeviceRepository>,
        alerts: AlertEngine,
        scoring: ScoringEngine,
        hub: FanoutHub,
    ) -> Self {
        Self {
            repo,
            alerts,
            scoring,
            hub,
        }
    }

    /// Ingest a batch for a device addressed by row ID.
    pub async fn process_readings(
        &self,
        device_id: Uuid,
        batch: &[NormalizedReading],
    ) -> Result<IngestSummary> {
        let device = self
            .repo
            .get_device(device_id)
            .await?
            .ok_or_else(|| CoreError::DeviceNotFound(device_id.to_string()))?;
        self.process_for_device(&device, batch).await
    }

    /// Ingest a batch for a device addressed by its external key.
    pub async fn process_by_key(
        &self,
        device_key: &str,
        batch: &[NormalizedReading],
    ) -> Result<IngestSummary> {
        let device = self
            .repo
            .get_device_by_key(device_key)
            .await?
            .ok_or_else(|| CoreError::DeviceNotFound(device_key.to_owned()))?;
        self.process_for_device(&device, batch).await
    }

    async fn process_for_device(
        &self,
        device: &Device,
        batch: &[NormalizedReading],
    ) -> Result<IngestSummary> {
        let mut stored = 0;
        for reading in batch {
            for (field, &value) in &reading.fields {
                // Non-finite values cannot come off the wire as JSON, but a
                // caller-built batch could carry them.
                if !value.is_finite() {
                    debug!(
                        device_key = %device.device_key,
                        field = %field,
                        "skipping non-finite reading value"
                    );
                    continue;
                }
                self.repo
                    .insert_reading(&NewReading {
                        device_id: device.id,
                        field: field.clone(),
                        value,
                        recorded_at: reading.recorded_at,
                        raw: Some(reading.raw.clone()),
                    })
                    .await?;
                stored += 1;
            }
        }

        // Rules and scores run against the most recent sample of the batch.
        if let Some(latest) = batch.last() {
            if let Err(e) = self.alerts.evaluate(device, &latest.fields).await {
                warn!(device_key = %device.device_key, error = %e, "alert evaluation failed");
            }
            if let Err(e) = self
                .scoring
                .score_batch(device, &latest.fields, &self.alerts)
                .await
            {
                warn!(device_key = %device.device_key, error = %e, "device scoring failed");
            }
        }

        if stored > 0 {
            self.hub
                .broadcast(
                    ServerMessage::TelemetryUpdate {
                        node_id: device.id,
                        readings_count: stored,
                    },
                    Some(TELEMETRY_TOPIC),
                )
                .await;
        }

        Ok(IngestSummary {
            readings_stored: stored,
        })
    }
}
