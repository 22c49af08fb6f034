use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::upstream::models::NormalizedReading;

/// Request body for `POST /ingest`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestRequest {
    /// External device key the batch belongs to.
    pub device_key: String,
    pub readings: Vec<IngestReading>,
}

/// One observation inside an ingest batch.
#[derive(Debug, Deserialize, ToSchema)]
pub struct IngestReading {
    pub field: String,
    pub value: f64,
    /// RFC3339 capture time; defaults to the server clock when absent.
    pub timestamp: Option<DateTime<Utc>>,
}

impl IngestRequest {
    /// Group the flat observation list into per-timestamp samples, ordered
    /// oldest first. Untimestamped observations share one "now" sample, so
    /// a typical `[{field1},{field2}]` payload evaluates as a single
    /// multi-field sample.
    pub fn into_readings(self) -> Vec<NormalizedReading> {
        let now = Utc::now();
        let mut grouped: BTreeMap<DateTime<Utc>, BTreeMap<String, f64>> = BTreeMap::new();
        for r in self.readings {
            grouped
                .entry(r.timestamp.unwrap_or(now))
                .or_default()
                .insert(r.field, r.value);
        }
        grouped
            .into_iter()
            .map(|(recorded_at, fields)| NormalizedReading {
                raw: serde_json::json!({ "source": "ingest", "fields": &fields }),
                fields,
                recorded_at,
            })
            .collect()
    }
}

/// Response body for `POST /ingest` and `POST /devices/{id}/backfill`.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct IngestResponse {
    pub readings_stored: usize,
}

/// Request body for `POST /alerts/{id}/acknowledge`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct AcknowledgeRequest {
    /// Who is acknowledging, e.g. an operator handle.
    pub by: String,
}

/// Request body for `POST /alerts/{id}/resolve`.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct ResolveRequest {
    pub comment: Option<String>,
    /// Defaults to `"api"` when absent.
    pub by: Option<String>,
}

/// Request body for `POST /devices/{id}/backfill`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct BackfillRequest {
    /// How far back to pull history, in days.
    pub days: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untimestamped_observations_merge_into_one_sample() {
        let req: IngestRequest = serde_json::from_value(serde_json::json!({
            "device_key": "gw-1",
            "readings": [
                { "field": "temperature", "value": 21.5 },
                { "field": "humidity", "value": 40.0 },
            ]
        }))
        .unwrap();

        let readings = req.into_readings();

        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].fields["temperature"], 21.5);
        assert_eq!(readings[0].fields["humidity"], 40.0);
    }

    #[test]
    fn timestamped_observations_stay_ordered_oldest_first() {
        let req: IngestRequest = serde_json::from_value(serde_json::json!({
            "device_key": "gw-1",
            "readings": [
                { "field": "temperature", "value": 23.0, "timestamp": "2026-08-02T10:00:00Z" },
                { "field": "temperature", "value": 21.0, "timestamp": "2026-08-01T10:00:00Z" },
            ]
        }))
        .unwrap();

        let readings = req.into_readings();

        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].fields["temperature"], 21.0);
        assert_eq!(readings[1].fields["temperature"], 23.0);
    }
}
