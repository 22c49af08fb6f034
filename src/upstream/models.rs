use std::collections::BTreeMap;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Deserialize;

// ---------------------------------------------------------------------------
// Generic response envelope
//
// Every provider endpoint wraps its payload in the same outer object:
//
// Success:
//   { "success": true, "result": <T>, "request_id": "..." }
//
// Failure:
//   { "success": false, "code": 2009, "msg": "...", "request_id": "..." }
//
// `result` is absent on failure; `code` and `msg` are absent on success.
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ProviderResponse<T> {
    /// `true` on success, `false` on API-level failure.
    pub success: bool,

    /// Server-side request trace ID — useful for support queries.
    pub request_id: Option<String>,

    /// Present on success.
    pub result: Option<T>,

    /// Provider error code — present on failure.
    pub code: Option<i32>,

    /// Human-readable error message — present on failure.
    pub msg: Option<String>,
}

impl<T> ProviderResponse<T> {
    /// Convert into `anyhow::Result<T>`, mapping API-level failures to errors.
    pub fn into_result(self) -> anyhow::Result<T> {
        if self.success {
            self.result
                .ok_or_else(|| anyhow!("provider response: success=true but result is missing"))
        } else {
            Err(anyhow!(
                "provider API error: code={}, msg={}",
                self.code.unwrap_or(-1),
                self.msg.as_deref().unwrap_or("(no message)")
            ))
        }
    }
}

/// Full response type for `GET /v1/devices/{key}/latest`.
pub type LatestResponse = ProviderResponse<Option<ProviderSample>>;

/// Full response type for `GET /v1/devices/{key}/history?days=N`.
pub type HistoryResponse = ProviderResponse<Vec<ProviderSample>>;

/// One raw sample as returned by the provider: a free-form metric map plus
/// an optional capture timestamp.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderSample {
    /// Provider field name → raw JSON value. Numbers and booleans are
    /// meaningful; anything else is dropped during normalization.
    pub metrics: BTreeMap<String, serde_json::Value>,

    /// When the provider sampled the device; falls back to "now" when
    /// absent.
    pub captured_at: Option<DateTime<Utc>>,
}

/// One normalized sample: canonical metric names mapped to plain numbers,
/// with the raw provider payload retained for storage.
#[derive(Debug, Clone)]
pub struct NormalizedReading {
    pub fields: BTreeMap<String, f64>,
    pub recorded_at: DateTime<Utc>,
    pub raw: serde_json::Value,
}

/// Normalize a raw sample through a per-device field mapping. Mapped fields
/// are renamed; unmapped fields pass through verbatim. Non-numeric values
/// are dropped (booleans encode as 0/1).
pub fn normalize(sample: &ProviderSample, field_map: &BTreeMap<String, String>) -> NormalizedReading {
    let mut fields = BTreeMap::new();
    for (name, value) in &sample.metrics {
        let canonical = field_map.get(name).unwrap_or(name);
        let numeric = match value {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::Bool(b) => Some(*b as i64 as f64),
            _ => None,
        };
        if let Some(v) = numeric {
            fields.insert(canonical.clone(), v);
        }
    }
    NormalizedReading {
        fields,
        recorded_at: sample.captured_at.unwrap_or_else(Utc::now),
        raw: serde_json::json!({ "metrics": &sample.metrics, "captured_at": sample.captured_at }),
    }
}

/// Parse a device's stored `field_map` JSON object into a string map.
/// Non-string values are ignored.
pub fn parse_field_map(value: &serde_json::Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(json: serde_json::Value) -> ProviderSample {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn into_result_success() {
        let resp: ProviderResponse<i64> = serde_json::from_str(
            r#"{"success":true,"result":7,"request_id":"abc"}"#,
        )
        .unwrap();
        assert_eq!(resp.into_result().unwrap(), 7);
    }

    #[test]
    fn into_result_failure_carries_code_and_msg() {
        let resp: ProviderResponse<i64> =
            serde_json::from_str(r#"{"success":false,"code":2009,"msg":"device offline"}"#)
                .unwrap();
        let err = resp.into_result().unwrap_err().to_string();
        assert!(err.contains("2009"));
        assert!(err.contains("device offline"));
    }

    #[test]
    fn normalize_maps_and_passes_through() {
        let s = sample(serde_json::json!({
            "metrics": { "temp_c": 21.5, "sig": -67, "fw": "1.2.0" },
            "captured_at": "2026-08-01T12:00:00Z"
        }));
        let mut map = BTreeMap::new();
        map.insert("temp_c".to_owned(), "temperature".to_owned());

        let n = normalize(&s, &map);

        assert_eq!(n.fields["temperature"], 21.5);
        // Unmapped numeric field passes through under its own name.
        assert_eq!(n.fields["sig"], -67.0);
        // Non-numeric field is dropped.
        assert!(!n.fields.contains_key("fw"));
    }

    #[test]
    fn normalize_encodes_booleans() {
        let s = sample(serde_json::json!({ "metrics": { "relay": true } }));
        let n = normalize(&s, &BTreeMap::new());
        assert_eq!(n.fields["relay"], 1.0);
    }

    #[test]
    fn parse_field_map_ignores_non_strings() {
        let map = parse_field_map(&serde_json::json!({ "a": "x", "b": 3 }));
        assert_eq!(map.len(), 1);
        assert_eq!(map["a"], "x");
    }
}
