use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::alerts::AlertEngine;
use crate::config::Config;
use crate::db::models::{Device, DeviceStatePatch, DeviceStatus, Severity};
use crate::repo::DeviceRepository;

/// Samples required per (device, metric) before z-scores are meaningful.
const LEARNING_MIN_SAMPLES: usize = 10;

// ---------------------------------------------------------------------------
// Pure scores
// ---------------------------------------------------------------------------

/// Operational soundness estimate in `[0, 1]`.
///
/// Starts at 1.0 and applies three independent penalties: data freshness
/// (−0.4 / −0.2 / −0.1 past 30 / 10 / 5 minutes; a device that has never
/// reported takes the worst tier), unresolved alert load (−0.3 for three or
/// more, −0.15 for one or two), and connectivity status (−0.3 offline,
/// −0.15 alert).
pub fn health_score(
    last_seen: Option<DateTime<Utc>>,
    unresolved_alerts: usize,
    status: DeviceStatus,
    now: DateTime<Utc>,
) -> f64 {
    let mut score: f64 = 1.0;

    score -= match last_seen {
        None => 0.4,
        Some(at) => {
            let age = now - at;
            if age > Duration::minutes(30) {
                0.4
            } else if age > Duration::minutes(10) {
                0.2
            } else if age > Duration::minutes(5) {
                0.1
            } else {
                0.0
            }
        }
    };

    score -= match unresolved_alerts {
        0 => 0.0,
        1 | 2 => 0.15,
        _ => 0.3,
    };

    score -= match status {
        DeviceStatus::Offline => 0.3,
        DeviceStatus::Alert => 0.15,
        _ => 0.0,
    };

    score.clamp(0.0, 1.0)
}

/// How much data backs the health score: observed readings over the last 24
/// hours against the count the polling interval predicts, capped at 1.
pub fn confidence_score(readings_24h: i64, expected_per_day: f64) -> f64 {
    if expected_per_day <= 0.0 {
        return 1.0;
    }
    (readings_24h.max(0) as f64 / expected_per_day).clamp(0.0, 1.0)
}

// ---------------------------------------------------------------------------
// Anomaly detection
// ---------------------------------------------------------------------------

/// Classification of one observed value against its metric's window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Verdict {
    /// Not enough history yet; the value is recorded but not scored.
    Learning,
    Normal {
        z: f64,
    },
    Anomalous {
        z: f64,
        mean: f64,
        stddev: f64,
        severity: Severity,
    },
}

/// Sliding-window z-score detector, one window per (device, metric).
///
/// The incoming value is classified against the existing window first and
/// pushed afterwards, so a single extreme outlier cannot dilute the
/// statistics it is judged by.
pub struct AnomalyDetector {
    window_size: usize,
    z_threshold: f64,
    windows: HashMap<(Uuid, String), VecDeque<f64>>,
}

impl AnomalyDetector {
    pub fn new(window_size: usize, z_threshold: f64) -> Self {
        Self {
            window_size,
            z_threshold,
            windows: HashMap::new(),
        }
    }

    pub fn observe(&mut self, device_id: Uuid, metric: &str, value: f64) -> Verdict {
        let z_threshold = self.z_threshold;
        let window = self
            .windows
            .entry((device_id, metric.to_owned()))
            .or_default();

        let verdict = if window.len() < LEARNING_MIN_SAMPLES {
            Verdict::Learning
        } else {
            let n = window.len() as f64;
            let mean = window.iter().sum::<f64>() / n;
            // Sample variance (n − 1): the window is a sample of the
            // metric's process, not the whole population.
            let variance =
                window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
            let stddev = variance.sqrt();
            // A flat window carries no spread to measure against.
            let z = if stddev == 0.0 {
                0.0
            } else {
                (value - mean).abs() / stddev
            };

            if z >= z_threshold {
                Verdict::Anomalous {
                    z,
                    mean,
                    stddev,
                    severity: Self::severity_for(z, z_threshold),
                }
            } else {
                Verdict::Normal { z }
            }
        };

        window.push_back(value);
        if window.len() > self.window_size {
            window.pop_front();
        }
        verdict
    }

    fn severity_for(z: f64, z_threshold: f64) -> Severity {
        if z >= 2.0 * z_threshold {
            Severity::High
        } else if z >= 1.5 * z_threshold {
            Severity::Medium
        } else {
            Severity::Low
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Recomputes a device's derived state after every ingested batch: health,
/// confidence, and the batch's worst z-score, plus a direct anomaly alert
/// when a value lands above the hard ceiling.
pub struct ScoringEngine {
    repo: Arc<dyn DeviceRepository>,
    detector: Mutex<AnomalyDetector>,
    expected_per_day: f64,
    alert_ceiling: f64,
}

impl ScoringEngine {
    pub fn new(repo: Arc<dyn DeviceRepository>, config: &Config) -> Self {
        Self {
            repo,
            detector: Mutex::new(AnomalyDetector::new(
                config.anomaly_window_size,
                config.anomaly_z_threshold,
            )),
            expected_per_day: config.expected_readings_per_day(),
            alert_ceiling: config.anomaly_alert_ceiling,
        }
    }

    /// Score one ingested batch and upsert the device's state row.
    pub async fn score_batch(
        &self,
        device: &Device,
        fields: &BTreeMap<String, f64>,
        alerts: &AlertEngine,
    ) -> Result<()> {
        let now = Utc::now();

        // Classify under the lock, act on the verdicts after releasing it.
        let verdicts: Vec<(String, f64, Verdict)> = {
            let mut detector = self.detector.lock().await;
            fields
                .iter()
                .map(|(metric, &value)| {
                    (metric.clone(), value, detector.observe(device.id, metric, value))
                })
                .collect()
        };

        let mut worst_z: Option<f64> = None;
        for (metric, value, verdict) in verdicts {
            let z = match verdict {
                Verdict::Learning => continue,
                Verdict::Normal { z } => z,
                Verdict::Anomalous {
                    z,
                    mean,
                    stddev,
                    severity,
                } => {
                    debug!(
                        device_key = %device.device_key,
                        metric = %metric,
                        value,
                        z,
                        "anomalous reading"
                    );
                    if z > self.alert_ceiling {
                        alerts
                            .raise_anomaly_alert(device, &metric, value, z, mean, stddev, severity)
                            .await?;
                    }
                    z
                }
            };
            worst_z = Some(worst_z.map_or(z, |w| w.max(z)));
        }

        let readings_24h = self
            .repo
            .count_readings_since(device.id, now - Duration::hours(24))
            .await?;
        let unresolved = self.repo.unresolved_alerts(device.id).await?.len();

        self.repo
            .update_device_state(
                device.id,
                DeviceStatePatch {
                    current_value: fields.first_key_value().map(|(_, &v)| v),
                    current_status: Some(device.status),
                    health_score: Some(health_score(Some(now), unresolved, device.status, now)),
                    confidence_score: Some(confidence_score(readings_24h, self.expected_per_day)),
                    anomaly_score: Some(worst_z),
                    last_reading_at: Some(now),
                    readings_24h: Some(readings_24h),
                },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::Notifier;
    use crate::config::test_config;
    use crate::db::models::AlertCategory;
    use crate::repo::memory::fixtures::device;
    use crate::repo::memory::MemoryRepository;

    // -- health score -------------------------------------------------------

    #[test]
    fn healthy_device_scores_one() {
        let now = Utc::now();
        assert_eq!(health_score(Some(now), 0, DeviceStatus::Online, now), 1.0);
    }

    #[test]
    fn penalties_stack_across_dimensions() {
        let now = Utc::now();
        let seen = Some(now - Duration::minutes(12));
        // 1.0 − 0.2 (staleness) − 0.15 (one alert) − 0.15 (alert status)
        let score = health_score(seen, 1, DeviceStatus::Alert, now);
        assert!((score - 0.5).abs() < 1e-9);
    }

    #[test]
    fn freshness_tiers() {
        let now = Utc::now();
        let at = |minutes: i64| Some(now - Duration::minutes(minutes));
        assert_eq!(health_score(at(4), 0, DeviceStatus::Online, now), 1.0);
        assert_eq!(health_score(at(6), 0, DeviceStatus::Online, now), 0.9);
        assert_eq!(health_score(at(11), 0, DeviceStatus::Online, now), 0.8);
        assert_eq!(health_score(at(31), 0, DeviceStatus::Online, now), 0.6);
        assert_eq!(health_score(None, 0, DeviceStatus::Online, now), 0.6);
    }

    #[test]
    fn score_never_leaves_unit_interval() {
        let now = Utc::now();
        let worst = health_score(None, 10, DeviceStatus::Offline, now);
        assert_eq!(worst, 0.0);
        assert!(worst >= 0.0);
    }

    // -- confidence ---------------------------------------------------------

    #[test]
    fn confidence_is_capped_at_one() {
        assert_eq!(confidence_score(720, 1440.0), 0.5);
        assert_eq!(confidence_score(2000, 1440.0), 1.0);
        assert_eq!(confidence_score(0, 1440.0), 0.0);
        assert_eq!(confidence_score(-5, 1440.0), 0.0);
    }

    // -- anomaly detector ---------------------------------------------------

    #[test]
    fn detector_learns_before_scoring() {
        let mut det = AnomalyDetector::new(200, 2.5);
        let dev = Uuid::new_v4();

        for i in 0..LEARNING_MIN_SAMPLES {
            assert_eq!(
                det.observe(dev, "temperature", 50.0 + i as f64),
                Verdict::Learning,
                "sample {i} should still be learning"
            );
        }
        assert!(matches!(
            det.observe(dev, "temperature", 55.0),
            Verdict::Normal { .. }
        ));
    }

    #[test]
    fn flat_window_scores_zero() {
        let mut det = AnomalyDetector::new(200, 2.5);
        let dev = Uuid::new_v4();
        for _ in 0..10 {
            det.observe(dev, "temperature", 50.0);
        }
        // stddev is 0; even a wild value gets z = 0 rather than infinity
        assert_eq!(
            det.observe(dev, "temperature", 500.0),
            Verdict::Normal { z: 0.0 }
        );
    }

    /// Window alternating 40/60 has mean 50 and sample stddev
    /// `sqrt(1000/9)` ≈ 10.541.
    fn seeded_detector(dev: Uuid) -> AnomalyDetector {
        let mut det = AnomalyDetector::new(200, 2.5);
        for i in 0..10 {
            det.observe(dev, "temperature", if i % 2 == 0 { 40.0 } else { 60.0 });
        }
        det
    }

    const SEEDED_STDDEV: f64 = 10.540925533894598;

    #[test]
    fn window_spread_uses_sample_stddev() {
        let dev = Uuid::new_v4();
        let mut det = seeded_detector(dev);

        // 76.0 sits at z ≈ 2.47 against the sample stddev; the population
        // formula (divide by n) would put it at 2.6, past the threshold.
        match det.observe(dev, "temperature", 76.0) {
            Verdict::Normal { z } => assert!((z - 26.0 / SEEDED_STDDEV).abs() < 1e-9),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn severity_scales_with_z() {
        let dev = Uuid::new_v4();

        let mut det = seeded_detector(dev);
        match det.observe(dev, "temperature", 77.0) {
            // z ≈ 2.56, just past the threshold
            Verdict::Anomalous { severity, .. } => assert_eq!(severity, Severity::Low),
            other => panic!("unexpected verdict: {other:?}"),
        }

        let mut det = seeded_detector(dev);
        match det.observe(dev, "temperature", 90.0) {
            // z ≈ 3.79, past 1.5× threshold
            Verdict::Anomalous { severity, .. } => assert_eq!(severity, Severity::Medium),
            other => panic!("unexpected verdict: {other:?}"),
        }

        let mut det = seeded_detector(dev);
        match det.observe(dev, "temperature", 105.0) {
            // z ≈ 5.22, past 2× threshold
            Verdict::Anomalous { severity, .. } => assert_eq!(severity, Severity::High),
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn outlier_is_judged_before_it_joins_the_window() {
        let dev = Uuid::new_v4();
        let mut det = seeded_detector(dev);

        match det.observe(dev, "temperature", 105.0) {
            Verdict::Anomalous { mean, stddev, .. } => {
                // Statistics come from the pre-outlier window.
                assert!((mean - 50.0).abs() < 1e-9);
                assert!((stddev - SEEDED_STDDEV).abs() < 1e-9);
            }
            other => panic!("unexpected verdict: {other:?}"),
        }
    }

    #[test]
    fn windows_are_isolated_per_metric_and_device() {
        let mut det = AnomalyDetector::new(200, 2.5);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        for _ in 0..10 {
            det.observe(a, "temperature", 50.0);
        }
        // Other device and other metric are still learning.
        assert_eq!(det.observe(b, "temperature", 50.0), Verdict::Learning);
        assert_eq!(det.observe(a, "humidity", 50.0), Verdict::Learning);
    }

    #[test]
    fn window_evicts_oldest_beyond_capacity() {
        let mut det = AnomalyDetector::new(12, 2.5);
        let dev = Uuid::new_v4();
        for i in 0..40 {
            det.observe(dev, "temperature", i as f64);
        }
        let window = det.windows.get(&(dev, "temperature".to_owned())).unwrap();
        assert_eq!(window.len(), 12);
        assert_eq!(*window.front().unwrap(), 28.0);
    }

    // -- engine -------------------------------------------------------------

    fn alert_engine(repo: &Arc<MemoryRepository>) -> AlertEngine {
        AlertEngine::new(repo.clone(), repo.clone(), Notifier::new().unwrap())
    }

    #[tokio::test]
    async fn score_batch_upserts_state() {
        let repo = Arc::new(MemoryRepository::new());
        let dev = device("gw-1", DeviceStatus::Online);
        repo.add_device(dev.clone()).await;
        let engine = ScoringEngine::new(repo.clone(), &test_config());
        let alerts = alert_engine(&repo);

        let fields = BTreeMap::from([("humidity".to_owned(), 40.0), ("temperature".to_owned(), 22.5)]);
        engine.score_batch(&dev, &fields, &alerts).await.unwrap();

        let state = repo.get_or_create_device_state(dev.id).await.unwrap();
        // First key in lexicographic order wins.
        assert_eq!(state.current_value, Some(40.0));
        assert_eq!(state.health_score, 1.0);
        assert!(state.anomaly_score.is_none(), "warm-up leaves no z-score");
        assert!(state.last_reading_at.is_some());
    }

    #[tokio::test]
    async fn ceiling_breach_raises_anomaly_alert() {
        let repo = Arc::new(MemoryRepository::new());
        let dev = device("gw-1", DeviceStatus::Online);
        repo.add_device(dev.clone()).await;
        let engine = ScoringEngine::new(repo.clone(), &test_config());
        let alerts = alert_engine(&repo);

        // Warm the window up: mean 50, sample stddev ≈ 10.54.
        for i in 0..10 {
            let v = if i % 2 == 0 { 40.0 } else { 60.0 };
            let fields = BTreeMap::from([("temperature".to_owned(), v)]);
            engine.score_batch(&dev, &fields, &alerts).await.unwrap();
        }

        // z ≈ 4.27: past the 3.0 ceiling.
        let fields = BTreeMap::from([("temperature".to_owned(), 95.0)]);
        engine.score_batch(&dev, &fields, &alerts).await.unwrap();

        let open = repo.unresolved_alerts(dev.id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].category, AlertCategory::Anomaly);
        assert_eq!(open[0].metric.as_deref(), Some("temperature"));
        assert!(open[0].message.contains("z-score 4.27"));

        let state = repo.get_or_create_device_state(dev.id).await.unwrap();
        let z = state.anomaly_score.unwrap();
        assert!((z - 45.0 / SEEDED_STDDEV).abs() < 1e-9);
    }

    #[tokio::test]
    async fn flagged_but_below_ceiling_scores_without_alerting() {
        let repo = Arc::new(MemoryRepository::new());
        let dev = device("gw-1", DeviceStatus::Online);
        repo.add_device(dev.clone()).await;
        let engine = ScoringEngine::new(repo.clone(), &test_config());
        let alerts = alert_engine(&repo);

        for i in 0..10 {
            let v = if i % 2 == 0 { 40.0 } else { 60.0 };
            let fields = BTreeMap::from([("temperature".to_owned(), v)]);
            engine.score_batch(&dev, &fields, &alerts).await.unwrap();
        }

        // z ≈ 2.66: anomalous, but under the 3.0 alert ceiling.
        let fields = BTreeMap::from([("temperature".to_owned(), 78.0)]);
        engine.score_batch(&dev, &fields, &alerts).await.unwrap();

        assert!(repo.unresolved_alerts(dev.id).await.unwrap().is_empty());
        let state = repo.get_or_create_device_state(dev.id).await.unwrap();
        let z = state.anomaly_score.unwrap();
        assert!((z - 28.0 / SEEDED_STDDEV).abs() < 1e-9);
    }
}
