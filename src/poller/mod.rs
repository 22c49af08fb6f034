use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::AlertEngine;
use crate::cache::CacheBackend;
use crate::config::Config;
use crate::db::models::{Device, DeviceStatus};
use crate::ingest::IngestService;
use crate::realtime::protocol::{ServerMessage, StatusUpdate};
use crate::realtime::FanoutHub;
use crate::repo::DeviceRepository;
use crate::upstream::models::NormalizedReading;
use crate::upstream::Upstream;

/// Cache key namespaces a polling cycle makes stale.
const INVALIDATED_PREFIXES: [&str; 2] = ["nodes:", "telemetry:"];

/// Periodic polling orchestrator.
///
/// Every cycle fetches the latest sample for each pollable device with
/// bounded concurrency, feeds successes through the ingestion pipeline, and
/// tracks consecutive failures per device: once the threshold is crossed the
/// device flips offline and a synthetic offline alert opens. Status changes
/// are announced in a single batched frame at the end of the cycle, and the
/// device/telemetry cache namespaces are invalidated once, not per device.
pub struct Orchestrator {
    repo: Arc<dyn DeviceRepository>,
    upstream: Arc<dyn Upstream>,
    ingest: Arc<IngestService>,
    alerts: AlertEngine,
    hub: FanoutHub,
    cache: Arc<dyn CacheBackend>,
    failure_counts: Mutex<HashMap<Uuid, u32>>,
    config: Config,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Arc<dyn DeviceRepository>,
        upstream: Arc<dyn Upstream>,
        ingest: Arc<IngestService>,
        alerts: AlertEngine,
        hub: FanoutHub,
        cache: Arc<dyn CacheBackend>,
        config: Config,
    ) -> Self {
        Self {
            repo,
            upstream,
            ingest,
            alerts,
            hub,
            cache,
            failure_counts: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Polling loop; a failed cycle is logged and the next tick proceeds.
    pub async fn run(self: Arc<Self>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.poll_interval_secs));
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_cycle().await {
                error!(error = %e, "polling cycle failed");
            }
        }
    }

    /// One full polling cycle over every pollable device.
    pub async fn run_cycle(&self) -> Result<()> {
        let devices = self.repo.list_pollable_devices().await?;
        if devices.is_empty() {
            return Ok(());
        }
        debug!(devices = devices.len(), "polling cycle started");

        // Fetch phase: bounded concurrency against the upstream.
        let semaphore = Arc::new(Semaphore::new(self.config.poll_concurrency.max(1)));
        let mut fetches: JoinSet<(Device, Option<NormalizedReading>)> = JoinSet::new();
        for device in devices {
            let semaphore = semaphore.clone();
            let upstream = self.upstream.clone();
            fetches.spawn(async move {
                // The semaphore is never closed, so acquisition cannot fail.
                let _permit = semaphore.acquire_owned().await.ok();
                let reading = upstream.fetch_latest(&device).await;
                (device, reading)
            });
        }

        let mut status_changes: Vec<StatusUpdate> = Vec::new();
        while let Some(joined) = fetches.join_next().await {
            let (device, reading) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "poll task panicked");
                    continue;
                }
            };

            // An empty sample carries nothing to ingest and counts as a miss.
            // One device's failed bookkeeping never aborts the rest of the
            // cycle: the error is logged and the loop moves on.
            let handled = match reading.filter(|r| !r.fields.is_empty()) {
                Some(reading) => self.handle_success(&device, reading).await,
                None => self.handle_failure(&device).await,
            };
            match handled {
                Ok(Some(update)) => status_changes.push(update),
                Ok(None) => {}
                Err(e) => {
                    warn!(device_key = %device.device_key, error = %e, "poll result handling failed");
                }
            }
        }

        if !status_changes.is_empty() {
            info!(changes = status_changes.len(), "device status changes this cycle");
            self.hub
                .broadcast(
                    ServerMessage::BatchStatusUpdate {
                        updates: status_changes,
                    },
                    None,
                )
                .await;
        }

        for prefix in INVALIDATED_PREFIXES {
            let dropped = self.cache.invalidate(prefix).await;
            if dropped > 0 {
                debug!(prefix = %prefix, dropped, "cache namespace invalidated");
            }
        }

        Ok(())
    }

    async fn handle_success(
        &self,
        device: &Device,
        reading: NormalizedReading,
    ) -> Result<Option<StatusUpdate>> {
        self.failure_counts.lock().await.remove(&device.id);

        let now = Utc::now();
        let flips_online = matches!(
            device.status,
            DeviceStatus::Offline | DeviceStatus::Provisioning
        );
        let status = if flips_online {
            DeviceStatus::Online
        } else {
            device.status
        };
        self.repo
            .update_device_status(device.id, status, Some(now))
            .await?;

        if let Err(e) = self.ingest.process_readings(device.id, &[reading]).await {
            warn!(device_key = %device.device_key, error = %e, "ingest of polled reading failed");
        }
        if let Err(e) = self.alerts.auto_resolve_offline_alert(device).await {
            warn!(device_key = %device.device_key, error = %e, "offline alert resolution failed");
        }

        if flips_online {
            info!(device_key = %device.device_key, "device back online");
            return Ok(Some(StatusUpdate {
                node_id: device.id,
                status: DeviceStatus::Online,
            }));
        }
        Ok(None)
    }

    async fn handle_failure(&self, device: &Device) -> Result<Option<StatusUpdate>> {
        let failures = {
            let mut counts = self.failure_counts.lock().await;
            let entry = counts.entry(device.id).or_insert(0);
            *entry += 1;
            *entry
        };
        debug!(device_key = %device.device_key, failures, "poll returned no data");

        if failures < self.config.offline_failure_threshold
            || device.status == DeviceStatus::Offline
        {
            return Ok(None);
        }

        self.repo
            .update_device_status(device.id, DeviceStatus::Offline, None)
            .await?;
        if let Err(e) = self.alerts.create_offline_alert(device, failures).await {
            warn!(device_key = %device.device_key, error = %e, "offline alert creation failed");
        }
        warn!(device_key = %device.device_key, failures, "device marked offline");

        Ok(Some(StatusUpdate {
            node_id: device.id,
            status: DeviceStatus::Offline,
        }))
    }

    /// Retention loop: prunes old readings, resolved alerts, and audit
    /// entries on a long interval.
    pub async fn run_cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(
            self.config.cleanup_interval_hours * 3600,
        ));
        loop {
            ticker.tick().await;
            let now = Utc::now();
            let result = self
                .repo
                .prune(
                    now - chrono::Duration::days(self.config.retention_readings_days),
                    now - chrono::Duration::days(self.config.retention_resolved_alerts_days),
                    now - chrono::Duration::days(self.config.retention_audit_days),
                )
                .await;
            match result {
                Ok(counts) => info!(
                    readings = counts.readings,
                    resolved_alerts = counts.resolved_alerts,
                    audit_entries = counts.audit_entries,
                    "retention cleanup finished"
                ),
                Err(e) => error!(error = %e, "retention cleanup failed"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;
    use chrono::DateTime;

    use super::*;
    use crate::alerts::Notifier;
    use crate::cache::local::LocalCache;
    use crate::config::test_config;
    use crate::db::models::{
        AlertCategory, AlertEvent, AlertRule, DeviceState, DeviceStatePatch, MaintenanceWindow,
        NewAlertEvent, NewReading, Reading, WebhookSubscription,
    };
    use crate::ingest::TELEMETRY_TOPIC;
    use crate::repo::memory::fixtures::device;
    use crate::repo::memory::MemoryRepository;
    use crate::repo::PruneCounts;
    use crate::scoring::ScoringEngine;

    /// Upstream stub: yields a fixed sample while `up`, nothing otherwise.
    struct ScriptedUpstream {
        up: AtomicBool,
    }

    impl ScriptedUpstream {
        fn new(up: bool) -> Self {
            Self {
                up: AtomicBool::new(up),
            }
        }

        fn set_up(&self, up: bool) {
            self.up.store(up, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Upstream for ScriptedUpstream {
        async fn fetch_latest(&self, _device: &Device) -> Option<NormalizedReading> {
            self.up.load(Ordering::SeqCst).then(|| NormalizedReading {
                fields: BTreeMap::from([("temperature".to_owned(), 21.5)]),
                recorded_at: Utc::now(),
                raw: serde_json::json!({}),
            })
        }

        async fn fetch_history(
            &self,
            _device: &Device,
            _window_days: u32,
        ) -> Vec<NormalizedReading> {
            Vec::new()
        }
    }

    struct Harness {
        repo: Arc<MemoryRepository>,
        upstream: Arc<ScriptedUpstream>,
        hub: FanoutHub,
        cache: Arc<LocalCache>,
        orchestrator: Orchestrator,
    }

    fn harness(up: bool) -> Harness {
        let repo = Arc::new(MemoryRepository::new());
        let upstream = Arc::new(ScriptedUpstream::new(up));
        let hub = FanoutHub::new(10, 10, Duration::from_secs(30));
        let cache = Arc::new(LocalCache::new());
        let cfg = test_config();

        let alerts = AlertEngine::new(repo.clone(), repo.clone(), Notifier::new().unwrap());
        let scoring = ScoringEngine::new(repo.clone(), &cfg);
        let ingest = Arc::new(IngestService::new(
            repo.clone(),
            alerts.clone(),
            scoring,
            hub.clone(),
        ));
        let orchestrator = Orchestrator::new(
            repo.clone(),
            upstream.clone(),
            ingest,
            alerts,
            hub.clone(),
            cache.clone(),
            cfg,
        );

        Harness {
            repo,
            upstream,
            hub,
            cache,
            orchestrator,
        }
    }

    #[tokio::test]
    async fn successful_poll_ingests_and_stamps_last_seen() {
        let h = harness(true);
        let dev = device("gw-1", DeviceStatus::Online);
        h.repo.add_device(dev.clone()).await;

        h.orchestrator.run_cycle().await.unwrap();

        assert_eq!(h.repo.reading_count().await, 1);
        let dev = h.repo.get_device(dev.id).await.unwrap().unwrap();
        assert!(dev.last_seen.is_some());
        assert_eq!(dev.status, DeviceStatus::Online);
    }

    #[tokio::test]
    async fn three_failed_cycles_flip_offline_with_one_alert() {
        let h = harness(false);
        let dev = device("gw-1", DeviceStatus::Online);
        h.repo.add_device(dev.clone()).await;

        for _ in 0..2 {
            h.orchestrator.run_cycle().await.unwrap();
            let current = h.repo.get_device(dev.id).await.unwrap().unwrap();
            assert_eq!(current.status, DeviceStatus::Online, "still under threshold");
        }

        h.orchestrator.run_cycle().await.unwrap();

        let current = h.repo.get_device(dev.id).await.unwrap().unwrap();
        assert_eq!(current.status, DeviceStatus::Offline);
        let open = h.repo.unresolved_alerts(dev.id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].category, AlertCategory::Offline);

        // Further failed cycles neither duplicate the alert nor re-announce.
        h.orchestrator.run_cycle().await.unwrap();
        assert_eq!(h.repo.unresolved_alerts(dev.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recovery_resolves_offline_alert_and_flips_online() {
        let h = harness(false);
        let dev = device("gw-1", DeviceStatus::Online);
        h.repo.add_device(dev.clone()).await;

        for _ in 0..3 {
            h.orchestrator.run_cycle().await.unwrap();
        }
        assert_eq!(
            h.repo.get_device(dev.id).await.unwrap().unwrap().status,
            DeviceStatus::Offline
        );

        h.upstream.set_up(true);
        h.orchestrator.run_cycle().await.unwrap();

        let current = h.repo.get_device(dev.id).await.unwrap().unwrap();
        assert_eq!(current.status, DeviceStatus::Online);
        assert!(h.repo.unresolved_alerts(dev.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn status_changes_are_batched_into_one_frame() {
        let h = harness(false);
        let a = device("gw-a", DeviceStatus::Online);
        let b = device("gw-b", DeviceStatus::Online);
        h.repo.add_device(a.clone()).await;
        h.repo.add_device(b.clone()).await;

        let (conn, mut rx) = h.hub.connect(None).await.unwrap();
        // Telemetry frames go to their own topic; status frames reach all.
        h.hub.subscribe(conn, TELEMETRY_TOPIC).await;

        for _ in 0..3 {
            h.orchestrator.run_cycle().await.unwrap();
        }

        match rx.recv().await.unwrap() {
            ServerMessage::BatchStatusUpdate { updates } => {
                assert_eq!(updates.len(), 2);
                assert!(updates.iter().all(|u| u.status == DeviceStatus::Offline));
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(rx.try_recv().is_err(), "exactly one batched frame");
    }

    #[tokio::test]
    async fn cycle_invalidates_node_and_telemetry_namespaces() {
        let h = harness(true);
        let dev = device("gw-1", DeviceStatus::Online);
        h.repo.add_device(dev.clone()).await;

        let ttl = Duration::from_secs(60);
        h.cache.set("nodes:state:1", "{}".into(), ttl).await;
        h.cache.set("telemetry:1", "{}".into(), ttl).await;
        h.cache.set("sessions:9", "{}".into(), ttl).await;

        h.orchestrator.run_cycle().await.unwrap();

        assert!(h.cache.get("nodes:state:1").await.is_none());
        assert!(h.cache.get("telemetry:1").await.is_none());
        assert!(h.cache.get("sessions:9").await.is_some());
    }

    /// Repository wrapper that rejects status updates for one device.
    struct FlakyStatusRepo {
        inner: Arc<MemoryRepository>,
        fail_for: Uuid,
    }

    #[async_trait]
    impl DeviceRepository for FlakyStatusRepo {
        async fn get_device(&self, id: Uuid) -> Result<Option<Device>> {
            self.inner.get_device(id).await
        }

        async fn get_device_by_key(&self, key: &str) -> Result<Option<Device>> {
            self.inner.get_device_by_key(key).await
        }

        async fn list_pollable_devices(&self) -> Result<Vec<Device>> {
            self.inner.list_pollable_devices().await
        }

        async fn update_device_status(
            &self,
            id: Uuid,
            status: DeviceStatus,
            last_seen: Option<DateTime<Utc>>,
        ) -> Result<()> {
            if id == self.fail_for {
                anyhow::bail!("status update rejected");
            }
            self.inner.update_device_status(id, status, last_seen).await
        }

        async fn insert_reading(&self, reading: &NewReading) -> Result<Reading> {
            self.inner.insert_reading(reading).await
        }

        async fn count_readings_since(
            &self,
            device_id: Uuid,
            since: DateTime<Utc>,
        ) -> Result<i64> {
            self.inner.count_readings_since(device_id, since).await
        }

        async fn get_or_create_device_state(&self, device_id: Uuid) -> Result<DeviceState> {
            self.inner.get_or_create_device_state(device_id).await
        }

        async fn update_device_state(
            &self,
            device_id: Uuid,
            patch: DeviceStatePatch,
        ) -> Result<()> {
            self.inner.update_device_state(device_id, patch).await
        }

        async fn enabled_rules(&self, device_id: Uuid) -> Result<Vec<AlertRule>> {
            self.inner.enabled_rules(device_id).await
        }

        async fn unresolved_alerts(&self, device_id: Uuid) -> Result<Vec<AlertEvent>> {
            self.inner.unresolved_alerts(device_id).await
        }

        async fn unresolved_alert_for_rule(
            &self,
            device_id: Uuid,
            rule_id: Uuid,
        ) -> Result<Option<AlertEvent>> {
            self.inner.unresolved_alert_for_rule(device_id, rule_id).await
        }

        async fn unresolved_alert_for_category(
            &self,
            device_id: Uuid,
            category: AlertCategory,
            metric: Option<&str>,
        ) -> Result<Option<AlertEvent>> {
            self.inner
                .unresolved_alert_for_category(device_id, category, metric)
                .await
        }

        async fn last_resolved_at_for_rule(
            &self,
            device_id: Uuid,
            rule_id: Uuid,
        ) -> Result<Option<DateTime<Utc>>> {
            self.inner.last_resolved_at_for_rule(device_id, rule_id).await
        }

        async fn insert_alert(&self, alert: NewAlertEvent) -> Result<AlertEvent> {
            self.inner.insert_alert(alert).await
        }

        async fn acknowledge_alert(&self, id: Uuid, by: &str) -> Result<AlertEvent> {
            self.inner.acknowledge_alert(id, by).await
        }

        async fn resolve_alert(&self, id: Uuid, comment: Option<&str>) -> Result<AlertEvent> {
            self.inner.resolve_alert(id, comment).await
        }

        async fn alerts_for_device(&self, device_id: Uuid) -> Result<Vec<AlertEvent>> {
            self.inner.alerts_for_device(device_id).await
        }

        async fn active_maintenance_window(
            &self,
            device_id: Uuid,
            at: DateTime<Utc>,
        ) -> Result<Option<MaintenanceWindow>> {
            self.inner.active_maintenance_window(device_id, at).await
        }

        async fn active_webhooks(&self) -> Result<Vec<WebhookSubscription>> {
            self.inner.active_webhooks().await
        }

        async fn prune(
            &self,
            readings_before: DateTime<Utc>,
            alerts_before: DateTime<Utc>,
            audit_before: DateTime<Utc>,
        ) -> Result<PruneCounts> {
            self.inner
                .prune(readings_before, alerts_before, audit_before)
                .await
        }
    }

    #[tokio::test]
    async fn one_device_failure_does_not_abort_the_cycle() {
        let memory = Arc::new(MemoryRepository::new());
        let bad = device("gw-bad", DeviceStatus::Provisioning);
        let good = device("gw-good", DeviceStatus::Provisioning);
        memory.add_device(bad.clone()).await;
        memory.add_device(good.clone()).await;

        let repo: Arc<dyn DeviceRepository> = Arc::new(FlakyStatusRepo {
            inner: memory.clone(),
            fail_for: bad.id,
        });
        let upstream = Arc::new(ScriptedUpstream::new(true));
        let hub = FanoutHub::new(10, 10, Duration::from_secs(30));
        let cache = Arc::new(LocalCache::new());
        let cfg = test_config();

        let alerts = AlertEngine::new(repo.clone(), memory.clone(), Notifier::new().unwrap());
        let scoring = ScoringEngine::new(repo.clone(), &cfg);
        let ingest = Arc::new(IngestService::new(
            repo.clone(),
            alerts.clone(),
            scoring,
            hub.clone(),
        ));
        let orchestrator = Orchestrator::new(
            repo,
            upstream,
            ingest,
            alerts,
            hub.clone(),
            cache.clone(),
            cfg,
        );

        let (_conn, mut rx) = hub.connect(None).await.unwrap();
        cache.set("nodes:state:1", "{}".into(), Duration::from_secs(60)).await;

        orchestrator.run_cycle().await.unwrap();

        // The healthy device was fully processed despite the other's error.
        assert_eq!(memory.reading_count().await, 1);
        let current = memory.get_device(good.id).await.unwrap().unwrap();
        assert_eq!(current.status, DeviceStatus::Online);
        let current = memory.get_device(bad.id).await.unwrap().unwrap();
        assert_eq!(current.status, DeviceStatus::Provisioning);

        // Cycle-end batching and invalidation still ran.
        match rx.recv().await.unwrap() {
            ServerMessage::BatchStatusUpdate { updates } => {
                assert_eq!(updates.len(), 1);
                assert_eq!(updates[0].node_id, good.id);
            }
            other => panic!("unexpected message: {other:?}"),
        }
        assert!(cache.get("nodes:state:1").await.is_none());
    }

    #[tokio::test]
    async fn provisioning_device_comes_online_on_first_sample() {
        let h = harness(true);
        let dev = device("gw-new", DeviceStatus::Provisioning);
        h.repo.add_device(dev.clone()).await;

        h.orchestrator.run_cycle().await.unwrap();

        assert_eq!(
            h.repo.get_device(dev.id).await.unwrap().unwrap().status,
            DeviceStatus::Online
        );
    }
}
