//! Periodic reconciliation of campaign execution status onto device records
//!
//! Every interval the monitored campaigns (all campaigns in the current zone
//! mapping plus configured extras) are polled for execution records. Records
//! are grouped by VIN and the most recent one is copied onto the device named
//! by that VIN, so each device is written at most once per pass. Failures are
//! per campaign or per vehicle and never abort a pass.

use crate::domain::device::VehicleCampaignState;
use crate::domain::types::ExecutionRecord;
use crate::infra::metrics::Metrics;
use crate::io::campaign_manager::CampaignManager;
use crate::io::registry::DeviceRegistry;
use crate::services::mapping::MappingStore;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// What reconciliation did to one vehicle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconcileAction {
    Updated,
    Unchanged,
    Failed,
}

/// Record a vehicle converges to: latest activity wins, ties go to the
/// campaign the device already records, then to the last in campaign order.
fn select_record<'a>(records: &'a [ExecutionRecord], current_campaign: Option<&str>) -> Option<&'a ExecutionRecord> {
    records
        .iter()
        .max_by_key(|r| (r.activity_time(), current_campaign == Some(r.campaign_id.as_str())))
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub campaigns_checked: usize,
    pub records_seen: usize,
    pub devices_updated: usize,
    pub unchanged: usize,
    pub failures: usize,
}

pub struct Reconciler {
    application_id: String,
    registry: Arc<dyn DeviceRegistry>,
    campaigns: Arc<dyn CampaignManager>,
    mapping: Arc<MappingStore>,
    extra_campaigns: Vec<String>,
    metrics: Arc<Metrics>,
}

impl Reconciler {
    pub fn new(
        application_id: &str,
        registry: Arc<dyn DeviceRegistry>,
        campaigns: Arc<dyn CampaignManager>,
        mapping: Arc<MappingStore>,
        extra_campaigns: Vec<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            application_id: application_id.to_string(),
            registry,
            campaigns,
            mapping,
            extra_campaigns,
            metrics,
        }
    }

    /// Campaigns polled on each pass, sorted and deduplicated
    pub fn monitored_campaigns(&self) -> Vec<String> {
        let mut ids: BTreeSet<String> = self.mapping.campaign_ids().into_iter().collect();
        ids.extend(self.extra_campaigns.iter().filter(|id| !id.is_empty()).cloned());
        ids.into_iter().collect()
    }

    pub async fn reconcile_once(&self) -> ReconcileReport {
        let started = Instant::now();
        let mut report = ReconcileReport::default();
        let mut by_vin: BTreeMap<String, Vec<ExecutionRecord>> = BTreeMap::new();

        for campaign_id in self.monitored_campaigns() {
            report.campaigns_checked += 1;
            let records = match self.campaigns.get_campaign_executions(&campaign_id).await {
                Ok(records) => records,
                Err(e) => {
                    warn!(campaign = %campaign_id, error = %format!("{:#}", e), "campaign_executions_fetch_failed");
                    self.metrics.record_reconcile_failure();
                    report.failures += 1;
                    continue;
                }
            };

            for mut record in records {
                report.records_seen += 1;
                if record.vin.is_empty() {
                    debug!(campaign = %campaign_id, execution = %record.execution_id, "execution_without_vin_skipped");
                    continue;
                }
                record.campaign_id = campaign_id.clone();
                by_vin.entry(record.vin.clone()).or_default().push(record);
            }
        }

        for (vin, records) in &by_vin {
            match self.apply(vin, records).await {
                ReconcileAction::Updated => report.devices_updated += 1,
                ReconcileAction::Unchanged => report.unchanged += 1,
                ReconcileAction::Failed => report.failures += 1,
            }
        }

        self.metrics.record_reconcile_run();
        info!(
            campaigns = report.campaigns_checked,
            records = report.records_seen,
            vehicles = by_vin.len(),
            updated = report.devices_updated,
            unchanged = report.unchanged,
            failures = report.failures,
            duration_ms = started.elapsed().as_millis() as u64,
            "reconcile_complete"
        );
        report
    }

    /// Copy the winning execution record for one VIN onto its device
    async fn apply(&self, vin: &str, records: &[ExecutionRecord]) -> ReconcileAction {
        let mut device = match self.registry.get_device(&self.application_id, vin).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                warn!(vin = %vin, records = records.len(), "reconcile_device_not_found");
                self.metrics.record_reconcile_failure();
                return ReconcileAction::Failed;
            }
            Err(e) => {
                warn!(vin = %vin, error = %format!("{:#}", e), "reconcile_device_lookup_failed");
                self.metrics.record_reconcile_failure();
                return ReconcileAction::Failed;
            }
        };

        let current = device.campaign_state();
        let Some(record) = select_record(records, current.current_campaign.as_deref()) else {
            return ReconcileAction::Unchanged;
        };
        let campaign_id = record.campaign_id.as_str();
        let status = (!record.status.is_empty()).then(|| record.status.clone());
        if current.current_campaign.as_deref() == Some(campaign_id) && current.status == status {
            return ReconcileAction::Unchanged;
        }

        let observed = VehicleCampaignState {
            current_campaign: Some(campaign_id.to_string()),
            status: status.clone(),
            ..Default::default()
        };
        if let Err(e) = self.registry.write_campaign_state(&self.application_id, &mut device, &observed).await {
            warn!(vin = %vin, campaign = %campaign_id, error = %format!("{:#}", e), "reconcile_persist_failed");
            self.metrics.record_reconcile_failure();
            return ReconcileAction::Failed;
        }

        debug!(vin = %vin, campaign = %campaign_id, status = ?status, "reconcile_device_updated");
        self.metrics.record_reconcile_update();
        ReconcileAction::Updated
    }

    /// Reconcile every `period` until shutdown is signalled
    pub async fn run(&self, period: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = period.as_secs(), "reconcile_loop_started");

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("reconcile_loop_shutdown");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
            }
        }
    }
}
