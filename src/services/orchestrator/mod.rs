//! Zone-change event handling
//!
//! The Orchestrator is the single sequential consumer of zone-change events.
//! For each event it coordinates:
//! - Device lookup in the registry (keyed by vehicle id)
//! - The debounce gate against the state recorded on the device
//! - Campaign resolution for the entered zone
//! - Campaign execution, then persistence of the new state
//!
//! Execution always precedes persistence. A failed execution leaves the
//! device untouched so the next qualifying event retries.


use crate::domain::device::{DeviceRecord, VehicleCampaignState};
use crate::domain::types::{unix_now, ZoneChangeEvent};
use crate::infra::metrics::Metrics;
use crate::io::campaign_manager::CampaignManager;
use crate::io::registry::DeviceRegistry;
use crate::services::debounce::{DebounceGate, GateDecision};
use crate::services::resolver::CampaignResolver;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// What happened to a single zone-change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// Event carried no entered zone
    ZoneExit,
    DeviceNotFound,
    /// Device lookup failed
    RegistryUnavailable,
    /// Last trigger is too recent
    Debounced { age_secs: i64 },
    /// No campaign targets the vehicle in the entered zone
    Unresolved,
    /// Resolved campaign is already applied; zone and timestamp refreshed
    Heartbeat { campaign_id: String },
    Executed { campaign_id: String },
    /// Campaign manager rejected the execution; state left unchanged
    ExecutionFailed { campaign_id: String },
    /// Writing state back to the registry failed
    PersistFailed { campaign_id: String },
}

impl HandleOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandleOutcome::ZoneExit => "zone_exit",
            HandleOutcome::DeviceNotFound => "device_not_found",
            HandleOutcome::RegistryUnavailable => "registry_unavailable",
            HandleOutcome::Debounced { .. } => "debounced",
            HandleOutcome::Unresolved => "unresolved",
            HandleOutcome::Heartbeat { .. } => "heartbeat",
            HandleOutcome::Executed { .. } => "executed",
            HandleOutcome::ExecutionFailed { .. } => "execution_failed",
            HandleOutcome::PersistFailed { .. } => "persist_failed",
        }
    }
}

pub struct Orchestrator {
    application_id: String,
    registry: Arc<dyn DeviceRegistry>,
    campaigns: Arc<dyn CampaignManager>,
    resolver: Arc<CampaignResolver>,
    gate: DebounceGate,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(
        application_id: &str,
        registry: Arc<dyn DeviceRegistry>,
        campaigns: Arc<dyn CampaignManager>,
        resolver: Arc<CampaignResolver>,
        gate: DebounceGate,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { application_id: application_id.to_string(), registry, campaigns, resolver, gate, metrics }
    }

    /// Consume events one at a time until the channel closes or shutdown is signalled
    pub async fn run(&self, mut event_rx: mpsc::Receiver<ZoneChangeEvent>, mut shutdown: watch::Receiver<bool>) {
        info!(application = %self.application_id, threshold_secs = self.gate.threshold_secs(), "orchestrator_started");
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Already-received events are handled before returning
                        event_rx.close();
                        let mut drained = 0usize;
                        while let Ok(e) = event_rx.try_recv() {
                            self.handle(&e).await;
                            drained += 1;
                        }
                        info!(drained = drained, "orchestrator_shutdown");
                        return;
                    }
                }
                event = event_rx.recv() => {
                    match event {
                        Some(e) => {
                            self.handle(&e).await;
                        }
                        None => {
                            info!("orchestrator_channel_closed");
                            return;
                        }
                    }
                }
            }
        }
    }

    pub async fn handle(&self, event: &ZoneChangeEvent) -> HandleOutcome {
        self.handle_at(event, unix_now()).await
    }

    /// Handle an event as if the current unix time were `now`
    pub async fn handle_at(&self, event: &ZoneChangeEvent, now: i64) -> HandleOutcome {
        let started = Instant::now();
        let outcome = self.process(event, now).await;
        self.record(&outcome);
        debug!(
            vehicle = %event.vehicle_id,
            zone = event.entered_zone().unwrap_or(""),
            outcome = outcome.as_str(),
            latency_us = started.elapsed().as_micros() as u64,
            "zone_change_handled"
        );
        outcome
    }

    async fn process(&self, event: &ZoneChangeEvent, now: i64) -> HandleOutcome {
        let vehicle = event.vehicle_id.as_str();
        let Some(zone) = event.entered_zone() else {
            debug!(vehicle = %vehicle, previous_zone = ?event.previous_zone, "zone_exit_ignored");
            return HandleOutcome::ZoneExit;
        };

        let mut device = match self.registry.get_device(&self.application_id, vehicle).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                info!(vehicle = %vehicle, zone = %zone, "device_not_found");
                return HandleOutcome::DeviceNotFound;
            }
            Err(e) => {
                warn!(vehicle = %vehicle, zone = %zone, error = %format!("{:#}", e), "device_lookup_failed");
                return HandleOutcome::RegistryUnavailable;
            }
        };

        let state = device.campaign_state();
        match self.gate.evaluate(&state, now) {
            GateDecision::Suppress { age_secs } => {
                info!(
                    vehicle = %vehicle,
                    zone = %zone,
                    age_secs = age_secs,
                    threshold_secs = self.gate.threshold_secs(),
                    "campaign_trigger_debounced"
                );
                return HandleOutcome::Debounced { age_secs };
            }
            GateDecision::Allow { age_secs } => {
                debug!(vehicle = %vehicle, zone = %zone, age_secs = ?age_secs, "campaign_trigger_allowed");
            }
        }

        let vin = event.resolution_vin();
        let Some(campaign_id) = self.resolver.resolve(vin, zone).await else {
            warn!(vehicle = %vehicle, vin = %vin, zone = %zone, "campaign_unresolved");
            return HandleOutcome::Unresolved;
        };

        if DebounceGate::is_duplicate(&state, &campaign_id) {
            return self.heartbeat(&mut device, zone, campaign_id, now).await;
        }

        if let Err(e) = self.campaigns.execute_campaign(&campaign_id).await {
            warn!(
                vehicle = %vehicle,
                zone = %zone,
                campaign = %campaign_id,
                error = %format!("{:#}", e),
                "campaign_execution_failed"
            );
            return HandleOutcome::ExecutionFailed { campaign_id };
        }
        info!(vehicle = %vehicle, vin = %vin, zone = %zone, campaign = %campaign_id, "campaign_executed");
        self.metrics.record_campaign_executed();

        device.metadata.generation += 1;
        let applied = VehicleCampaignState {
            zone: Some(zone.to_string()),
            last_trigger_time: Some(now),
            current_campaign: Some(campaign_id.clone()),
            status: None,
        };
        match self.registry.write_campaign_state(&self.application_id, &mut device, &applied).await {
            Ok(()) => {
                info!(
                    vehicle = %vehicle,
                    zone = %zone,
                    campaign = %campaign_id,
                    generation = device.metadata.generation,
                    "campaign_state_persisted"
                );
                HandleOutcome::Executed { campaign_id }
            }
            Err(e) => {
                warn!(
                    vehicle = %vehicle,
                    zone = %zone,
                    campaign = %campaign_id,
                    error = %format!("{:#}", e),
                    "campaign_state_persist_failed"
                );
                HandleOutcome::PersistFailed { campaign_id }
            }
        }
    }

    /// Campaign already applied: refresh zone and timestamp without executing
    async fn heartbeat(
        &self,
        device: &mut DeviceRecord,
        zone: &str,
        campaign_id: String,
        now: i64,
    ) -> HandleOutcome {
        let refreshed = VehicleCampaignState {
            zone: Some(zone.to_string()),
            last_trigger_time: Some(now),
            ..Default::default()
        };
        match self.registry.write_campaign_state(&self.application_id, device, &refreshed).await {
            Ok(()) => {
                info!(vehicle = %device.name(), zone = %zone, campaign = %campaign_id, "campaign_already_applied");
                HandleOutcome::Heartbeat { campaign_id }
            }
            Err(e) => {
                warn!(
                    vehicle = %device.name(),
                    zone = %zone,
                    campaign = %campaign_id,
                    error = %format!("{:#}", e),
                    "campaign_heartbeat_persist_failed"
                );
                HandleOutcome::PersistFailed { campaign_id }
            }
        }
    }

    fn record(&self, outcome: &HandleOutcome) {
        self.metrics.record_event_received();
        match outcome {
            HandleOutcome::ZoneExit => self.metrics.record_zone_exit_ignored(),
            HandleOutcome::DeviceNotFound => self.metrics.record_device_not_found(),
            HandleOutcome::RegistryUnavailable => self.metrics.record_registry_error(),
            HandleOutcome::Debounced { .. } => self.metrics.record_trigger_debounced(),
            HandleOutcome::Unresolved => self.metrics.record_campaign_unresolved(),
            HandleOutcome::Heartbeat { .. } => self.metrics.record_heartbeat(),
            HandleOutcome::Executed { .. } => {}
            HandleOutcome::ExecutionFailed { .. } => self.metrics.record_execution_failure(),
            HandleOutcome::PersistFailed { .. } => self.metrics.record_persist_failure(),
        }
    }
}
