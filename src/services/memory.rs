//! In-memory registry and campaign manager
//!
//! Single-process and not durable. Call counters and failure switches let
//! tests observe and steer the collaborators.

use crate::domain::device::DeviceRecord;
use crate::domain::types::{Campaign, ExecutionRecord, VehicleGroup};
use crate::io::campaign_manager::CampaignManager;
use crate::io::registry::DeviceRegistry;
use anyhow::anyhow;
use async_trait::async_trait;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct MemoryCampaignManager {
    campaigns: Mutex<FxHashMap<String, Campaign>>,
    groups: Mutex<FxHashMap<String, VehicleGroup>>,
    executions: Mutex<FxHashMap<String, Vec<ExecutionRecord>>>,
    failing: Mutex<FxHashSet<String>>,
    executed: Mutex<Vec<String>>,
    fail_execute: Mutex<bool>,
    campaign_fetches: AtomicUsize,
    group_fetches: AtomicUsize,
}

impl MemoryCampaignManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_campaign(&self, campaign_id: &str, group_id: &str, vins: &[&str]) {
        self.campaigns.lock().insert(
            campaign_id.to_string(),
            Campaign {
                campaign_id: campaign_id.to_string(),
                name: format!("campaign {campaign_id}"),
                vehicle_group_id: group_id.to_string(),
                ..Default::default()
            },
        );
        self.groups.lock().insert(
            group_id.to_string(),
            VehicleGroup {
                vehicle_group_id: group_id.to_string(),
                name: format!("group {group_id}"),
                vins: vins.iter().map(|v| v.to_string()).collect(),
            },
        );
    }

    pub fn remove_group(&self, group_id: &str) {
        self.groups.lock().remove(group_id);
    }

    /// Make every call for this campaign fail
    pub fn fail_campaign(&self, campaign_id: &str) {
        self.failing.lock().insert(campaign_id.to_string());
    }

    pub fn heal_campaign(&self, campaign_id: &str) {
        self.failing.lock().remove(campaign_id);
    }

    pub fn set_execute_fails(&self, fails: bool) {
        *self.fail_execute.lock() = fails;
    }

    pub fn add_execution(&self, campaign_id: &str, vin: &str, status: &str) {
        self.push_execution(ExecutionRecord {
            execution_id: format!("{campaign_id}-{vin}"),
            vin: vin.to_string(),
            status: status.to_string(),
            campaign_id: campaign_id.to_string(),
            ..Default::default()
        });
    }

    /// Record an execution that started at an RFC 3339 timestamp
    pub fn add_execution_started(&self, campaign_id: &str, vin: &str, status: &str, started_at: &str) {
        self.push_execution(ExecutionRecord {
            execution_id: format!("{campaign_id}-{vin}"),
            vin: vin.to_string(),
            status: status.to_string(),
            campaign_id: campaign_id.to_string(),
            started_at: Some(started_at.to_string()),
            ..Default::default()
        });
    }

    fn push_execution(&self, record: ExecutionRecord) {
        self.executions.lock().entry(record.campaign_id.clone()).or_default().push(record);
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn campaign_fetches(&self) -> usize {
        self.campaign_fetches.load(Ordering::SeqCst)
    }

    pub fn group_fetches(&self) -> usize {
        self.group_fetches.load(Ordering::SeqCst)
    }

    fn check(&self, campaign_id: &str) -> anyhow::Result<()> {
        if self.failing.lock().contains(campaign_id) {
            return Err(anyhow!("campaign manager unavailable for {campaign_id}"));
        }
        Ok(())
    }
}

#[async_trait]
impl CampaignManager for MemoryCampaignManager {
    async fn get_campaign(&self, campaign_id: &str) -> anyhow::Result<Option<Campaign>> {
        self.campaign_fetches.fetch_add(1, Ordering::SeqCst);
        self.check(campaign_id)?;
        Ok(self.campaigns.lock().get(campaign_id).cloned())
    }

    async fn get_vehicle_group(&self, group_id: &str) -> anyhow::Result<Option<VehicleGroup>> {
        self.group_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.groups.lock().get(group_id).cloned())
    }

    async fn execute_campaign(&self, campaign_id: &str) -> anyhow::Result<()> {
        self.check(campaign_id)?;
        if *self.fail_execute.lock() {
            return Err(anyhow!("execution of {campaign_id} rejected"));
        }
        self.executed.lock().push(campaign_id.to_string());
        Ok(())
    }

    async fn get_campaign_executions(&self, campaign_id: &str) -> anyhow::Result<Vec<ExecutionRecord>> {
        self.check(campaign_id)?;
        Ok(self.executions.lock().get(campaign_id).cloned().unwrap_or_default())
    }
}

#[derive(Default)]
pub struct MemoryRegistry {
    devices: Mutex<FxHashMap<String, DeviceRecord>>,
    failing_reads: Mutex<FxHashSet<String>>,
    fail_updates: Mutex<bool>,
    updates: AtomicUsize,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: DeviceRecord) {
        self.devices.lock().insert(device.name().to_string(), device);
    }

    pub fn device(&self, name: &str) -> Option<DeviceRecord> {
        self.devices.lock().get(name).cloned()
    }

    pub fn fail_reads_for(&self, name: &str) {
        self.failing_reads.lock().insert(name.to_string());
    }

    pub fn set_update_fails(&self, fails: bool) {
        *self.fail_updates.lock() = fails;
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DeviceRegistry for MemoryRegistry {
    async fn get_device(&self, _application: &str, name: &str) -> anyhow::Result<Option<DeviceRecord>> {
        if self.failing_reads.lock().contains(name) {
            return Err(anyhow!("registry unavailable"));
        }
        Ok(self.devices.lock().get(name).cloned())
    }

    async fn update_device(&self, _application: &str, device: &DeviceRecord) -> anyhow::Result<()> {
        if *self.fail_updates.lock() {
            return Err(anyhow!("registry rejected update"));
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.devices.lock().insert(device.name().to_string(), device.clone());
        Ok(())
    }
}
