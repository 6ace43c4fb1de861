//! Device registry collaborator
//!
//! The registry owns the per-vehicle device records that carry campaign
//! state. `DeviceRegistry` is the seam the core depends on; `RestDeviceRegistry`
//! talks to the registry's REST API.

use crate::domain::device::{DeviceRecord, VehicleCampaignState};
use crate::io::rest::{RestClient, RestSettings};
use anyhow::bail;
use async_trait::async_trait;

pub const REGISTRY_USER_AGENT: &str = "campaign-gateway/registry";

#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Device record by name, `None` when unknown
    async fn get_device(&self, application: &str, name: &str) -> anyhow::Result<Option<DeviceRecord>>;

    /// Persist the full device record
    async fn update_device(&self, application: &str, device: &DeviceRecord) -> anyhow::Result<()>;

    /// Apply `state` to `device` and persist it
    async fn write_campaign_state(
        &self,
        application: &str,
        device: &mut DeviceRecord,
        state: &VehicleCampaignState,
    ) -> anyhow::Result<()> {
        device.apply_campaign_state(state);
        self.update_device(application, device).await
    }
}

pub struct RestDeviceRegistry {
    rest: RestClient,
}

impl RestDeviceRegistry {
    pub fn new(settings: RestSettings) -> anyhow::Result<Self> {
        Ok(Self { rest: RestClient::new(settings)? })
    }
}

fn device_path(application: &str, name: &str) -> String {
    format!("/api/registry/v1alpha1/apps/{}/devices/{}", application, name)
}

#[async_trait]
impl DeviceRegistry for RestDeviceRegistry {
    async fn get_device(&self, application: &str, name: &str) -> anyhow::Result<Option<DeviceRecord>> {
        self.rest.get(&device_path(application, name)).await
    }

    async fn update_device(&self, application: &str, device: &DeviceRecord) -> anyhow::Result<()> {
        let path = device_path(application, device.name());
        if !self.rest.put(&path, device).await? {
            bail!("device {} not found in application {}", device.name(), application);
        }
        Ok(())
    }
}
