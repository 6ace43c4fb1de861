//! Campaign manager collaborator
//!
//! Read-only access to campaigns and vehicle groups, plus campaign execution
//! and execution status.

use crate::domain::types::{Campaign, ExecutionRecord, VehicleGroup};
use crate::io::rest::{RestClient, RestSettings};
use anyhow::bail;
use async_trait::async_trait;

pub const CAMPAIGN_MANAGER_USER_AGENT: &str = "campaign-gateway/campaignmanager";

#[async_trait]
pub trait CampaignManager: Send + Sync {
    async fn get_campaign(&self, campaign_id: &str) -> anyhow::Result<Option<Campaign>>;

    async fn get_vehicle_group(&self, group_id: &str) -> anyhow::Result<Option<VehicleGroup>>;

    /// Start executing a campaign on its vehicle group
    async fn execute_campaign(&self, campaign_id: &str) -> anyhow::Result<()>;

    /// Per-vehicle execution records; empty when the campaign never ran
    async fn get_campaign_executions(&self, campaign_id: &str) -> anyhow::Result<Vec<ExecutionRecord>>;
}

pub struct RestCampaignManager {
    rest: RestClient,
}

impl RestCampaignManager {
    pub fn new(settings: RestSettings) -> anyhow::Result<Self> {
        Ok(Self { rest: RestClient::new(settings)? })
    }
}

#[async_trait]
impl CampaignManager for RestCampaignManager {
    async fn get_campaign(&self, campaign_id: &str) -> anyhow::Result<Option<Campaign>> {
        self.rest.get(&format!("/campaign/{}", campaign_id)).await
    }

    async fn get_vehicle_group(&self, group_id: &str) -> anyhow::Result<Option<VehicleGroup>> {
        self.rest.get(&format!("/vehicle_group/{}", group_id)).await
    }

    async fn execute_campaign(&self, campaign_id: &str) -> anyhow::Result<()> {
        if !self.rest.post_empty(&format!("/campaign/{}/execute", campaign_id)).await? {
            bail!("campaign {} not found", campaign_id);
        }
        Ok(())
    }

    async fn get_campaign_executions(&self, campaign_id: &str) -> anyhow::Result<Vec<ExecutionRecord>> {
        let records: Option<Vec<ExecutionRecord>> =
            self.rest.get(&format!("/campaign/{}/executions", campaign_id)).await?;
        Ok(records.unwrap_or_default())
    }
}
