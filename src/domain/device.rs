//! Device registry records and the campaign state stored on them
//!
//! The registry is the system of record for per-vehicle campaign state.
//! State lives in the device's label and annotations:
//! - label `zone` - zone the vehicle last entered
//! - annotation `lastCampaignExecution` - unix seconds of the last trigger decision
//! - annotation `lastUpdate` - legacy name for the same timestamp
//! - annotation `campaign` - campaign last applied
//! - annotation `campaignStatus` - execution status reported by the campaign manager

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const LABEL_ZONE: &str = "zone";
pub const ANNOTATION_LAST_EXECUTION: &str = "lastCampaignExecution";
pub const ANNOTATION_LAST_UPDATE: &str = "lastUpdate";
pub const ANNOTATION_CAMPAIGN: &str = "campaign";
pub const ANNOTATION_CAMPAIGN_STATUS: &str = "campaignStatus";

/// A device resource as served by the registry.
///
/// `spec` and `status` are carried opaquely so that writing a record back
/// never drops fields this service does not understand.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub metadata: ScopedMetadata,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopedMetadata {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub application: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Fields such as finalizers or deletionTimestamp, passed through untouched
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Typed view of the campaign state kept on a device record
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VehicleCampaignState {
    pub zone: Option<String>,
    /// Unix seconds of the last trigger decision
    pub last_trigger_time: Option<i64>,
    pub current_campaign: Option<String>,
    pub status: Option<String>,
}

impl DeviceRecord {
    pub fn new(application: &str, name: &str) -> Self {
        Self {
            metadata: ScopedMetadata {
                application: application.to_string(),
                name: name.to_string(),
                ..Default::default()
            },
            spec: None,
            status: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.metadata.labels.get(key).map(String::as_str)
    }

    pub fn set_label(&mut self, key: &str, value: &str) {
        self.metadata.labels.insert(key.to_string(), value.to_string());
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.metadata.annotations.get(key).map(String::as_str)
    }

    pub fn set_annotation(&mut self, key: &str, value: &str) {
        self.metadata.annotations.insert(key.to_string(), value.to_string());
    }

    /// Read the campaign state. Unparseable timestamps read as absent.
    pub fn campaign_state(&self) -> VehicleCampaignState {
        let last_trigger_time = self
            .annotation(ANNOTATION_LAST_EXECUTION)
            .or_else(|| self.annotation(ANNOTATION_LAST_UPDATE))
            .and_then(|raw| raw.trim().parse::<i64>().ok());

        VehicleCampaignState {
            zone: non_empty(self.label(LABEL_ZONE)),
            last_trigger_time,
            current_campaign: non_empty(self.annotation(ANNOTATION_CAMPAIGN)),
            status: non_empty(self.annotation(ANNOTATION_CAMPAIGN_STATUS)),
        }
    }

    /// Write the campaign state back onto labels and annotations.
    ///
    /// `None` fields leave the existing value in place; the stored campaign is
    /// overwritten, never appended to.
    pub fn apply_campaign_state(&mut self, state: &VehicleCampaignState) {
        if let Some(zone) = &state.zone {
            self.set_label(LABEL_ZONE, zone);
        }
        if let Some(ts) = state.last_trigger_time {
            let ts = ts.to_string();
            self.set_annotation(ANNOTATION_LAST_EXECUTION, &ts);
            self.set_annotation(ANNOTATION_LAST_UPDATE, &ts);
        }
        if let Some(campaign) = &state.current_campaign {
            self.set_annotation(ANNOTATION_CAMPAIGN, campaign);
        }
        if let Some(status) = &state.status {
            self.set_annotation(ANNOTATION_CAMPAIGN_STATUS, status);
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_registry_device() {
        let json = r#"{
            "metadata": {
                "application": "bobbycar",
                "name": "WBAFR9C59BC270614",
                "uid": "4e6a4b1e",
                "generation": 7,
                "resourceVersion": "abc",
                "finalizers": ["device-sync"],
                "labels": {"zone": "zone-south"},
                "annotations": {"lastUpdate": "1683137969", "campaign": "C1"}
            },
            "spec": {"authentication": {"pass": "secret"}}
        }"#;
        let device: DeviceRecord = serde_json::from_str(json).unwrap();

        assert_eq!(device.name(), "WBAFR9C59BC270614");
        assert_eq!(device.metadata.generation, 7);

        let state = device.campaign_state();
        assert_eq!(state.zone.as_deref(), Some("zone-south"));
        assert_eq!(state.last_trigger_time, Some(1683137969));
        assert_eq!(state.current_campaign.as_deref(), Some("C1"));
        assert_eq!(state.status, None);

        // Unknown fields survive a round trip through the registry
        let out = serde_json::to_value(&device).unwrap();
        assert_eq!(out["metadata"]["finalizers"][0], "device-sync");
        assert_eq!(out["spec"]["authentication"]["pass"], "secret");
    }

    #[test]
    fn test_last_execution_preferred_over_last_update() {
        let mut device = DeviceRecord::new("app", "car");
        device.set_annotation(ANNOTATION_LAST_UPDATE, "100");
        device.set_annotation(ANNOTATION_LAST_EXECUTION, "200");
        assert_eq!(device.campaign_state().last_trigger_time, Some(200));
    }

    #[test]
    fn test_unparseable_timestamp_reads_as_absent() {
        let mut device = DeviceRecord::new("app", "car");
        device.set_annotation(ANNOTATION_LAST_EXECUTION, "yesterday");
        assert_eq!(device.campaign_state().last_trigger_time, None);
    }

    #[test]
    fn test_apply_campaign_state_overwrites_campaign() {
        let mut device = DeviceRecord::new("app", "car");
        device.set_annotation(ANNOTATION_CAMPAIGN, "C1");
        device.set_label("owner", "fleet");

        device.apply_campaign_state(&VehicleCampaignState {
            zone: Some("zone-north".to_string()),
            last_trigger_time: Some(1700000000),
            current_campaign: Some("C2".to_string()),
            status: None,
        });

        assert_eq!(device.label(LABEL_ZONE), Some("zone-north"));
        assert_eq!(device.label("owner"), Some("fleet"));
        assert_eq!(device.annotation(ANNOTATION_CAMPAIGN), Some("C2"));
        assert_eq!(device.annotation(ANNOTATION_LAST_EXECUTION), Some("1700000000"));
        assert_eq!(device.annotation(ANNOTATION_LAST_UPDATE), Some("1700000000"));
        assert_eq!(device.annotation(ANNOTATION_CAMPAIGN_STATUS), None);
    }
}
