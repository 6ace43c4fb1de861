//! Shared types for the campaign gateway

use serde::{Deserialize, Deserializer, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Current wall-clock time as unix seconds
pub fn unix_now() -> i64 {
    OffsetDateTime::now_utc().unix_timestamp()
}

/// Treat `null`, missing and empty strings the same way
fn deserialize_non_empty<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    Ok(value.filter(|s| !s.is_empty()))
}

/// Geofence transition as published on the zone-change topic
///
/// Wire format: `{"previousZoneId":"zone-north","nextZoneId":null,"carId":"test-car1","vin":null}`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ZoneChangeEvent {
    #[serde(rename = "previousZoneId", default, deserialize_with = "deserialize_non_empty")]
    pub previous_zone: Option<String>,
    #[serde(rename = "nextZoneId", default, deserialize_with = "deserialize_non_empty")]
    pub next_zone: Option<String>,
    #[serde(rename = "carId", default)]
    pub vehicle_id: String,
    #[serde(default, deserialize_with = "deserialize_non_empty")]
    pub vin: Option<String>,
}

impl ZoneChangeEvent {
    /// Zone the vehicle entered, `None` for zone-exit events
    pub fn entered_zone(&self) -> Option<&str> {
        self.next_zone.as_deref()
    }

    /// VIN used for campaign resolution. Falls back to the car id, which
    /// carries the VIN for fleets that register vehicles under it.
    pub fn resolution_vin(&self) -> &str {
        self.vin.as_deref().unwrap_or(&self.vehicle_id)
    }
}

/// Campaign metadata from the campaign manager
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Campaign {
    #[serde(rename = "id", default)]
    pub campaign_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub priority: String,
    #[serde(default)]
    pub status: CampaignStatus,
    #[serde(rename = "lastModified", default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<String>,
    #[serde(default)]
    pub vehicle_group_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_package_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes_uri: Option<String>,
}

/// Aggregate execution counters reported with a campaign
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CampaignStatus {
    #[serde(default)]
    pub success: u32,
    #[serde(default)]
    pub failure: u32,
    #[serde(default)]
    pub total_vehicles: u32,
    #[serde(default)]
    pub in_progress: u32,
}

/// Named set of VINs targeted by a campaign
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VehicleGroup {
    #[serde(rename = "id", default)]
    pub vehicle_group_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub vins: Vec<String>,
}

impl VehicleGroup {
    /// Linear scan; groups are small
    pub fn contains(&self, vin: &str) -> bool {
        self.vins.iter().any(|v| v == vin)
    }
}

/// Per-vehicle execution of a campaign
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(rename = "id", default)]
    pub execution_id: String,
    #[serde(default)]
    pub vin: String,
    #[serde(default)]
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
    #[serde(default)]
    pub campaign_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
}

impl ExecutionRecord {
    /// Unix seconds of the latest known activity: finish time, else start time.
    /// Unparseable timestamps read as absent.
    pub fn activity_time(&self) -> Option<i64> {
        let parse = |ts: &Option<String>| {
            ts.as_deref()
                .and_then(|s| OffsetDateTime::parse(s, &Rfc3339).ok())
                .map(|t| t.unix_timestamp())
        };
        parse(&self.finished_at).or_else(|| parse(&self.started_at))
    }
}

/// One row of the zone→campaign mapping document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneMapping {
    #[serde(default)]
    pub zone: String,
    #[serde(default)]
    pub campaigns: Vec<String>,
}
