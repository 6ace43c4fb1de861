//! Domain models - core business types
//!
//! This module contains the canonical data types used throughout the system:
//! - `ZoneChangeEvent` - geofence transition consumed from the stream
//! - `Campaign`, `VehicleGroup`, `ExecutionRecord` - campaign manager entities
//! - `DeviceRecord` - registry representation of a vehicle
//! - `VehicleCampaignState` - typed campaign state stored on a device record

pub mod device;
pub mod types;

// Re-export commonly used types at module level
pub use device::{DeviceRecord, VehicleCampaignState};
pub use types::{unix_now, Campaign, ExecutionRecord, VehicleGroup, ZoneChangeEvent, ZoneMapping};
