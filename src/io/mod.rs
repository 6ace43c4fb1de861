//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `mqtt` - MQTT client for receiving zone-change events
//! - `rest` - Shared REST plumbing (auth, request ids, retries)
//! - `registry` - Device registry collaborator
//! - `campaign_manager` - Campaign manager collaborator
//! - `http` - Health, Prometheus metrics and device lookup endpoint

pub mod campaign_manager;
pub mod http;
pub mod mqtt;
pub mod registry;
pub mod rest;

// Re-export commonly used types
pub use campaign_manager::{CampaignManager, RestCampaignManager};
pub use registry::{DeviceRegistry, RestDeviceRegistry};
pub use rest::{RestClient, RestSettings};
