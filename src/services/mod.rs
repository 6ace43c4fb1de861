//! Services - campaign triggering logic and shared state
//!
//! This module contains the core services:
//! - `cache` - TTL lookup cache with lazy eviction
//! - `mapping` - Zone to candidate-campaign table, refreshed atomically
//! - `resolver` - Campaign resolution per (vin, zone)
//! - `debounce` - Per-vehicle trigger rate limiting
//! - `orchestrator` - Zone-change event handling
//! - `reconciler` - Periodic execution status reconciliation
//! - `memory` - In-memory collaborators for tests

pub mod cache;
pub mod debounce;
pub mod mapping;
pub mod memory;
pub mod orchestrator;
pub mod reconciler;
pub mod resolver;

// Re-export commonly used types
pub use cache::TtlCache;
pub use debounce::{DebounceGate, GateDecision};
pub use mapping::{MappingSource, MappingStore, ZoneCampaignTable};
pub use memory::{MemoryCampaignManager, MemoryRegistry};
pub use orchestrator::{HandleOutcome, Orchestrator};
pub use reconciler::{ReconcileReport, Reconciler};
pub use resolver::{CampaignCache, CampaignResolver};
