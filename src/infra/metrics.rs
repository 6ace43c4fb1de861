//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//!
//! NOTE: All atomics use Relaxed ordering. These are statistical counters only;
//! do NOT use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Lock-free metrics collector shared by the event loop and background tasks
pub struct Metrics {
    started_at: Instant,
    // Event handling
    events_received: AtomicU64,
    events_malformed: AtomicU64,
    zone_exits_ignored: AtomicU64,
    devices_not_found: AtomicU64,
    registry_errors: AtomicU64,
    triggers_debounced: AtomicU64,
    campaigns_unresolved: AtomicU64,
    campaigns_executed: AtomicU64,
    execution_failures: AtomicU64,
    heartbeats: AtomicU64,
    persist_failures: AtomicU64,
    // Resolution cache
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    // Mapping store
    mapping_refreshes: AtomicU64,
    mapping_refresh_failures: AtomicU64,
    mapped_zones: AtomicU64,
    // Reconciliation
    reconcile_runs: AtomicU64,
    reconcile_updates: AtomicU64,
    reconcile_failures: AtomicU64,
}

/// Point-in-time copy of all counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub uptime_secs: u64,
    pub events_received: u64,
    pub events_malformed: u64,
    pub zone_exits_ignored: u64,
    pub devices_not_found: u64,
    pub registry_errors: u64,
    pub triggers_debounced: u64,
    pub campaigns_unresolved: u64,
    pub campaigns_executed: u64,
    pub execution_failures: u64,
    pub heartbeats: u64,
    pub persist_failures: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub mapping_refreshes: u64,
    pub mapping_refresh_failures: u64,
    pub mapped_zones: u64,
    pub reconcile_runs: u64,
    pub reconcile_updates: u64,
    pub reconcile_failures: u64,
}

impl MetricsSummary {
    /// Cache hit ratio in [0, 1], 0 when no lookups happened
    pub fn cache_hit_ratio(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            return 0.0;
        }
        self.cache_hits as f64 / total as f64
    }

    pub fn log(&self) {
        info!(
            uptime_secs = %self.uptime_secs,
            events = %self.events_received,
            malformed = %self.events_malformed,
            executed = %self.campaigns_executed,
            execution_failures = %self.execution_failures,
            debounced = %self.triggers_debounced,
            unresolved = %self.campaigns_unresolved,
            heartbeats = %self.heartbeats,
            not_found = %self.devices_not_found,
            cache_hit_ratio = %format!("{:.2}", self.cache_hit_ratio()),
            mapped_zones = %self.mapped_zones,
            reconcile_runs = %self.reconcile_runs,
            reconcile_updates = %self.reconcile_updates,
            "metrics"
        );
    }
}

macro_rules! counter {
    ($record:ident, $field:ident) => {
        #[inline]
        pub fn $record(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            events_received: AtomicU64::new(0),
            events_malformed: AtomicU64::new(0),
            zone_exits_ignored: AtomicU64::new(0),
            devices_not_found: AtomicU64::new(0),
            registry_errors: AtomicU64::new(0),
            triggers_debounced: AtomicU64::new(0),
            campaigns_unresolved: AtomicU64::new(0),
            campaigns_executed: AtomicU64::new(0),
            execution_failures: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            persist_failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            mapping_refreshes: AtomicU64::new(0),
            mapping_refresh_failures: AtomicU64::new(0),
            mapped_zones: AtomicU64::new(0),
            reconcile_runs: AtomicU64::new(0),
            reconcile_updates: AtomicU64::new(0),
            reconcile_failures: AtomicU64::new(0),
        }
    }

    counter!(record_event_received, events_received);
    counter!(record_event_malformed, events_malformed);
    counter!(record_zone_exit_ignored, zone_exits_ignored);
    counter!(record_device_not_found, devices_not_found);
    counter!(record_registry_error, registry_errors);
    counter!(record_trigger_debounced, triggers_debounced);
    counter!(record_campaign_unresolved, campaigns_unresolved);
    counter!(record_campaign_executed, campaigns_executed);
    counter!(record_execution_failure, execution_failures);
    counter!(record_heartbeat, heartbeats);
    counter!(record_persist_failure, persist_failures);
    counter!(record_cache_hit, cache_hits);
    counter!(record_cache_miss, cache_misses);
    counter!(record_mapping_refresh_failure, mapping_refresh_failures);
    counter!(record_reconcile_run, reconcile_runs);
    counter!(record_reconcile_update, reconcile_updates);
    counter!(record_reconcile_failure, reconcile_failures);

    /// Successful refresh; also publishes the new table size
    pub fn record_mapping_refresh(&self, zones: usize) {
        self.mapping_refreshes.fetch_add(1, Ordering::Relaxed);
        self.mapped_zones.store(zones as u64, Ordering::Relaxed);
    }

    /// Load all counters without resetting
    pub fn snapshot(&self) -> MetricsSummary {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSummary {
            uptime_secs: self.started_at.elapsed().as_secs(),
            events_received: load(&self.events_received),
            events_malformed: load(&self.events_malformed),
            zone_exits_ignored: load(&self.zone_exits_ignored),
            devices_not_found: load(&self.devices_not_found),
            registry_errors: load(&self.registry_errors),
            triggers_debounced: load(&self.triggers_debounced),
            campaigns_unresolved: load(&self.campaigns_unresolved),
            campaigns_executed: load(&self.campaigns_executed),
            execution_failures: load(&self.execution_failures),
            heartbeats: load(&self.heartbeats),
            persist_failures: load(&self.persist_failures),
            cache_hits: load(&self.cache_hits),
            cache_misses: load(&self.cache_misses),
            mapping_refreshes: load(&self.mapping_refreshes),
            mapping_refresh_failures: load(&self.mapping_refresh_failures),
            mapped_zones: load(&self.mapped_zones),
            reconcile_runs: load(&self.reconcile_runs),
            reconcile_updates: load(&self.reconcile_updates),
            reconcile_failures: load(&self.reconcile_failures),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let metrics = Metrics::new();
        metrics.record_event_received();
        metrics.record_event_received();
        metrics.record_campaign_executed();
        metrics.record_mapping_refresh(4);

        let summary = metrics.snapshot();
        assert_eq!(summary.events_received, 2);
        assert_eq!(summary.campaigns_executed, 1);
        assert_eq!(summary.mapping_refreshes, 1);
        assert_eq!(summary.mapped_zones, 4);
    }

    #[test]
    fn test_cache_hit_ratio() {
        let metrics = Metrics::new();
        assert_eq!(metrics.snapshot().cache_hit_ratio(), 0.0);

        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        assert!((metrics.snapshot().cache_hit_ratio() - 0.75).abs() < f64::EPSILON);
    }
}
