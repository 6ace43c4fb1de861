//! Campaign resolution: which campaign should a vehicle run in a zone?
//!
//! Answers are cached per (vin, zone). On a miss the zone's candidate
//! campaigns are scanned in mapping order; the first campaign whose vehicle
//! group contains the VIN wins. A candidate whose campaign or group cannot be
//! fetched is skipped.

use crate::infra::metrics::Metrics;
use crate::io::campaign_manager::CampaignManager;
use crate::services::cache::TtlCache;
use crate::services::mapping::MappingStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Cache key for a resolved campaign
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey {
    pub vin: String,
    pub zone: String,
}

impl ResolutionKey {
    pub fn new(vin: &str, zone: &str) -> Self {
        Self { vin: vin.to_string(), zone: zone.to_string() }
    }
}

pub type CampaignCache = TtlCache<ResolutionKey, String>;

pub struct CampaignResolver {
    campaigns: Arc<dyn CampaignManager>,
    mapping: Arc<MappingStore>,
    cache: Arc<CampaignCache>,
    ttl: Duration,
    metrics: Arc<Metrics>,
}

impl CampaignResolver {
    pub fn new(
        campaigns: Arc<dyn CampaignManager>,
        mapping: Arc<MappingStore>,
        cache: Arc<CampaignCache>,
        ttl: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { campaigns, mapping, cache, ttl, metrics }
    }

    /// Campaign the vehicle should run in `zone`, if any
    pub async fn resolve(&self, vin: &str, zone: &str) -> Option<String> {
        let key = ResolutionKey::new(vin, zone);

        if let Some(campaign_id) = self.cache.get(&key) {
            self.metrics.record_cache_hit();
            debug!(vin = %vin, zone = %zone, campaign = %campaign_id, "campaign_cache_hit");
            return Some(campaign_id);
        }
        self.metrics.record_cache_miss();

        let Some(candidates) = self.mapping.lookup(zone) else {
            debug!(vin = %vin, zone = %zone, "no_campaign_configured_for_zone");
            return None;
        };

        for campaign_id in &candidates {
            if self.vehicle_in_campaign(vin, zone, campaign_id).await {
                debug!(vin = %vin, zone = %zone, campaign = %campaign_id, "campaign_cache_insert");
                self.cache.set(key, campaign_id.clone(), self.ttl);
                return Some(campaign_id.clone());
            }
        }

        debug!(vin = %vin, zone = %zone, candidates = ?candidates, "no_campaign_targets_vehicle");
        None
    }

    /// Membership test for one candidate; fetch failures count as no match
    async fn vehicle_in_campaign(&self, vin: &str, zone: &str, campaign_id: &str) -> bool {
        let campaign = match self.campaigns.get_campaign(campaign_id).await {
            Ok(Some(campaign)) => campaign,
            Ok(None) => {
                warn!(zone = %zone, campaign = %campaign_id, "campaign_not_found");
                return false;
            }
            Err(e) => {
                warn!(zone = %zone, campaign = %campaign_id, error = %format!("{:#}", e), "campaign_fetch_failed");
                return false;
            }
        };

        let group_id = campaign.vehicle_group_id.as_str();
        match self.campaigns.get_vehicle_group(group_id).await {
            Ok(Some(group)) => group.contains(vin),
            Ok(None) => {
                warn!(campaign = %campaign_id, vehicle_group = %group_id, "vehicle_group_not_found");
                false
            }
            Err(e) => {
                warn!(
                    campaign = %campaign_id,
                    vehicle_group = %group_id,
                    error = %format!("{:#}", e),
                    "vehicle_group_fetch_failed"
                );
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::memory::MemoryCampaignManager;

    const MAPPING: &str = r#"[
        {"zone": "zone-north", "campaigns": ["C1", "C2"]},
        {"zone": "zone-south", "campaigns": ["C3"]}
    ]"#;

    struct Harness {
        resolver: CampaignResolver,
        campaigns: Arc<MemoryCampaignManager>,
        mapping: Arc<MappingStore>,
        metrics: Arc<Metrics>,
    }

    fn harness(ttl: Duration) -> Harness {
        let campaigns = Arc::new(MemoryCampaignManager::new());
        campaigns.add_campaign("C1", "G1", &["V1"]);
        campaigns.add_campaign("C2", "G2", &["V2", "V3"]);
        campaigns.add_campaign("C3", "G3", &["V1", "V2"]);

        let mapping = Arc::new(MappingStore::new());
        mapping.refresh_from_json(MAPPING).unwrap();
        let metrics = Arc::new(Metrics::new());

        let resolver = CampaignResolver::new(
            campaigns.clone(),
            mapping.clone(),
            Arc::new(CampaignCache::new()),
            ttl,
            metrics.clone(),
        );
        Harness { resolver, campaigns, mapping, metrics }
    }

    #[tokio::test]
    async fn test_resolves_first_matching_candidate() {
        let h = harness(Duration::from_secs(60));
        assert_eq!(h.resolver.resolve("V1", "zone-north").await, Some("C1".to_string()));
        assert_eq!(h.resolver.resolve("V3", "zone-north").await, Some("C2".to_string()));
        assert_eq!(h.resolver.resolve("V1", "zone-south").await, Some("C3".to_string()));
    }

    #[tokio::test]
    async fn test_unknown_zone() {
        let h = harness(Duration::from_secs(60));
        assert_eq!(h.resolver.resolve("V1", "zone-east").await, None);
        assert_eq!(h.campaigns.campaign_fetches(), 0);
    }

    #[tokio::test]
    async fn test_vehicle_not_in_any_group() {
        let h = harness(Duration::from_secs(60));
        assert_eq!(h.resolver.resolve("V9", "zone-north").await, None);
        assert_eq!(h.campaigns.campaign_fetches(), 2);
        assert_eq!(h.campaigns.group_fetches(), 2);
    }

    #[tokio::test]
    async fn test_cache_hit_avoids_external_calls() {
        let h = harness(Duration::from_secs(60));
        assert_eq!(h.resolver.resolve("V2", "zone-north").await, Some("C2".to_string()));
        let campaign_fetches = h.campaigns.campaign_fetches();
        let group_fetches = h.campaigns.group_fetches();

        assert_eq!(h.resolver.resolve("V2", "zone-north").await, Some("C2".to_string()));
        assert_eq!(h.campaigns.campaign_fetches(), campaign_fetches);
        assert_eq!(h.campaigns.group_fetches(), group_fetches);

        let summary = h.metrics.snapshot();
        assert_eq!(summary.cache_hits, 1);
        assert_eq!(summary.cache_misses, 1);
    }

    #[tokio::test]
    async fn test_expired_cache_entry_queries_again() {
        let h = harness(Duration::from_millis(20));
        h.resolver.resolve("V1", "zone-north").await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        h.resolver.resolve("V1", "zone-north").await;
        assert_eq!(h.campaigns.campaign_fetches(), 2);
        assert_eq!(h.metrics.snapshot().cache_hits, 0);
    }

    #[tokio::test]
    async fn test_failed_candidate_is_skipped() {
        let h = harness(Duration::from_secs(60));
        h.campaigns.fail_campaign("C1");
        // V2 is only in C2; C1 failing must not abort the scan
        assert_eq!(h.resolver.resolve("V2", "zone-north").await, Some("C2".to_string()));
        // V1 is only in C1, which cannot be fetched
        assert_eq!(h.resolver.resolve("V1", "zone-north").await, None);
    }

    #[tokio::test]
    async fn test_missing_vehicle_group_is_skipped() {
        let h = harness(Duration::from_secs(60));
        h.campaigns.remove_group("G1");
        assert_eq!(h.resolver.resolve("V1", "zone-north").await, None);
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let h = harness(Duration::from_secs(60));
        h.campaigns.fail_campaign("C1");
        assert_eq!(h.resolver.resolve("V1", "zone-north").await, None);

        h.campaigns.heal_campaign("C1");
        assert_eq!(h.resolver.resolve("V1", "zone-north").await, Some("C1".to_string()));
    }

    #[tokio::test]
    async fn test_mapping_refresh_applies_on_next_miss() {
        let h = harness(Duration::from_secs(60));
        assert_eq!(h.resolver.resolve("V1", "zone-west").await, None);

        h.mapping.refresh_from_json(r#"[{"zone": "zone-west", "campaigns": ["C3"]}]"#).unwrap();
        assert_eq!(h.resolver.resolve("V1", "zone-west").await, Some("C3".to_string()));
    }
}
