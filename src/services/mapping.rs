//! Zone→campaign mapping store
//!
//! The table is an immutable snapshot behind an `Arc`. A refresh builds the
//! new table off to the side and swaps the reference, so a reader holds either
//! the old table or the new one, never a half-built map. A failed refresh
//! leaves the last good table in place.

use crate::domain::types::ZoneMapping;
use crate::infra::config::MappingSourceKind;
use crate::infra::metrics::Metrics;
use anyhow::{bail, Context};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::env;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Provides the raw JSON mapping document on every refresh
pub trait MappingSource: Send + Sync {
    fn load(&self) -> anyhow::Result<String>;

    /// Human readable origin for logs
    fn describe(&self) -> String;
}

/// Mapping document read from a file on every refresh
pub struct FileMappingSource {
    path: String,
}

impl FileMappingSource {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl MappingSource for FileMappingSource {
    fn load(&self) -> anyhow::Result<String> {
        fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read mapping file {}", self.path))
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path)
    }
}

/// Mapping document carried in the config file
pub struct InlineMappingSource {
    json: String,
}

impl InlineMappingSource {
    pub fn new(json: impl Into<String>) -> Self {
        Self { json: json.into() }
    }
}

impl MappingSource for InlineMappingSource {
    fn load(&self) -> anyhow::Result<String> {
        Ok(self.json.clone())
    }

    fn describe(&self) -> String {
        "inline".to_string()
    }
}

/// Mapping document read from an environment variable
pub struct EnvMappingSource {
    var: String,
}

impl EnvMappingSource {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl MappingSource for EnvMappingSource {
    fn load(&self) -> anyhow::Result<String> {
        Ok(env::var(&self.var).unwrap_or_default())
    }

    fn describe(&self) -> String {
        format!("env:{}", self.var)
    }
}

/// Build the source selected in the configuration
pub fn source_from_config(kind: &MappingSourceKind) -> Box<dyn MappingSource> {
    match kind {
        MappingSourceKind::File(path) => Box::new(FileMappingSource::new(path.clone())),
        MappingSourceKind::Inline(json) => Box::new(InlineMappingSource::new(json.clone())),
        MappingSourceKind::Env(var) => Box::new(EnvMappingSource::new(var.clone())),
    }
}

/// One complete generation of the zone→campaign table
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ZoneCampaignTable {
    zones: FxHashMap<String, Vec<String>>,
}

impl ZoneCampaignTable {
    /// Parse the JSON mapping document. Rejects empty input and documents
    /// that map no zone at all.
    pub fn parse(json: &str) -> anyhow::Result<Self> {
        if json.trim().is_empty() {
            bail!("zone-to-campaign mapping source is empty");
        }

        let rows: Vec<ZoneMapping> =
            serde_json::from_str(json).context("Failed to parse zone-to-campaign mapping")?;

        let mut zones = FxHashMap::default();
        for row in rows {
            if row.zone.is_empty() {
                warn!(campaigns = ?row.campaigns, "mapping_row_without_zone");
                continue;
            }
            // Later rows for the same zone replace earlier ones
            zones.insert(row.zone, row.campaigns);
        }

        if zones.is_empty() {
            bail!("zone-to-campaign mapping contains no zones");
        }

        Ok(Self { zones })
    }

    pub fn get(&self, zone: &str) -> Option<&[String]> {
        self.zones.get(zone).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Every mapped campaign once, sorted
    pub fn campaign_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.zones.values().flatten().cloned().collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Process-wide zone→campaign table shared by the resolver and reconciler
pub struct MappingStore {
    table: RwLock<Arc<ZoneCampaignTable>>,
}

impl MappingStore {
    pub fn new() -> Self {
        Self { table: RwLock::new(Arc::new(ZoneCampaignTable::default())) }
    }

    /// Reload from `source` and swap in the new table.
    /// Returns the number of zones in the new table.
    pub fn refresh(&self, source: &dyn MappingSource) -> anyhow::Result<usize> {
        let json = source.load()?;
        self.refresh_from_json(&json)
    }

    pub fn refresh_from_json(&self, json: &str) -> anyhow::Result<usize> {
        let table = ZoneCampaignTable::parse(json)?;
        let zones = table.len();
        *self.table.write() = Arc::new(table);
        Ok(zones)
    }

    /// Current table; stays valid even if a refresh swaps it out
    pub fn snapshot(&self) -> Arc<ZoneCampaignTable> {
        self.table.read().clone()
    }

    /// Candidate campaigns for `zone`, in scan order
    pub fn lookup(&self, zone: &str) -> Option<Vec<String>> {
        self.snapshot().get(zone).map(<[String]>::to_vec)
    }

    pub fn campaign_ids(&self) -> Vec<String> {
        self.snapshot().campaign_ids()
    }
}

impl Default for MappingStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Refresh once, logging the outcome. Failures keep the previous table.
pub fn refresh_and_log(store: &MappingStore, source: &dyn MappingSource, metrics: &Metrics) {
    match store.refresh(source) {
        Ok(zones) => {
            metrics.record_mapping_refresh(zones);
            debug!(source = %source.describe(), zones = %zones, "mapping_refreshed");
        }
        Err(e) => {
            metrics.record_mapping_refresh_failure();
            warn!(
                source = %source.describe(),
                error = %format!("{:#}", e),
                kept_zones = %store.snapshot().len(),
                "mapping_refresh_failed"
            );
        }
    }
}

/// Refresh the mapping on a fixed interval until shutdown
pub async fn run_refresh_loop(
    store: Arc<MappingStore>,
    source: Box<dyn MappingSource>,
    metrics: Arc<Metrics>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(source = %source.describe(), interval_secs = %every.as_secs(), "mapping_refresh_started");
    let mut interval = tokio::time::interval(every);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                refresh_and_log(&store, source.as_ref(), &metrics);
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("mapping_refresh_shutdown");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    const MAPPING: &str = r#"[
        {"zone": "zone-north", "campaigns": ["C1", "C2"]},
        {"zone": "zone-south", "campaigns": ["C3"]}
    ]"#;

    #[test]
    fn test_refresh_and_lookup() {
        let store = MappingStore::new();
        let zones = store.refresh(&InlineMappingSource::new(MAPPING)).unwrap();

        assert_eq!(zones, 2);
        assert_eq!(store.lookup("zone-north"), Some(vec!["C1".to_string(), "C2".to_string()]));
        assert_eq!(store.lookup("zone-east"), None);
    }

    #[test]
    fn test_empty_store_lookup() {
        let store = MappingStore::new();
        assert_eq!(store.lookup("zone-north"), None);
        assert!(store.campaign_ids().is_empty());
    }

    #[test]
    fn test_parse_error_keeps_previous_table() {
        let store = MappingStore::new();
        store.refresh_from_json(MAPPING).unwrap();

        assert!(store.refresh_from_json("{not json").is_err());
        assert_eq!(store.lookup("zone-south"), Some(vec!["C3".to_string()]));
    }

    #[test]
    fn test_empty_source_keeps_previous_table() {
        let store = MappingStore::new();
        store.refresh_from_json(MAPPING).unwrap();

        assert!(store.refresh_from_json("  ").is_err());
        assert!(store.refresh_from_json("[]").is_err());
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_rows_without_zone_are_skipped() {
        let table = ZoneCampaignTable::parse(
            r#"[{"zone": "", "campaigns": ["X"]}, {"zone": "z1", "campaigns": ["C1"]}]"#,
        )
        .unwrap();
        assert_eq!(table.len(), 1);
        assert_eq!(table.get("z1"), Some(&["C1".to_string()][..]));
    }

    #[test]
    fn test_duplicate_zone_last_row_wins() {
        let table = ZoneCampaignTable::parse(
            r#"[{"zone": "z1", "campaigns": ["A"]}, {"zone": "z1", "campaigns": ["B"]}]"#,
        )
        .unwrap();
        assert_eq!(table.get("z1"), Some(&["B".to_string()][..]));
    }

    #[test]
    fn test_campaign_ids_deduplicated() {
        let store = MappingStore::new();
        store
            .refresh_from_json(
                r#"[{"zone": "a", "campaigns": ["C2", "C1"]}, {"zone": "b", "campaigns": ["C1"]}]"#,
            )
            .unwrap();
        assert_eq!(store.campaign_ids(), vec!["C1".to_string(), "C2".to_string()]);
    }

    #[test]
    fn test_file_source_reread_on_refresh() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"[{"zone": "z1", "campaigns": ["C1"]}]"#).unwrap();
        file.flush().unwrap();

        let source = FileMappingSource::new(file.path().display().to_string());
        let store = MappingStore::new();
        store.refresh(&source).unwrap();
        assert_eq!(store.lookup("z1"), Some(vec!["C1".to_string()]));

        std::fs::write(file.path(), r#"[{"zone": "z2", "campaigns": ["C2"]}]"#).unwrap();
        store.refresh(&source).unwrap();
        assert_eq!(store.lookup("z1"), None);
        assert_eq!(store.lookup("z2"), Some(vec!["C2".to_string()]));
    }

    #[test]
    fn test_missing_file_is_refresh_failure() {
        let store = MappingStore::new();
        store.refresh_from_json(MAPPING).unwrap();
        let metrics = Metrics::new();

        refresh_and_log(&store, &FileMappingSource::new("/nonexistent/zones.json"), &metrics);

        let summary = metrics.snapshot();
        assert_eq!(summary.mapping_refresh_failures, 1);
        assert_eq!(store.snapshot().len(), 2);
    }

    #[test]
    fn test_snapshot_survives_swap() {
        let store = MappingStore::new();
        store.refresh_from_json(MAPPING).unwrap();
        let old = store.snapshot();

        store.refresh_from_json(r#"[{"zone": "zone-west", "campaigns": ["C9"]}]"#).unwrap();

        assert_eq!(old.len(), 2);
        assert!(old.get("zone-north").is_some());
        assert_eq!(store.snapshot().len(), 1);
    }

    #[test]
    fn test_concurrent_lookups_never_see_partial_table() {
        let store = Arc::new(MappingStore::new());
        store.refresh_from_json(MAPPING).unwrap();

        let writer = {
            let store = store.clone();
            std::thread::spawn(move || {
                for i in 0..200 {
                    let doc = if i % 2 == 0 {
                        r#"[{"zone": "zone-north", "campaigns": ["C7"]}, {"zone": "zone-south", "campaigns": ["C8"]}]"#
                    } else {
                        MAPPING
                    };
                    store.refresh_from_json(doc).unwrap();
                    // Failed refreshes interleaved with good ones
                    let _ = store.refresh_from_json("");
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let table = store.snapshot();
                        assert_eq!(table.len(), 2);
                        assert!(table.get("zone-north").is_some());
                        assert!(table.get("zone-south").is_some());
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[tokio::test]
    async fn test_refresh_loop_stops_on_shutdown() {
        let store = Arc::new(MappingStore::new());
        let metrics = Arc::new(Metrics::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run_refresh_loop(
            store.clone(),
            Box::new(InlineMappingSource::new(MAPPING)),
            metrics.clone(),
            Duration::from_millis(10),
            shutdown_rx,
        ));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(store.snapshot().len(), 2);
        assert!(metrics.snapshot().mapping_refreshes >= 1);
    }

    #[tokio::test]
    async fn test_refresh_loop_stops_when_shutdown_sender_dropped() {
        let store = Arc::new(MappingStore::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);

        tokio::time::timeout(
            Duration::from_secs(1),
            run_refresh_loop(
                store,
                Box::new(InlineMappingSource::new(MAPPING)),
                Arc::new(Metrics::new()),
                Duration::from_secs(60),
                shutdown_rx,
            ),
        )
        .await
        .expect("refresh loop should return once the shutdown sender is gone");
    }
}
