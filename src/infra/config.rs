//! Configuration loading from TOML files
//!
//! Config file is selected via:
//! 1. --config <path> command line argument
//! 2. CONFIG_FILE environment variable
//! 3. Default: config/dev.toml
//!
//! Endpoints and secrets can be overridden from the environment so that
//! credentials never need to live in the file.

use anyhow::{bail, Context};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Deserialize)]
pub struct AppSection {
    /// Registry application (tenant) the vehicles belong to
    #[serde(default = "default_application_id")]
    pub application_id: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self { application_id: default_application_id() }
    }
}

fn default_application_id() -> String {
    "bobbycar".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct MqttConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default = "default_mqtt_topic")]
    pub topic: String,
    #[serde(default = "default_mqtt_client_id")]
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_mqtt_port(),
            topic: default_mqtt_topic(),
            client_id: default_mqtt_client_id(),
            username: None,
            password: None,
        }
    }
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_topic() -> String {
    "bobbycar/zonechange".to_string()
}

fn default_mqtt_client_id() -> String {
    "zonechange-adapter".to_string()
}

/// Endpoint and credentials of a REST collaborator
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServiceConfig {
    #[serde(default)]
    pub endpoint: String,
    /// Basic auth user; requires `client_secret`
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Bearer token, takes precedence over client credentials
    #[serde(default)]
    pub access_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CampaignsConfig {
    /// JSON mapping file, re-read on every refresh
    #[serde(default)]
    pub mapping_file: Option<String>,
    /// Inline JSON mapping document
    #[serde(default)]
    pub mapping_json: Option<String>,
    /// Environment variable holding the JSON mapping document
    #[serde(default = "default_mapping_env")]
    pub mapping_env: String,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
}

impl Default for CampaignsConfig {
    fn default() -> Self {
        Self {
            mapping_file: None,
            mapping_json: None,
            mapping_env: default_mapping_env(),
            refresh_interval_secs: default_refresh_interval(),
        }
    }
}

fn default_mapping_env() -> String {
    "campaigns".to_string()
}

fn default_refresh_interval() -> u64 {
    30
}

#[derive(Debug, Clone, Deserialize)]
pub struct DebounceConfig {
    /// Minimum seconds between two triggers for the same vehicle
    #[serde(default = "default_debounce_threshold")]
    pub threshold_secs: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self { threshold_secs: default_debounce_threshold() }
    }
}

fn default_debounce_threshold() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { ttl_secs: default_cache_ttl() }
    }
}

fn default_cache_ttl() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconcileConfig {
    #[serde(default = "default_reconcile_enabled")]
    pub enabled: bool,
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    /// Campaigns monitored in addition to the ones in the zone mapping
    #[serde(default)]
    pub extra_campaigns: Vec<String>,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            enabled: default_reconcile_enabled(),
            interval_secs: default_reconcile_interval(),
            extra_campaigns: Vec::new(),
        }
    }
}

fn default_reconcile_enabled() -> bool {
    true
}

fn default_reconcile_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Device lookup / metrics listener port (0 to disable)
    #[serde(default = "default_http_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self { port: default_http_port() }
    }
}

fn default_http_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_interval")]
    pub interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { interval_secs: default_metrics_interval() }
    }
}

fn default_metrics_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_client_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_client_max_retries")]
    pub max_retries: u32,
    /// Value sent as X-Force-Trace on every request
    #[serde(default)]
    pub force_trace: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_client_timeout_ms(),
            max_retries: default_client_max_retries(),
            force_trace: None,
        }
    }
}

fn default_client_timeout_ms() -> u64 {
    10_000
}

fn default_client_max_retries() -> u32 {
    3
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub app: AppSection,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub registry: ServiceConfig,
    #[serde(default)]
    pub campaign_manager: ServiceConfig,
    #[serde(default)]
    pub campaigns: CampaignsConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Where the zone→campaign mapping document comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MappingSourceKind {
    File(String),
    Inline(String),
    Env(String),
}

/// Main configuration struct used throughout the application
#[derive(Debug, Clone)]
pub struct Config {
    config_file: String,
    application_id: String,
    mqtt: MqttConfig,
    registry: ServiceConfig,
    campaign_manager: ServiceConfig,
    campaigns: CampaignsConfig,
    debounce_threshold_secs: u64,
    cache_ttl_secs: u64,
    reconcile: ReconcileConfig,
    http_port: u16,
    metrics_interval_secs: u64,
    client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_toml(TomlConfig::default(), "default")
    }
}

impl Config {
    fn from_toml(toml_config: TomlConfig, config_file: &str) -> Self {
        Self {
            config_file: config_file.to_string(),
            application_id: toml_config.app.application_id,
            mqtt: toml_config.mqtt,
            registry: toml_config.registry,
            campaign_manager: toml_config.campaign_manager,
            campaigns: toml_config.campaigns,
            debounce_threshold_secs: toml_config.debounce.threshold_secs,
            cache_ttl_secs: toml_config.cache.ttl_secs,
            reconcile: toml_config.reconcile,
            http_port: toml_config.http.port,
            metrics_interval_secs: toml_config.metrics.interval_secs,
            client: toml_config.client,
        }
    }

    /// Determine config file path from args or environment
    pub fn resolve_config_path(args: &[String]) -> String {
        for (i, arg) in args.iter().enumerate() {
            if arg == "--config" {
                if let Some(path) = args.get(i + 1) {
                    return path.clone();
                }
            }
            if let Some(path) = arg.strip_prefix("--config=") {
                return path.to_string();
            }
        }

        if let Ok(path) = env::var("CONFIG_FILE") {
            return path;
        }

        "config/dev.toml".to_string()
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content, &path.display().to_string())
    }

    /// Parse configuration from TOML text
    pub fn from_toml_str(content: &str, origin: &str) -> anyhow::Result<Self> {
        let toml_config: TomlConfig = toml::from_str(content)
            .with_context(|| format!("Failed to parse config file {}", origin))?;
        Ok(Self::from_toml(toml_config, origin))
    }

    /// Load configuration from a path, falling back to defaults when no file
    /// exists there. A file that exists but cannot be read or parsed is an error.
    /// Environment overrides are applied on top.
    pub fn load_from_path(path: &str) -> anyhow::Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            warn!(config_file = %path, "config_file_missing_using_defaults");
            Self::default()
        };
        config.apply_env_overrides(|key| env::var(key).ok());
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in production)
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("APPLICATION_ID") {
            self.application_id = v;
        }
        if let Some(v) = get("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(port) = get("MQTT_PORT").and_then(|v| v.parse().ok()) {
            self.mqtt.port = port;
        }
        if let Some(v) = get("SOURCE_TOPIC") {
            self.mqtt.topic = v;
        }
        Self::override_service(&mut self.registry, "REGISTRY", &get);
        Self::override_service(&mut self.campaign_manager, "CAMPAIGN_MANAGER", &get);
    }

    fn override_service<F>(service: &mut ServiceConfig, prefix: &str, get: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = get(&format!("{prefix}_HTTP_ENDPOINT")) {
            service.endpoint = v;
        }
        if let Some(v) = get(&format!("{prefix}_CLIENT_ID")) {
            service.client_id = Some(v);
        }
        if let Some(v) = get(&format!("{prefix}_CLIENT_SECRET")) {
            service.client_secret = Some(v);
        }
        if let Some(v) = get(&format!("{prefix}_ACCESS_TOKEN")) {
            service.access_token = Some(v);
        }
    }

    /// Reject configurations the service cannot start with
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.application_id.trim().is_empty() {
            bail!("missing application id");
        }
        if self.mqtt.host.trim().is_empty() {
            bail!("missing MQTT host");
        }
        Self::validate_service("registry", &self.registry)?;
        Self::validate_service("campaign_manager", &self.campaign_manager)?;

        if self.campaigns.refresh_interval_secs == 0 {
            bail!("campaigns.refresh_interval_secs must be greater than zero");
        }
        if self.reconcile.enabled && self.reconcile.interval_secs == 0 {
            bail!("reconcile.interval_secs must be greater than zero");
        }
        if self.cache_ttl_secs == 0 {
            bail!("cache.ttl_secs must be greater than zero");
        }
        if self.metrics_interval_secs == 0 {
            bail!("metrics.interval_secs must be greater than zero");
        }
        Ok(())
    }

    fn validate_service(name: &str, service: &ServiceConfig) -> anyhow::Result<()> {
        if service.endpoint.trim().is_empty() {
            bail!("missing {name} endpoint");
        }
        if service.access_token.is_none()
            && service.client_id.is_some()
            && service.client_secret.is_none()
        {
            bail!("{name} client_id is set but client_secret is missing");
        }
        Ok(())
    }

    /// File takes precedence over inline JSON, which takes precedence over the environment
    pub fn mapping_source(&self) -> MappingSourceKind {
        if let Some(path) = &self.campaigns.mapping_file {
            return MappingSourceKind::File(path.clone());
        }
        if let Some(json) = &self.campaigns.mapping_json {
            return MappingSourceKind::Inline(json.clone());
        }
        MappingSourceKind::Env(self.campaigns.mapping_env.clone())
    }

    // Getters for all config fields
    pub fn config_file(&self) -> &str {
        &self.config_file
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn mqtt_host(&self) -> &str {
        &self.mqtt.host
    }

    pub fn mqtt_port(&self) -> u16 {
        self.mqtt.port
    }

    pub fn mqtt_topic(&self) -> &str {
        &self.mqtt.topic
    }

    pub fn mqtt_client_id(&self) -> &str {
        &self.mqtt.client_id
    }

    pub fn mqtt_username(&self) -> Option<&str> {
        self.mqtt.username.as_deref()
    }

    pub fn mqtt_password(&self) -> Option<&str> {
        self.mqtt.password.as_deref()
    }

    pub fn registry(&self) -> &ServiceConfig {
        &self.registry
    }

    pub fn campaign_manager(&self) -> &ServiceConfig {
        &self.campaign_manager
    }

    pub fn mapping_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.campaigns.refresh_interval_secs)
    }

    pub fn debounce_threshold(&self) -> Duration {
        Duration::from_secs(self.debounce_threshold_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn reconcile_enabled(&self) -> bool {
        self.reconcile.enabled
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile.interval_secs)
    }

    pub fn reconcile_extra_campaigns(&self) -> &[String] {
        &self.reconcile.extra_campaigns
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn metrics_interval_secs(&self) -> u64 {
        self.metrics_interval_secs
    }

    pub fn client_timeout(&self) -> Duration {
        Duration::from_millis(self.client.timeout_ms)
    }

    pub fn client_max_retries(&self) -> u32 {
        self.client.max_retries
    }

    pub fn force_trace(&self) -> Option<&str> {
        self.client.force_trace.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid_config() -> Config {
        let mut config = Config::default();
        config.apply_env_overrides(|key| {
            HashMap::from([
                ("MQTT_HOST", "broker"),
                ("REGISTRY_HTTP_ENDPOINT", "http://registry"),
                ("CAMPAIGN_MANAGER_HTTP_ENDPOINT", "http://ota"),
            ])
            .get(key)
            .map(|v| v.to_string())
        });
        config
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.application_id(), "bobbycar");
        assert_eq!(config.mqtt_port(), 1883);
        assert_eq!(config.debounce_threshold(), Duration::from_secs(60));
        assert_eq!(config.cache_ttl(), Duration::from_secs(60));
        assert_eq!(config.mapping_refresh_interval(), Duration::from_secs(30));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(60));
        assert_eq!(config.mapping_source(), MappingSourceKind::Env("campaigns".to_string()));
    }

    #[test]
    fn test_default_config_is_not_startable() {
        let err = Config::default().validate().unwrap_err();
        assert!(err.to_string().contains("MQTT host"));
    }

    #[test]
    fn test_env_overrides_make_config_valid() {
        let config = valid_config();
        assert_eq!(config.mqtt_host(), "broker");
        assert_eq!(config.registry().endpoint, "http://registry");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_env_value_is_ignored() {
        let mut config = valid_config();
        config.apply_env_overrides(|key| (key == "APPLICATION_ID").then(String::new));
        assert_eq!(config.application_id(), "bobbycar");
    }

    #[test]
    fn test_client_id_without_secret_rejected() {
        let mut config = valid_config();
        config.apply_env_overrides(|key| {
            (key == "REGISTRY_CLIENT_ID").then(|| "admin".to_string())
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("client_secret"));
    }

    #[test]
    fn test_mapping_source_precedence() {
        let config = Config::from_toml_str(
            r#"
[campaigns]
mapping_file = "zones.json"
mapping_json = '[{"zone":"z","campaigns":["c"]}]'
"#,
            "test",
        )
        .unwrap();
        assert_eq!(config.mapping_source(), MappingSourceKind::File("zones.json".to_string()));
    }

    #[test]
    fn test_resolve_config_path_default() {
        let args: Vec<String> = vec!["campaign-gateway".to_string()];
        if env::var("CONFIG_FILE").is_err() {
            assert_eq!(Config::resolve_config_path(&args), "config/dev.toml");
        }
    }

    #[test]
    fn test_resolve_config_path_from_arg() {
        let args: Vec<String> = vec![
            "campaign-gateway".to_string(),
            "--config".to_string(),
            "config/prod.toml".to_string(),
        ];
        assert_eq!(Config::resolve_config_path(&args), "config/prod.toml");
    }

    #[test]
    fn test_resolve_config_path_from_arg_equals() {
        let args: Vec<String> =
            vec!["campaign-gateway".to_string(), "--config=config/edge.toml".to_string()];
        assert_eq!(Config::resolve_config_path(&args), "config/edge.toml");
    }
}
