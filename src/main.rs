//! Campaign gateway - triggers OTA campaigns when vehicles enter zones
//!
//! Consumes zone-change events from MQTT, resolves the campaign that targets
//! the vehicle in the entered zone, executes it through the campaign manager
//! and records the outcome on the vehicle's device in the registry.
//!
//! Module structure:
//! - `domain/` - Event, campaign and device record types
//! - `io/` - External interfaces (MQTT, REST collaborators, HTTP endpoint)
//! - `services/` - Cache, mapping, resolver, debounce, orchestrator, reconciler
//! - `infra/` - Infrastructure (Config, Metrics)

use campaign_gateway::infra::{Config, Metrics};
use campaign_gateway::io::campaign_manager::CAMPAIGN_MANAGER_USER_AGENT;
use campaign_gateway::io::registry::REGISTRY_USER_AGENT;
use campaign_gateway::io::{
    CampaignManager, DeviceRegistry, RestCampaignManager, RestDeviceRegistry, RestSettings,
};
use campaign_gateway::services::mapping::{refresh_and_log, run_refresh_loop, source_from_config};
use campaign_gateway::services::{
    CampaignCache, CampaignResolver, DebounceGate, MappingStore, Orchestrator, Reconciler,
};
use clap::Parser;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Campaign gateway - zone-triggered OTA campaign execution
#[derive(Parser, Debug)]
#[command(name = "campaign-gateway", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Log at debug level when RUST_LOG is not set
    #[arg(long)]
    debug: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize structured logging with configurable level via RUST_LOG env var
    let default_level = if args.debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), git = env!("GIT_HASH"), "campaign-gateway starting");

    let config_path = args.config.unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = match Config::load_from_path(&config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(config_file = %config_path, error = %format!("{:#}", e), "config_load_failed");
            return Err(e.into());
        }
    };

    if let Err(e) = config.validate() {
        error!(config_file = %config.config_file(), error = %format!("{:#}", e), "config_invalid");
        return Err(e.into());
    }

    info!(
        config_file = %config.config_file(),
        application = %config.application_id(),
        mqtt_host = %config.mqtt_host(),
        mqtt_port = %config.mqtt_port(),
        mqtt_topic = %config.mqtt_topic(),
        registry = %config.registry().endpoint,
        campaign_manager = %config.campaign_manager().endpoint,
        mapping_source = ?config.mapping_source(),
        debounce_secs = %config.debounce_threshold().as_secs(),
        cache_ttl_secs = %config.cache_ttl().as_secs(),
        reconcile_enabled = %config.reconcile_enabled(),
        http_port = %config.http_port(),
        "config_loaded"
    );

    if args.check {
        info!("config_check_passed");
        return Ok(());
    }

    // External collaborators; failure to construct them is fatal
    let registry: Arc<dyn DeviceRegistry> = Arc::new(RestDeviceRegistry::new(RestSettings::from_service(
        config.registry(),
        REGISTRY_USER_AGENT,
        config.client_timeout(),
        config.client_max_retries(),
        config.force_trace(),
    ))?);
    let campaigns: Arc<dyn CampaignManager> = Arc::new(RestCampaignManager::new(RestSettings::from_service(
        config.campaign_manager(),
        CAMPAIGN_MANAGER_USER_AGENT,
        config.client_timeout(),
        config.client_max_retries(),
        config.force_trace(),
    ))?);

    // Create shutdown signal
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Initial mapping load; a failure leaves the table empty until the next refresh
    let mapping = Arc::new(MappingStore::new());
    let mapping_source = source_from_config(&config.mapping_source());
    refresh_and_log(&mapping, mapping_source.as_ref(), &metrics);
    info!(source = %mapping_source.describe(), zones = %mapping.snapshot().len(), "mapping_loaded");

    {
        let mapping = mapping.clone();
        let metrics = metrics.clone();
        let every = config.mapping_refresh_interval();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            run_refresh_loop(mapping, mapping_source, metrics, every, shutdown).await;
        });
    }

    // Campaign resolution cache with periodic purge of expired entries
    let cache = Arc::new(CampaignCache::new());
    {
        let cache = cache.clone();
        let every = config.cache_ttl();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                cache.purge_expired();
            }
        });
    }

    let resolver = Arc::new(CampaignResolver::new(
        campaigns.clone(),
        mapping.clone(),
        cache,
        config.cache_ttl(),
        metrics.clone(),
    ));

    // Start reconciliation loop
    if config.reconcile_enabled() {
        let reconciler = Reconciler::new(
            config.application_id(),
            registry.clone(),
            campaigns.clone(),
            mapping.clone(),
            config.reconcile_extra_campaigns().to_vec(),
            metrics.clone(),
        );
        let every = config.reconcile_interval();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            reconciler.run(every, shutdown).await;
        });
    }

    // Start HTTP endpoint (if port > 0)
    let http_port = config.http_port();
    if http_port > 0 {
        let application_id = config.application_id().to_string();
        let http_metrics = metrics.clone();
        let http_registry = registry.clone();
        let http_shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = campaign_gateway::io::http::start_http_server(
                http_port,
                application_id,
                http_metrics,
                http_registry,
                http_shutdown,
            )
            .await
            {
                error!(error = %e, "http_server_error");
            }
        });
    }

    // Start metrics reporter
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(metrics_interval));
        loop {
            interval.tick().await;
            metrics_clone.snapshot().log();
        }
    });

    // Single-slot hand-off: the MQTT loop stops polling while an event is in
    // flight, so unprocessed publishes stay with the broker
    let (event_tx, event_rx) = mpsc::channel(1);

    // Start MQTT client
    let mqtt_config = config.clone();
    let mqtt_metrics = metrics.clone();
    let mqtt_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            campaign_gateway::io::mqtt::start_mqtt_client(&mqtt_config, event_tx, mqtt_metrics, mqtt_shutdown).await
        {
            error!(error = %e, "mqtt_client_error");
        }
    });

    let orchestrator = Orchestrator::new(
        config.application_id(),
        registry,
        campaigns,
        resolver,
        DebounceGate::new(config.debounce_threshold()),
        metrics.clone(),
    );

    // Handle shutdown on Ctrl+C
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown_signal_received");
        let _ = shutdown_tx.send(true);
    });

    // Consume events until the channel closes or shutdown is signalled
    orchestrator.run(event_rx, shutdown_rx).await;

    metrics.snapshot().log();
    info!("campaign-gateway shutdown complete");
    Ok(())
}
