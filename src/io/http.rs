//! HTTP endpoint: service info, health, Prometheus metrics and device lookup
//!
//! Uses hyper for the HTTP server. The device lookup is read-only and goes
//! through the same registry collaborator as the event handler.

use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::io::registry::DeviceRegistry;
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Shared state for request handlers
struct HttpState {
    application_id: String,
    metrics: Arc<Metrics>,
    registry: Arc<dyn DeviceRegistry>,
}

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, app: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{application=\"{app}\"}} {val}");
}

fn write_gauge_f64(output: &mut String, name: &str, help: &str, app: &str, val: f64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name}{{application=\"{app}\"}} {val:.6}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(summary: &MetricsSummary, app: &str) -> String {
    use MetricType::{Counter, Gauge};

    let counters: [(&str, &str, u64); 18] = [
        ("campaign_gateway_events_total", "Zone-change events handled", summary.events_received),
        ("campaign_gateway_events_malformed_total", "Payloads dropped as malformed", summary.events_malformed),
        ("campaign_gateway_zone_exits_total", "Zone-exit events ignored", summary.zone_exits_ignored),
        ("campaign_gateway_devices_not_found_total", "Events for unknown devices", summary.devices_not_found),
        ("campaign_gateway_registry_errors_total", "Failed device lookups", summary.registry_errors),
        ("campaign_gateway_triggers_debounced_total", "Triggers suppressed by the debounce gate", summary.triggers_debounced),
        ("campaign_gateway_campaigns_unresolved_total", "Events with no campaign for vehicle and zone", summary.campaigns_unresolved),
        ("campaign_gateway_campaigns_executed_total", "Campaign executions started", summary.campaigns_executed),
        ("campaign_gateway_execution_failures_total", "Campaign executions rejected", summary.execution_failures),
        ("campaign_gateway_heartbeats_total", "Re-entries for an already applied campaign", summary.heartbeats),
        ("campaign_gateway_persist_failures_total", "Device state writes that failed", summary.persist_failures),
        ("campaign_gateway_cache_hits_total", "Campaign resolution cache hits", summary.cache_hits),
        ("campaign_gateway_cache_misses_total", "Campaign resolution cache misses", summary.cache_misses),
        ("campaign_gateway_mapping_refreshes_total", "Successful zone mapping refreshes", summary.mapping_refreshes),
        ("campaign_gateway_mapping_refresh_failures_total", "Rejected zone mapping refreshes", summary.mapping_refresh_failures),
        ("campaign_gateway_reconcile_runs_total", "Reconciliation passes", summary.reconcile_runs),
        ("campaign_gateway_reconcile_updates_total", "Devices updated by reconciliation", summary.reconcile_updates),
        ("campaign_gateway_reconcile_failures_total", "Reconciliation items that failed", summary.reconcile_failures),
    ];

    let mut output = String::with_capacity(4096);
    for (name, help, val) in counters {
        write_metric(&mut output, name, help, Counter, app, val);
    }
    write_metric(&mut output, "campaign_gateway_mapped_zones", "Zones in the current mapping", Gauge, app, summary.mapped_zones);
    write_metric(&mut output, "campaign_gateway_uptime_seconds", "Seconds since start", Gauge, app, summary.uptime_secs);
    write_gauge_f64(
        &mut output,
        "campaign_gateway_cache_hit_ratio",
        "Campaign resolution cache hit ratio",
        app,
        summary.cache_hit_ratio(),
    );
    output
}

/// Split `/api/registry/apps/{app}/devices/{id}` into `(app, id)`
fn parse_device_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix("/api/registry/apps/")?;
    let (app, rest) = rest.split_once('/')?;
    let device = rest.strip_prefix("devices/")?;
    if app.is_empty() || device.is_empty() || device.contains('/') {
        return None;
    }
    Some((app, device))
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("static response should not fail")
}

fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(body.into()))
        .expect("static response should not fail")
}

async fn lookup_device(state: &HttpState, app: &str, name: &str) -> Response<Full<Bytes>> {
    match state.registry.get_device(app, name).await {
        Ok(Some(device)) => match serde_json::to_vec(&device) {
            Ok(body) => json_response(StatusCode::OK, body),
            Err(e) => {
                error!(error = %e, device = %name, "device_serialize_failed");
                text_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
            }
        },
        Ok(None) => {
            debug!(application = %app, device = %name, "http_device_not_found");
            json_response(StatusCode::NOT_FOUND, r#"{"error":"device_not_found"}"#)
        }
        Err(e) => {
            warn!(application = %app, device = %name, error = %format!("{:#}", e), "http_device_lookup_failed");
            json_response(StatusCode::BAD_GATEWAY, r#"{"error":"registry_unavailable"}"#)
        }
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<HttpState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    if req.method() != Method::GET {
        return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed"));
    }
    let path = req.uri().path().to_string();
    let response = match path.as_str() {
        "/" => json_response(
            StatusCode::OK,
            format!(
                r#"{{"service":"campaign-gateway","version":"{}","application":"{}"}}"#,
                env!("CARGO_PKG_VERSION"),
                state.application_id
            ),
        ),
        "/health" => text_response(StatusCode::OK, "ok"),
        "/metrics" => {
            let body = format_prometheus_metrics(&state.metrics.snapshot(), &state.application_id);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        _ => match parse_device_path(&path) {
            Some((app, name)) => lookup_device(&state, app, name).await,
            None => text_response(StatusCode::NOT_FOUND, "Not Found"),
        },
    };
    Ok(response)
}

/// Start the HTTP server
pub async fn start_http_server(
    port: u16,
    application_id: String,
    metrics: Arc<Metrics>,
    registry: Arc<dyn DeviceRegistry>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let state = Arc::new(HttpState { application_id, metrics, registry });

    info!(port = %port, application = %state.application_id, "http_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "http_connection_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "http_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("http_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_event_received();
        metrics.record_event_received();
        metrics.record_campaign_executed();
        metrics.record_cache_hit();
        metrics.record_cache_miss();
        metrics.record_mapping_refresh(3);

        let output = format_prometheus_metrics(&metrics.snapshot(), "bobbycar");

        assert!(output.contains("campaign_gateway_events_total{application=\"bobbycar\"} 2"));
        assert!(output.contains("campaign_gateway_campaigns_executed_total{application=\"bobbycar\"} 1"));
        assert!(output.contains("# TYPE campaign_gateway_mapped_zones gauge"));
        assert!(output.contains("campaign_gateway_mapped_zones{application=\"bobbycar\"} 3"));
        assert!(output.contains("campaign_gateway_cache_hit_ratio{application=\"bobbycar\"} 0.500000"));
    }

    #[test]
    fn test_parse_device_path() {
        assert_eq!(
            parse_device_path("/api/registry/apps/bobbycar/devices/V1"),
            Some(("bobbycar", "V1"))
        );
        assert_eq!(parse_device_path("/api/registry/apps/bobbycar/devices/"), None);
        assert_eq!(parse_device_path("/api/registry/apps//devices/V1"), None);
        assert_eq!(parse_device_path("/api/registry/apps/bobbycar/things/V1"), None);
        assert_eq!(parse_device_path("/api/registry/apps/bobbycar/devices/V1/extra"), None);
        assert_eq!(parse_device_path("/metrics"), None);
    }

    #[tokio::test]
    async fn test_server_stops_when_shutdown_sender_dropped() {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(shutdown_tx);
        let registry: Arc<dyn DeviceRegistry> = Arc::new(crate::services::MemoryRegistry::new());

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            start_http_server(0, "bobbycar".to_string(), Arc::new(Metrics::new()), registry, shutdown_rx),
        )
        .await
        .expect("server should return once the shutdown sender is gone");
        assert!(result.is_ok());
    }
}
