//! Prometheus metrics and local control HTTP endpoint
//!
//! Exposes check-in metrics in Prometheus text format at /metrics.
//! When a controller is attached it also serves:
//! - `GET /state` - engine snapshot as JSON
//! - `POST /undo?checkin_id=<id>` - undo the pending check-in
//! - `POST /settings?auto_checkin=<true|false>` - toggle the user setting
//!
//! Uses hyper for the HTTP server.

use crate::domain::types::CheckinId;
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use crate::services::controller::{ControllerClient, SessionSettings};
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderValue, CONTENT_TYPE};
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
use tracing::{error, info};

const TEXT_PLAIN: &str = "text/plain; version=0.0.4; charset=utf-8";
const APPLICATION_JSON: &str = "application/json";

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

/// Write a simple metric (counter or gauge) with site label
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, site: &str, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

/// Write a histogram metric with buckets, sum, and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    bounds: &[u64; 10],
    sum: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in bounds.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {sum}");
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, site_id: &str) -> String {
    let summary = metrics.scrape();
    let mut output = String::with_capacity(4096);

    write_engine_metrics(&mut output, site_id, &summary);
    write_checkin_metrics(&mut output, site_id, &summary);
    write_undo_metrics(&mut output, site_id, &summary);
    write_input_metrics(&mut output, site_id, &summary);

    output
}

fn write_engine_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "checkin_engine_active",
        "Whether the tick timer is armed (0/1)",
        MetricType::Gauge,
        site,
        u64::from(summary.engine_active),
    );
    write_metric(
        output,
        "checkin_venues_loaded",
        "Venues with coordinates in the current set",
        MetricType::Gauge,
        site,
        summary.venues_loaded,
    );
    write_metric(output, "checkin_ticks_total", "Engine ticks evaluated", MetricType::Counter, site, summary.ticks_total);
    write_metric(
        output,
        "checkin_dwells_started_total",
        "Dwells started",
        MetricType::Counter,
        site,
        summary.dwells_started,
    );
    write_metric(
        output,
        "checkin_dwells_reset_total",
        "Dwells dropped before reaching the threshold",
        MetricType::Counter,
        site,
        summary.dwells_reset,
    );
}

fn write_checkin_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "checkin_dispatches_total",
        "Check-in calls issued",
        MetricType::Counter,
        site,
        summary.dispatches_total,
    );
    write_metric(
        output,
        "checkin_succeeded_total",
        "Check-ins accepted by the backend",
        MetricType::Counter,
        site,
        summary.checkins_succeeded,
    );
    write_metric(
        output,
        "checkin_cooldown_rejections_total",
        "Check-ins rejected by the server cooldown",
        MetricType::Counter,
        site,
        summary.cooldown_rejections,
    );
    write_metric(
        output,
        "checkin_failures_total",
        "Check-ins rejected or failed",
        MetricType::Counter,
        site,
        summary.checkin_failures,
    );

    write_histogram(
        output,
        "checkin_dispatch_latency_us",
        "Check-in call latency in microseconds",
        site,
        &summary.dispatch_lat_buckets,
        &METRICS_BUCKET_BOUNDS,
        summary.dispatch_lat_sum_us,
    );
    write_metric(
        output,
        "checkin_dispatch_latency_p99_us",
        "99th percentile check-in call latency",
        MetricType::Gauge,
        site,
        summary.dispatch_lat_p99_us,
    );
}

fn write_undo_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(output, "checkin_undos_succeeded_total", "Undos accepted", MetricType::Counter, site, summary.undos_succeeded);
    write_metric(output, "checkin_undos_failed_total", "Undos that failed", MetricType::Counter, site, summary.undos_failed);
    write_metric(
        output,
        "checkin_undos_expired_total",
        "Undo records that lapsed",
        MetricType::Counter,
        site,
        summary.undos_expired,
    );
}

fn write_input_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_metric(
        output,
        "checkin_fixes_received_total",
        "Location fixes accepted from the feed",
        MetricType::Counter,
        site,
        summary.fixes_received,
    );
    write_metric(
        output,
        "checkin_fixes_rejected_total",
        "Location feed lines rejected",
        MetricType::Counter,
        site,
        summary.fixes_rejected,
    );
    write_metric(
        output,
        "checkin_notices_dropped_total",
        "Notices dropped due to channel full",
        MetricType::Counter,
        site,
        summary.notices_dropped,
    );
}

/// Controller access for the control routes
#[derive(Clone)]
pub struct ControlSurface {
    pub client: ControllerClient,
    pub settings_tx: Arc<watch::Sender<SessionSettings>>,
}

fn respond(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn json_error(status: StatusCode, error: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "ok": false, "error": error }).to_string();
    respond(status, APPLICATION_JSON, body)
}

/// Value of `key` in a `a=1&b=2` query string
fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

async fn handle_control(
    method: &Method,
    path: &str,
    query: Option<&str>,
    control: &ControlSurface,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::GET, "/state") => match serde_json::to_string(&control.client.snapshot()) {
            Ok(body) => respond(StatusCode::OK, APPLICATION_JSON, body),
            Err(e) => json_error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()),
        },
        (&Method::POST, "/undo") => {
            let Some(checkin_id) = query_param(query, "checkin_id").filter(|id| !id.is_empty()) else {
                return json_error(StatusCode::BAD_REQUEST, "missing_checkin_id");
            };
            let ok = control.client.undo(&CheckinId::new(checkin_id)).await;
            info!(checkin_id = %checkin_id, ok = %ok, "manual_undo");
            let body = serde_json::json!({ "ok": ok }).to_string();
            respond(StatusCode::OK, APPLICATION_JSON, body)
        }
        (&Method::POST, "/settings") => {
            let enabled = match query_param(query, "auto_checkin") {
                Some("true") => true,
                Some("false") => false,
                _ => return json_error(StatusCode::BAD_REQUEST, "expected_auto_checkin_true_or_false"),
            };
            control.settings_tx.send_if_modified(|settings| {
                let changed = settings.auto_checkin_enabled != enabled;
                settings.auto_checkin_enabled = enabled;
                changed
            });
            info!(enabled = %enabled, "auto_checkin_setting_updated");
            let body = serde_json::json!({ "ok": true, "auto_checkin": enabled }).to_string();
            respond(StatusCode::OK, APPLICATION_JSON, body)
        }
        _ => respond(StatusCode::NOT_FOUND, TEXT_PLAIN, "Not Found"),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    site_id: Arc<String>,
    control: Option<ControlSurface>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(str::to_string);

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/metrics") => {
            respond(StatusCode::OK, TEXT_PLAIN, format_prometheus_metrics(&metrics, &site_id))
        }
        (&Method::GET, "/health") => respond(StatusCode::OK, TEXT_PLAIN, "ok"),
        _ => match &control {
            Some(control) => handle_control(&method, &path, query.as_deref(), control).await,
            None => respond(StatusCode::NOT_FOUND, TEXT_PLAIN, "Not Found"),
        },
    };
    Ok(response)
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    site_id: String,
    control: Option<ControlSurface>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    let site_id = Arc::new(site_id);

    info!(port = %port, site = %site_id, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let site_id = site_id.clone();
                        let control = control.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let site_id = site_id.clone();
                                let control = control.clone();
                                async move { handle_request(req, metrics, site_id, control).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
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

        metrics.record_tick();
        metrics.record_tick();
        metrics.record_dispatch();
        metrics.record_dispatch_latency(1_500);
        metrics.record_checkin_succeeded();
        metrics.set_engine_active(true);
        metrics.set_venues_loaded(4);

        let output = format_prometheus_metrics(&metrics, "downtown");

        assert!(output.contains("checkin_ticks_total{site=\"downtown\"} 2"));
        assert!(output.contains("checkin_dispatches_total{site=\"downtown\"} 1"));
        assert!(output.contains("checkin_dispatch_latency_us_bucket{site=\"downtown\",le=\"2000\"} 1"));
        assert!(output.contains("checkin_engine_active{site=\"downtown\"} 1"));
        assert!(output.contains("checkin_venues_loaded{site=\"downtown\"} 4"));
        assert!(output.contains("checkin_dispatch_latency_us_sum{site=\"downtown\"} 1500"));
    }

    #[test]
    fn test_scrapes_leave_latency_for_report() {
        let metrics = Metrics::new();
        metrics.record_dispatch_latency(1_500);

        let first = format_prometheus_metrics(&metrics, "downtown");
        let second = format_prometheus_metrics(&metrics, "downtown");
        let count = "checkin_dispatch_latency_us_count{site=\"downtown\"} 1";
        assert!(first.contains(count));
        assert!(second.contains(count));

        assert_eq!(metrics.report().dispatch_lat_buckets.iter().sum::<u64>(), 1);
    }

    #[test]
    fn test_query_param() {
        assert_eq!(query_param(Some("checkin_id=c-1"), "checkin_id"), Some("c-1"));
        assert_eq!(query_param(Some("a=1&auto_checkin=false"), "auto_checkin"), Some("false"));
        assert_eq!(query_param(Some("a=1"), "checkin_id"), None);
        assert_eq!(query_param(None, "checkin_id"), None);
    }
}
