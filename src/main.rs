//! Proximity check-in - automatic venue check-in from location dwell
//!
//! Watches the device location, detects a sustained stay at a known venue,
//! and checks the user in through the backend with a short undo window.
//!
//! Module structure:
//! - `domain/` - Core types and geo math
//! - `io/` - External interfaces (check-in API, location feed, venues, notices)
//! - `services/` - Dwell tracking, decision engine, dispatcher, controller
//! - `infra/` - Infrastructure (Config, Metrics)

use clap::Parser;
use proximity_checkin::infra::{Config, Metrics};
use proximity_checkin::io::prometheus::{start_metrics_server, ControlSurface};
use proximity_checkin::io::{
    create_notice_channel, start_location_listener, HttpCheckinApi, LocationListenerConfig, NoticeSink,
    VenueFilePoller,
};
use proximity_checkin::services::{start_controller, ControllerInputs, SessionSettings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Proximity check-in engine
#[derive(Parser, Debug)]
#[command(name = "proximity-checkin", version, about)]
struct Args {
    /// Path to TOML configuration file (falls back to CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Default: INFO, use RUST_LOG=debug to see every tick decision
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .init();

    info!(git_hash = %env!("GIT_HASH"), "proximity-checkin starting");

    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from_path(path),
        None => Config::load(&[]),
    };

    info!(
        config_file = %config.config_file(),
        site_id = %config.site_id(),
        geofence_radius_m = %config.geofence_radius_m(),
        min_confidence = %config.min_confidence(),
        active_radius_m = %format!("{:.1}", config.active_radius_m()),
        dwell_threshold_secs = %config.dwell_threshold().as_secs(),
        tick_interval_secs = %config.tick_interval().as_secs(),
        undo_window_secs = %config.undo_window().as_secs(),
        undo_expiry_secs = %config.undo_expiry().as_secs(),
        api_base_url = %config.api_base_url(),
        authenticated = %config.is_authenticated(),
        venues_file = %config.venues_file(),
        location_port = %config.location_listener_port(),
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(Metrics::new());

    // Venues: load once up front so the gate can open on the first evaluation
    let (venues_tx, venues_rx) = watch::channel(Arc::default());
    let poller = VenueFilePoller::new(
        config.venues_file(),
        Duration::from_secs(config.venues_poll_interval_secs()),
        venues_tx,
        metrics.clone(),
    );
    poller.refresh();
    let poller_shutdown = shutdown_rx.clone();
    tokio::spawn(poller.run(poller_shutdown));

    // Location feed
    let (location_tx, location_rx) = watch::channel(None);
    let location_tx = Arc::new(location_tx);
    let location_config = LocationListenerConfig {
        port: config.location_listener_port(),
        enabled: config.location_listener_enabled(),
    };
    let location_metrics = metrics.clone();
    let location_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) =
            start_location_listener(location_config, location_tx, location_metrics, location_shutdown).await
        {
            error!(error = %e, "location_listener_error");
        }
    });

    // Session settings
    let (settings_tx, settings_rx) = watch::channel(SessionSettings::from_config(&config));
    let settings_tx = Arc::new(settings_tx);

    // Notices
    let (notices, notice_rx) = create_notice_channel(256, metrics.clone());
    let sink = NoticeSink::new(config.notices_file());
    let sink_task = tokio::spawn(sink.run(notice_rx));

    // Controller
    let api = Arc::new(HttpCheckinApi::new(&config)?);
    let inputs = ControllerInputs { location: location_rx, venues: venues_rx, settings: settings_rx };
    let controller = start_controller(&config, api, inputs, notices, metrics.clone());

    // Prometheus metrics and control endpoint (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_shutdown = shutdown_rx.clone();
        let site_id = config.site_id().to_string();
        let control = ControlSurface { client: controller.client(), settings_tx: settings_tx.clone() };
        tokio::spawn(async move {
            if let Err(e) =
                start_metrics_server(prometheus_port, prom_metrics, site_id, Some(control), prom_shutdown).await
            {
                error!(error = %e, "prometheus_metrics_server_error");
            }
        });
    }

    // Periodic metrics summary
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs().max(1);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    tokio::signal::ctrl_c().await.ok();
    info!("shutdown_signal_received");
    let _ = shutdown_tx.send(true);

    controller.shutdown().await;
    // Controller teardown dropped the last notice sender
    if let Err(e) = sink_task.await {
        error!(error = %e, "notice_sink_join_failed");
    }

    info!("proximity-checkin shutdown complete");
    Ok(())
}
