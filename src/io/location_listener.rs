//! Location feed TCP listener
//!
//! Listens on port 25900 for a platform location bridge.
//! Protocol, one message per line:
//! - `FIX <lat> <lng> [accuracy_m]` replaces the current fix
//! - `NOFIX` marks location as unavailable
//!
//! Only the latest value is kept; the controller reads it from a `watch`.

use crate::domain::types::{Coordinate, LocationFix};
use crate::infra::metrics::Metrics;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Location listener configuration
#[derive(Debug, Clone)]
pub struct LocationListenerConfig {
    pub port: u16,
    pub enabled: bool,
}

impl Default for LocationListenerConfig {
    fn default() -> Self {
        Self { port: 25900, enabled: true }
    }
}

/// A parsed protocol line
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LocationLine {
    Fix { coordinate: Coordinate, accuracy_m: Option<f64> },
    NoFix,
}

#[derive(Debug, Error, PartialEq)]
pub enum LineError {
    #[error("unknown command")]
    UnknownCommand,
    #[error("expected FIX <lat> <lng> [accuracy_m]")]
    MissingField,
    #[error("invalid number: {0}")]
    InvalidNumber(String),
    #[error("coordinate out of range")]
    OutOfRange,
    #[error("accuracy must be a non-negative finite number")]
    InvalidAccuracy,
}

fn parse_number(field: &str) -> Result<f64, LineError> {
    field.parse::<f64>().map_err(|_| LineError::InvalidNumber(field.to_string()))
}

/// Parse one protocol line (already trimmed)
pub fn parse_location_line(line: &str) -> Result<LocationLine, LineError> {
    let mut parts = line.split_whitespace();

    match parts.next() {
        Some("NOFIX") => Ok(LocationLine::NoFix),
        Some("FIX") => {
            let lat = parse_number(parts.next().ok_or(LineError::MissingField)?)?;
            let lng = parse_number(parts.next().ok_or(LineError::MissingField)?)?;
            let coordinate = Coordinate::new(lat, lng);
            if !coordinate.is_valid() {
                return Err(LineError::OutOfRange);
            }

            let accuracy_m = match parts.next() {
                Some(field) => {
                    let accuracy = parse_number(field)?;
                    if !accuracy.is_finite() || accuracy < 0.0 {
                        return Err(LineError::InvalidAccuracy);
                    }
                    Some(accuracy)
                }
                None => None,
            };

            Ok(LocationLine::Fix { coordinate, accuracy_m })
        }
        _ => Err(LineError::UnknownCommand),
    }
}

/// Start the location TCP listener
///
/// Every accepted connection may publish fixes; the most recent line from any
/// connection wins.
pub async fn start_location_listener(
    config: LocationListenerConfig,
    location_tx: Arc<watch::Sender<Option<LocationFix>>>,
    metrics: Arc<Metrics>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    if !config.enabled {
        info!("location_listener_disabled");
        return Ok(());
    }

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!(port = %config.port, "location_listener_started");

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("location_listener_shutdown");
                    return Ok(());
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((socket, addr)) => {
                        let tx = location_tx.clone();
                        let m = metrics.clone();
                        tokio::spawn(async move {
                            handle_location_connection(socket, addr, tx, m).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "location_listener_accept_failed");
                    }
                }
            }
        }
    }
}

async fn handle_location_connection(
    socket: tokio::net::TcpStream,
    addr: SocketAddr,
    location_tx: Arc<watch::Sender<Option<LocationFix>>>,
    metrics: Arc<Metrics>,
) {
    let peer = addr.to_string();
    debug!(peer = %peer, "location_connection_accepted");

    let mut lines = BufReader::new(socket).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse_location_line(line) {
            Ok(LocationLine::Fix { coordinate, accuracy_m }) => {
                metrics.record_fix_received();
                debug!(
                    lat = %coordinate.latitude,
                    lng = %coordinate.longitude,
                    accuracy_m = ?accuracy_m,
                    "location_fix_received"
                );
                location_tx.send_replace(Some(LocationFix::new(coordinate, accuracy_m)));
            }
            Ok(LocationLine::NoFix) => {
                info!(peer = %peer, "location_unavailable");
                location_tx.send_replace(None);
            }
            Err(e) => {
                metrics.record_fix_rejected();
                warn!(peer = %peer, line = %line, error = %e, "location_line_rejected");
            }
        }
    }

    debug!(peer = %peer, "location_connection_closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[test]
    fn test_parse_fix_with_accuracy() {
        let parsed = parse_location_line("FIX 40.7128 -74.0060 12.5").unwrap();
        assert_eq!(
            parsed,
            LocationLine::Fix { coordinate: Coordinate::new(40.7128, -74.0060), accuracy_m: Some(12.5) }
        );
    }

    #[test]
    fn test_parse_fix_without_accuracy() {
        let parsed = parse_location_line("FIX 1.5 2.5").unwrap();
        assert_eq!(parsed, LocationLine::Fix { coordinate: Coordinate::new(1.5, 2.5), accuracy_m: None });
    }

    #[test]
    fn test_parse_nofix() {
        assert_eq!(parse_location_line("NOFIX"), Ok(LocationLine::NoFix));
    }

    #[test]
    fn test_parse_rejects_bad_lines() {
        assert_eq!(parse_location_line("FIX 1.0"), Err(LineError::MissingField));
        assert_eq!(parse_location_line("FIX 91.0 0.0"), Err(LineError::OutOfRange));
        assert_eq!(parse_location_line("FIX NaN 0.0"), Err(LineError::OutOfRange));
        assert_eq!(parse_location_line("FIX 1.0 2.0 -3"), Err(LineError::InvalidAccuracy));
        assert_eq!(parse_location_line("MOVE 1 2"), Err(LineError::UnknownCommand));
        assert!(matches!(parse_location_line("FIX abc 2.0"), Err(LineError::InvalidNumber(_))));
    }

    #[tokio::test]
    async fn test_connection_publishes_latest_fix() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = watch::channel(None);
        let tx = Arc::new(tx);
        let metrics = Arc::new(Metrics::new());

        let server_metrics = metrics.clone();
        let server = tokio::spawn(async move {
            let (socket, peer) = listener.accept().await.unwrap();
            handle_location_connection(socket, peer, tx, server_metrics).await;
        });

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"FIX 10.0 20.0\nbogus\nFIX 11.0 21.0 4\n").await.unwrap();
        client.shutdown().await.unwrap();
        server.await.unwrap();

        let fix = rx.borrow_and_update().unwrap();
        assert_eq!(fix.coordinate, Coordinate::new(11.0, 21.0));
        assert_eq!(fix.accuracy_m, Some(4.0));

        let report = metrics.report();
        assert_eq!(report.fixes_received, 2);
        assert_eq!(report.fixes_rejected, 1);
    }
}
