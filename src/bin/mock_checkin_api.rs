//! Mock check-in backend
//!
//! Serves the validate and undo functions for local development.
//!
//! Behavior:
//! 1. Requires a bearer token (any value identifies the user)
//! 2. Re-checks the venue geofence with the same geo math as the engine
//! 3. Keeps a per-(user, venue) cooldown in memory and answers
//!    `COOLDOWN_ACTIVE` while it runs
//! 4. Undo deletes the check-in and lifts its cooldown
//!
//! Usage:
//!   cargo run --bin mock_checkin_api -- --port 54321

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use proximity_checkin::domain::{distance_meters, Coordinate};
use proximity_checkin::io::checkin_api::{
    CheckinRequest, CheckinResponse, UndoRequest, UndoResponse, COOLDOWN_ACTIVE,
};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use uuid::Uuid;

const VALIDATE_PATH: &str = "/functions/v1/validate-checkin";
const UNDO_PATH: &str = "/functions/v1/undo-checkin";

#[derive(Parser, Debug)]
#[command(name = "mock_checkin_api")]
#[command(about = "Mock check-in backend for local development")]
struct Args {
    /// HTTP port to listen on
    #[arg(short, long, default_value = "54321")]
    port: u16,

    /// Geofence radius enforced server-side (meters)
    #[arg(long, default_value = "30")]
    radius_m: f64,

    /// Per-venue cooldown (seconds)
    #[arg(long, default_value = "900")]
    cooldown_secs: u64,
}

#[derive(Debug, Clone)]
struct StoredCheckin {
    user: String,
    venue_id: String,
}

/// In-memory backend state
struct MockBackend {
    radius_m: f64,
    cooldown: Duration,
    last_checkin: FxHashMap<(String, String), Instant>,
    checkins: FxHashMap<String, StoredCheckin>,
}

impl MockBackend {
    fn new(radius_m: f64, cooldown: Duration) -> Self {
        Self { radius_m, cooldown, last_checkin: FxHashMap::default(), checkins: FxHashMap::default() }
    }

    fn validate(&mut self, user: &str, request: &CheckinRequest, now: Instant) -> (StatusCode, CheckinResponse) {
        let venue = Coordinate::new(request.venue_lat, request.venue_lng);
        let position = Coordinate::new(request.user_lat, request.user_lng);
        if !venue.is_valid() || !position.is_valid() {
            return (
                StatusCode::BAD_REQUEST,
                CheckinResponse {
                    code: Some("INVALID_COORDINATES".to_string()),
                    error: Some("Coordinates out of range".to_string()),
                    ..Default::default()
                },
            );
        }

        let distance = distance_meters(&position, &venue);
        if distance > self.radius_m {
            return (
                StatusCode::BAD_REQUEST,
                CheckinResponse {
                    code: Some("TOO_FAR".to_string()),
                    error: Some(format!("Too far from venue ({:.0}m)", distance)),
                    distance: Some(distance),
                    ..Default::default()
                },
            );
        }

        self.prune_cooldowns(now);
        let key = (user.to_string(), request.venue_id.clone());
        if self.last_checkin.contains_key(&key) {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                CheckinResponse {
                    code: Some(COOLDOWN_ACTIVE.to_string()),
                    error: Some("Already checked in here recently".to_string()),
                    distance: Some(distance),
                    ..Default::default()
                },
            );
        }

        let checkin_id = Uuid::now_v7().to_string();
        self.last_checkin.insert(key, now);
        self.checkins.insert(
            checkin_id.clone(),
            StoredCheckin { user: user.to_string(), venue_id: request.venue_id.clone() },
        );

        (
            StatusCode::OK,
            CheckinResponse {
                success: true,
                checkin_id: Some(checkin_id),
                distance: Some(distance),
                ..Default::default()
            },
        )
    }

    /// Forget cooldowns that have run out
    fn prune_cooldowns(&mut self, now: Instant) {
        let cooldown = self.cooldown;
        self.last_checkin.retain(|_, last| now.duration_since(*last) < cooldown);
    }

    fn undo(&mut self, user: &str, request: &UndoRequest) -> (StatusCode, UndoResponse) {
        let owned = self.checkins.get(&request.checkin_id).is_some_and(|c| c.user == user);
        if !owned {
            return (
                StatusCode::NOT_FOUND,
                UndoResponse { success: false, error: Some("Check-in not found".to_string()) },
            );
        }

        if let Some(stored) = self.checkins.remove(&request.checkin_id) {
            self.last_checkin.remove(&(stored.user, stored.venue_id));
        }
        (StatusCode::OK, UndoResponse { success: true, error: None })
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let json = serde_json::to_string(body).unwrap_or_else(|_| r#"{"success":false}"#.to_string());
    let mut response = Response::new(Full::new(Bytes::from(json)));
    *response.status_mut() = status;
    response.headers_mut().insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn bearer_user(req: &Request<hyper::body::Incoming>) -> Option<String> {
    let value = req.headers().get(AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    backend: Arc<Mutex<MockBackend>>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    if method != Method::POST || (path != VALIDATE_PATH && path != UNDO_PATH) {
        let body = UndoResponse { success: false, error: Some("Not Found".to_string()) };
        return Ok(json_response(StatusCode::NOT_FOUND, &body));
    }

    let Some(user) = bearer_user(&req) else {
        let body = UndoResponse { success: false, error: Some("Unauthorized".to_string()) };
        return Ok(json_response(StatusCode::UNAUTHORIZED, &body));
    };

    let bytes = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            let body = UndoResponse { success: false, error: Some(e.to_string()) };
            return Ok(json_response(StatusCode::BAD_REQUEST, &body));
        }
    };

    if path == VALIDATE_PATH {
        let request: CheckinRequest = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(e) => {
                let body = CheckinResponse { error: Some(e.to_string()), ..Default::default() };
                return Ok(json_response(StatusCode::BAD_REQUEST, &body));
            }
        };
        let (status, body) = backend.lock().validate(&user, &request, Instant::now());
        println!(
            "[MOCK] validate venue={} user={} status={} code={:?}",
            request.venue_id,
            user,
            status.as_u16(),
            body.code
        );
        Ok(json_response(status, &body))
    } else {
        let request: UndoRequest = match serde_json::from_slice(&bytes) {
            Ok(request) => request,
            Err(e) => {
                let body = UndoResponse { success: false, error: Some(e.to_string()) };
                return Ok(json_response(StatusCode::BAD_REQUEST, &body));
            }
        };
        let (status, body) = backend.lock().undo(&user, &request);
        println!("[MOCK] undo checkin={} status={}", request.checkin_id, status.as_u16());
        Ok(json_response(status, &body))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = TcpListener::bind(addr).await?;
    let backend = Arc::new(Mutex::new(MockBackend::new(args.radius_m, Duration::from_secs(args.cooldown_secs))));

    println!("[MOCK] Check-in backend listening on {}", addr);
    println!("[MOCK] radius={}m cooldown={}s", args.radius_m, args.cooldown_secs);

    loop {
        let (stream, peer) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let backend = backend.clone();

        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, backend.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                eprintln!("[MOCK] Connection error from {}: {}", peer, e);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const M_PER_DEG: f64 = 111_194.926_644;

    fn request(meters_away: f64) -> CheckinRequest {
        CheckinRequest {
            venue_id: "v1".to_string(),
            venue_name: "Cafe".to_string(),
            venue_lat: 40.0,
            venue_lng: -73.0,
            user_lat: 40.0 + meters_away / M_PER_DEG,
            user_lng: -73.0,
            location_accuracy: Some(5.0),
            is_automatic: true,
        }
    }

    fn backend() -> MockBackend {
        MockBackend::new(30.0, Duration::from_secs(900))
    }

    #[test]
    fn test_accepts_then_cools_down() {
        let mut backend = backend();
        let now = Instant::now();

        let (status, first) = backend.validate("u1", &request(3.0), now);
        assert_eq!(status, StatusCode::OK);
        assert!(first.success);
        assert!(first.checkin_id.is_some());

        let (status, second) = backend.validate("u1", &request(3.0), now + Duration::from_secs(60));
        assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(second.code.as_deref(), Some(COOLDOWN_ACTIVE));

        // Other users are unaffected
        let (status, _) = backend.validate("u2", &request(3.0), now + Duration::from_secs(60));
        assert_eq!(status, StatusCode::OK);

        let (status, _) = backend.validate("u1", &request(3.0), now + Duration::from_secs(901));
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn test_expired_cooldowns_are_pruned() {
        let mut backend = backend();
        let now = Instant::now();
        backend.validate("u1", &request(3.0), now);
        backend.validate("u2", &request(3.0), now + Duration::from_secs(600));
        assert_eq!(backend.last_checkin.len(), 2);

        // u1's entry has lapsed; u2's is still running
        backend.validate("u3", &request(3.0), now + Duration::from_secs(902));
        assert_eq!(backend.last_checkin.len(), 2);
        assert!(!backend.last_checkin.contains_key(&("u1".to_string(), "v1".to_string())));
    }

    #[test]
    fn test_rejects_outside_geofence() {
        let mut backend = backend();
        let (status, response) = backend.validate("u1", &request(45.0), Instant::now());
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(response.code.as_deref(), Some("TOO_FAR"));
    }

    #[test]
    fn test_undo_lifts_cooldown() {
        let mut backend = backend();
        let now = Instant::now();
        let (_, response) = backend.validate("u1", &request(3.0), now);
        let checkin_id = response.checkin_id.unwrap();

        let (status, _) = backend.undo("u2", &UndoRequest { checkin_id: checkin_id.clone() });
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, undo) = backend.undo("u1", &UndoRequest { checkin_id: checkin_id.clone() });
        assert_eq!(status, StatusCode::OK);
        assert!(undo.success);

        let (status, _) = backend.validate("u1", &request(3.0), now + Duration::from_secs(5));
        assert_eq!(status, StatusCode::OK);

        let (status, _) = backend.undo("u1", &UndoRequest { checkin_id });
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
