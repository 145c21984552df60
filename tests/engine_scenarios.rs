//! End-to-end scenarios: venue file, controller, and the HTTP client

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use proximity_checkin::domain::{CheckinId, Coordinate, LocationFix};
use proximity_checkin::infra::{Config, Metrics};
use proximity_checkin::io::checkin_api::{
    ApiError, CheckinApi, CheckinRequest, CheckinResponse, HttpCheckinApi, UndoRequest, UndoResponse,
    COOLDOWN_ACTIVE,
};
use proximity_checkin::io::{create_notice_channel, load_venues, Notice};
use proximity_checkin::services::{start_controller, ControllerInputs, SessionSettings};
use std::convert::Infallible;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;

const M_PER_DEG: f64 = 111_194.926_644;

const VENUES: &str = r#"[
    {"id": "espresso", "name": "Corner Espresso", "latitude": 40.741895, "longitude": -73.989308},
    {"id": "books", "name": "Flatiron Books", "latitude": 40.742311, "longitude": -73.988120},
    {"id": "popup", "name": "Pop-up Market", "latitude": null, "longitude": null}
]"#;

#[derive(Default)]
struct RecordingApi {
    checkins: Mutex<Vec<CheckinRequest>>,
    undos: Mutex<Vec<UndoRequest>>,
}

#[async_trait]
impl CheckinApi for RecordingApi {
    async fn validate_checkin(&self, request: &CheckinRequest) -> Result<CheckinResponse, ApiError> {
        let mut checkins = self.checkins.lock();
        checkins.push(request.clone());
        Ok(CheckinResponse {
            success: true,
            checkin_id: Some(format!("ck-{}", checkins.len())),
            ..Default::default()
        })
    }

    async fn undo_checkin(&self, request: &UndoRequest) -> Result<UndoResponse, ApiError> {
        self.undos.lock().push(request.clone());
        Ok(UndoResponse { success: true, error: None })
    }
}

fn near_espresso(meters: f64) -> Coordinate {
    Coordinate::new(40.741895 + meters / M_PER_DEG, -73.989308)
}

#[tokio::test(start_paused = true)]
async fn test_dwell_checkin_and_undo_from_venue_file() {
    let mut venue_file = NamedTempFile::new().unwrap();
    venue_file.write_all(VENUES.as_bytes()).unwrap();
    venue_file.flush().unwrap();
    let venues = load_venues(venue_file.path()).unwrap();
    assert_eq!(venues.len(), 2);

    let metrics = Arc::new(Metrics::new());
    let api = Arc::new(RecordingApi::default());
    let position = near_espresso(3.0);

    let (location_tx, location) = watch::channel(Some(LocationFix::new(position, Some(6.0))));
    let (_venues_tx, venues) = watch::channel(venues.shared());
    let (_settings_tx, settings) =
        watch::channel(SessionSettings { auto_checkin_enabled: true, authenticated: true });
    let (notices, mut notice_rx) = create_notice_channel(32, metrics.clone());

    let handle = start_controller(
        &Config::default(),
        api.clone(),
        ControllerInputs { location, venues, settings },
        notices,
        metrics.clone(),
    );

    // Ten-second fixes for a little over the dwell threshold
    for _ in 0..16 {
        sleep(Duration::from_secs(10)).await;
        location_tx.send_replace(Some(LocationFix::new(position, Some(6.0))));
    }

    let requests = api.checkins.lock().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].venue_id, "espresso");
    assert_eq!(requests[0].venue_name, "Corner Espresso");
    assert_eq!(requests[0].location_accuracy, Some(6.0));

    let envelope = notice_rx.recv().await.unwrap();
    let Notice::CheckedIn { checkin_id, venue_name, .. } = envelope.notice else {
        panic!("expected a check-in notice");
    };
    assert_eq!(venue_name, "Corner Espresso");
    let checkin_id = checkin_id.unwrap();
    assert_eq!(checkin_id, CheckinId::new("ck-1"));

    let client = handle.client();
    assert!(client.undo(&checkin_id).await);
    assert_eq!(api.undos.lock()[0].checkin_id, "ck-1");
    assert!(!client.undo(&checkin_id).await);

    let snapshot = client.snapshot();
    assert!(snapshot.is_enabled);
    assert!(snapshot.is_active);
    assert!(snapshot.pending_undo.is_none());

    handle.shutdown().await;
    assert!(!client.snapshot().is_active);
}

/// Serve one fixed reply per request and capture the authorization header
async fn spawn_backend(status: StatusCode, body: &'static str) -> (String, Arc<Mutex<Vec<String>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_server = seen.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else { return };
            let seen = seen_server.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                    let seen = seen.clone();
                    async move {
                        let auth = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        let _ = req.into_body().collect().await;
                        seen.lock().push(auth);
                        let mut response = Response::new(Full::new(Bytes::from(body)));
                        *response.status_mut() = status;
                        Ok::<_, Infallible>(response)
                    }
                });
                let _ = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await;
            });
        }
    });

    (format!("http://{}", addr), seen)
}

fn config_for(base_url: &str) -> Config {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, "[api]\nbase_url = \"{}\"\naccess_token = \"user-jwt\"\ntimeout_ms = 2000\n", base_url).unwrap();
    file.flush().unwrap();
    Config::from_file(file.path()).unwrap()
}

fn sample_request() -> CheckinRequest {
    CheckinRequest {
        venue_id: "espresso".to_string(),
        venue_name: "Corner Espresso".to_string(),
        venue_lat: 40.741895,
        venue_lng: -73.989308,
        user_lat: 40.74192,
        user_lng: -73.989308,
        location_accuracy: None,
        is_automatic: true,
    }
}

#[tokio::test]
async fn test_http_client_reads_cooldown_body_on_error_status() {
    let (base_url, seen) = spawn_backend(
        StatusCode::TOO_MANY_REQUESTS,
        r#"{"success":false,"code":"COOLDOWN_ACTIVE","error":"Already checked in"}"#,
    )
    .await;
    let api = HttpCheckinApi::new(&config_for(&base_url)).unwrap();

    let response = api.validate_checkin(&sample_request()).await.unwrap();
    assert!(!response.success);
    assert_eq!(response.code.as_deref(), Some(COOLDOWN_ACTIVE));
    assert_eq!(seen.lock()[0], "Bearer user-jwt");
}

#[tokio::test]
async fn test_http_client_maps_unparseable_error_to_status() {
    let (base_url, _) = spawn_backend(StatusCode::BAD_GATEWAY, "upstream down").await;
    let api = HttpCheckinApi::new(&config_for(&base_url)).unwrap();

    let err = api.undo_checkin(&UndoRequest { checkin_id: "ck-1".to_string() }).await.unwrap_err();
    assert!(matches!(err, ApiError::Status { status: 502, .. }));
}
