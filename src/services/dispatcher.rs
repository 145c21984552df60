//! Check-in dispatch worker - runs backend calls off the engine loop
//!
//! The controller enqueues validated dwell triggers and undo requests; the
//! worker performs the network call and hands the classified result back
//! on a second channel. The engine never awaits the network directly.

use crate::domain::types::CheckinId;
use crate::infra::metrics::Metrics;
use crate::io::checkin_api::{
    ApiError, CheckinApi, CheckinRequest, CheckinResponse, UndoRequest, UndoResponse,
    COOLDOWN_ACTIVE,
};
use crate::services::engine::{DispatchJob, UndoJob};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Classified answer to a check-in call
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// Accepted. The id is absent if the server did not return one, in
    /// which case no undo is possible.
    CheckedIn { checkin_id: Option<CheckinId> },
    /// Server-side per-venue cooldown; not surfaced to the user
    Cooldown,
    /// Server answered and refused
    Rejected { code: Option<String>, message: Option<String> },
    /// Transport, status or decode failure
    Failed { error: String },
}

impl DispatchOutcome {
    pub fn from_response(response: Result<CheckinResponse, ApiError>) -> Self {
        match response {
            Ok(r) if r.success => DispatchOutcome::CheckedIn {
                checkin_id: r.checkin_id.filter(|id| !id.is_empty()).map(CheckinId::new),
            },
            Ok(r) if r.code.as_deref() == Some(COOLDOWN_ACTIVE) => DispatchOutcome::Cooldown,
            Ok(r) => DispatchOutcome::Rejected { code: r.code, message: r.error },
            Err(e) => DispatchOutcome::Failed { error: e.to_string() },
        }
    }
}

/// Work item for the dispatch worker
#[derive(Debug)]
pub enum WorkerJob {
    Dispatch(DispatchJob),
    Undo { job: UndoJob, reply: oneshot::Sender<bool> },
}

/// Completed work handed back to the controller
#[derive(Debug)]
pub enum WorkerResult {
    Dispatch { job: DispatchJob, outcome: DispatchOutcome },
    Undo { job: UndoJob, success: bool, error: Option<String>, reply: oneshot::Sender<bool> },
}

/// Build the request body for a triggered dwell
pub fn checkin_request(job: &DispatchJob) -> CheckinRequest {
    CheckinRequest {
        venue_id: job.dwell.venue_id.as_str().to_string(),
        venue_name: job.dwell.venue_name.clone(),
        venue_lat: job.dwell.venue_location.latitude,
        venue_lng: job.dwell.venue_location.longitude,
        user_lat: job.user_fix.coordinate.latitude,
        user_lng: job.user_fix.coordinate.longitude,
        location_accuracy: job.user_fix.accuracy_m,
        is_automatic: true,
    }
}

fn undo_result(response: Result<UndoResponse, ApiError>) -> (bool, Option<String>) {
    match response {
        Ok(r) if r.success => (true, None),
        Ok(r) => (false, r.error),
        Err(e) => (false, Some(e.to_string())),
    }
}

/// Worker that performs check-in and undo calls in arrival order
pub struct DispatchWorker {
    api: Arc<dyn CheckinApi>,
    job_rx: mpsc::Receiver<WorkerJob>,
    result_tx: mpsc::Sender<WorkerResult>,
    metrics: Arc<Metrics>,
}

impl DispatchWorker {
    pub fn new(
        api: Arc<dyn CheckinApi>,
        job_rx: mpsc::Receiver<WorkerJob>,
        result_tx: mpsc::Sender<WorkerResult>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { api, job_rx, result_tx, metrics }
    }

    /// Run until the job channel closes or the controller stops listening
    pub async fn run(mut self) {
        info!("dispatch_worker_started");

        while let Some(job) = self.job_rx.recv().await {
            let result = match job {
                WorkerJob::Dispatch(job) => self.dispatch(job).await,
                WorkerJob::Undo { job, reply } => self.undo(job, reply).await,
            };

            if self.result_tx.send(result).await.is_err() {
                debug!("dispatch_worker_result_channel_closed");
                break;
            }
        }

        info!("dispatch_worker_stopped");
    }

    async fn dispatch(&self, job: DispatchJob) -> WorkerResult {
        let request = checkin_request(&job);
        let start = Instant::now();
        let response = self.api.validate_checkin(&request).await;
        let latency_us = start.elapsed().as_micros() as u64;
        self.metrics.record_dispatch_latency(latency_us);

        let outcome = DispatchOutcome::from_response(response);
        info!(
            venue_id = %job.dwell.venue_id,
            latency_us = %latency_us,
            outcome = ?outcome,
            "checkin_dispatched"
        );

        WorkerResult::Dispatch { job, outcome }
    }

    async fn undo(&self, job: UndoJob, reply: oneshot::Sender<bool>) -> WorkerResult {
        let request = UndoRequest { checkin_id: job.checkin_id.as_str().to_string() };
        let (success, error) = undo_result(self.api.undo_checkin(&request).await);
        if !success {
            warn!(checkin_id = %job.checkin_id, error = ?error, "undo_call_failed");
        }
        WorkerResult::Undo { job, success, error, reply }
    }
}

/// Create the job and result channels plus the worker to spawn
///
/// Returns the job sender and result receiver (for the controller) and the worker
pub fn create_dispatch_worker(
    api: Arc<dyn CheckinApi>,
    metrics: Arc<Metrics>,
    buffer_size: usize,
) -> (mpsc::Sender<WorkerJob>, mpsc::Receiver<WorkerResult>, DispatchWorker) {
    let (job_tx, job_rx) = mpsc::channel(buffer_size);
    let (result_tx, result_rx) = mpsc::channel(buffer_size);
    let worker = DispatchWorker::new(api, job_rx, result_tx, metrics);
    (job_tx, result_rx, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{Coordinate, DwellState, LocationFix, VenueId};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::time::Instant as TokioInstant;

    struct FixedApi {
        checkin: CheckinResponse,
        requests: Mutex<Vec<CheckinRequest>>,
    }

    #[async_trait]
    impl CheckinApi for FixedApi {
        async fn validate_checkin(&self, request: &CheckinRequest) -> Result<CheckinResponse, ApiError> {
            self.requests.lock().push(request.clone());
            Ok(self.checkin.clone())
        }

        async fn undo_checkin(&self, request: &UndoRequest) -> Result<UndoResponse, ApiError> {
            if request.checkin_id == "c1" {
                Ok(UndoResponse { success: true, error: None })
            } else {
                Ok(UndoResponse { success: false, error: Some("not found".to_string()) })
            }
        }
    }

    fn job() -> DispatchJob {
        let now = TokioInstant::now();
        DispatchJob {
            generation: 3,
            dwell: DwellState {
                venue_id: VenueId::new("v1"),
                venue_name: "Cafe".to_string(),
                venue_location: Coordinate::new(40.0, -73.0),
                entered_at: now,
                last_confidence: 0.9,
            },
            user_fix: LocationFix {
                coordinate: Coordinate::new(40.00001, -73.0),
                accuracy_m: Some(8.0),
                received_at: now,
            },
        }
    }

    #[test]
    fn test_outcome_classification() {
        let ok = CheckinResponse { success: true, checkin_id: Some("c1".to_string()), ..Default::default() };
        assert_eq!(
            DispatchOutcome::from_response(Ok(ok)),
            DispatchOutcome::CheckedIn { checkin_id: Some(CheckinId::new("c1")) }
        );

        let no_id = CheckinResponse { success: true, checkin_id: Some(String::new()), ..Default::default() };
        assert_eq!(
            DispatchOutcome::from_response(Ok(no_id)),
            DispatchOutcome::CheckedIn { checkin_id: None }
        );

        let cooldown = CheckinResponse { code: Some(COOLDOWN_ACTIVE.to_string()), ..Default::default() };
        assert_eq!(DispatchOutcome::from_response(Ok(cooldown)), DispatchOutcome::Cooldown);

        let far = CheckinResponse {
            code: Some("TOO_FAR".to_string()),
            error: Some("Too far from venue".to_string()),
            ..Default::default()
        };
        assert!(matches!(DispatchOutcome::from_response(Ok(far)), DispatchOutcome::Rejected { .. }));

        let status = ApiError::Status { status: 502, body: "bad gateway".to_string() };
        assert!(matches!(DispatchOutcome::from_response(Err(status)), DispatchOutcome::Failed { .. }));
    }

    #[test]
    fn test_request_uses_venue_and_user_positions() {
        let request = checkin_request(&job());
        assert_eq!(request.venue_id, "v1");
        assert_eq!(request.venue_lat, 40.0);
        assert_eq!(request.user_lat, 40.00001);
        assert_eq!(request.location_accuracy, Some(8.0));
        assert!(request.is_automatic);
    }

    #[tokio::test]
    async fn test_worker_round_trips_jobs() {
        let api = Arc::new(FixedApi {
            checkin: CheckinResponse { success: true, checkin_id: Some("c1".to_string()), ..Default::default() },
            requests: Mutex::new(Vec::new()),
        });
        let metrics = Arc::new(Metrics::new());
        let (job_tx, mut result_rx, worker) = create_dispatch_worker(api.clone(), metrics, 8);
        let handle = tokio::spawn(worker.run());

        job_tx.send(WorkerJob::Dispatch(job())).await.unwrap();
        match result_rx.recv().await.unwrap() {
            WorkerResult::Dispatch { job, outcome } => {
                assert_eq!(job.generation, 3);
                assert!(matches!(outcome, DispatchOutcome::CheckedIn { checkin_id: Some(_) }));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        let (reply, _reply_rx) = oneshot::channel();
        let undo = UndoJob { generation: 3, checkin_id: CheckinId::new("c2"), venue_name: "Cafe".to_string() };
        job_tx.send(WorkerJob::Undo { job: undo, reply }).await.unwrap();
        match result_rx.recv().await.unwrap() {
            WorkerResult::Undo { success, error, .. } => {
                assert!(!success);
                assert_eq!(error.as_deref(), Some("not found"));
            }
            other => panic!("unexpected result: {:?}", other),
        }

        drop(job_tx);
        handle.await.unwrap();
        assert_eq!(api.requests.lock().len(), 1);
    }
}
