//! Check-in controller - the single task that owns engine state
//!
//! The controller wires the decision engine to the outside world:
//! - Location, venue and settings updates arrive on `watch` channels
//!   (latest value wins, nothing is buffered)
//! - The tick timer exists only while the settings gate is open
//! - Check-in and undo calls go to the dispatch worker; their results come
//!   back on a channel and are applied here, never concurrently with a tick
//! - The engine snapshot is republished after every state change


use crate::domain::types::{CheckinId, LocationFix, VenueSet};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::checkin_api::CheckinApi;
use crate::io::notices::NoticeSender;
use crate::services::dispatcher::{create_dispatch_worker, DispatchOutcome, WorkerJob, WorkerResult};
use crate::services::engine::{CheckinEngine, Effect, EngineSnapshot};
use crate::services::settings_gate::{GateChange, GateInputs, SettingsGate};
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Capacity of the dispatch job and result queues
const DISPATCH_QUEUE_SIZE: usize = 16;

/// User-level settings that gate the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSettings {
    pub auto_checkin_enabled: bool,
    pub authenticated: bool,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            auto_checkin_enabled: config.auto_checkin_enabled(),
            authenticated: config.is_authenticated(),
        }
    }
}

/// Channels the controller reads its inputs from
pub struct ControllerInputs {
    pub location: watch::Receiver<Option<LocationFix>>,
    pub venues: watch::Receiver<Arc<VenueSet>>,
    pub settings: watch::Receiver<SessionSettings>,
}

#[derive(Debug)]
enum ControllerCmd {
    Undo { checkin_id: CheckinId, reply: oneshot::Sender<bool> },
    Shutdown,
}

/// Cloneable access to a running controller
#[derive(Clone)]
pub struct ControllerClient {
    cmd_tx: mpsc::Sender<ControllerCmd>,
    snapshot_rx: watch::Receiver<EngineSnapshot>,
}

impl ControllerClient {
    /// Reverse the pending check-in. Resolves once the backend answered;
    /// `false` if there was nothing to undo or the call failed.
    pub async fn undo(&self, checkin_id: &CheckinId) -> bool {
        let (reply, reply_rx) = oneshot::channel();
        let cmd = ControllerCmd::Undo { checkin_id: checkin_id.clone(), reply };
        if self.cmd_tx.send(cmd).await.is_err() {
            return false;
        }
        reply_rx.await.unwrap_or(false)
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_rx.clone()
    }
}

/// Owner handle for the controller task
pub struct ControllerHandle {
    client: ControllerClient,
    task: JoinHandle<()>,
}

impl ControllerHandle {
    pub fn client(&self) -> ControllerClient {
        self.client.clone()
    }

    pub async fn undo(&self, checkin_id: &CheckinId) -> bool {
        self.client.undo(checkin_id).await
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.client.snapshot()
    }

    /// Stop the controller and wait for it to tear down
    pub async fn shutdown(self) {
        let _ = self.client.cmd_tx.send(ControllerCmd::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!(error = %e, "controller_join_failed");
        }
    }
}

/// Spawn the dispatch worker and the controller task
pub fn start_controller(
    config: &Config,
    api: Arc<dyn CheckinApi>,
    inputs: ControllerInputs,
    notices: NoticeSender,
    metrics: Arc<Metrics>,
) -> ControllerHandle {
    let (job_tx, result_rx, worker) = create_dispatch_worker(api, metrics.clone(), DISPATCH_QUEUE_SIZE);
    tokio::spawn(worker.run());

    let (cmd_tx, cmd_rx) = mpsc::channel(8);
    let (snapshot_tx, snapshot_rx) = watch::channel(EngineSnapshot::default());

    let controller = Controller {
        engine: CheckinEngine::from_config(config, metrics.clone()),
        gate: SettingsGate::new(),
        settings: *inputs.settings.borrow(),
        location: *inputs.location.borrow(),
        venues: inputs.venues.borrow().clone(),
        tick_interval: config.tick_interval(),
        ticker: None,
        job_tx,
        notices,
        snapshot_tx,
        metrics,
    };
    let task = tokio::spawn(controller.run(inputs, cmd_rx, result_rx));

    ControllerHandle { client: ControllerClient { cmd_tx, snapshot_rx }, task }
}

struct Controller {
    engine: CheckinEngine,
    gate: SettingsGate,
    settings: SessionSettings,
    location: Option<LocationFix>,
    venues: Arc<VenueSet>,
    tick_interval: Duration,
    ticker: Option<Interval>,
    job_tx: mpsc::Sender<WorkerJob>,
    notices: NoticeSender,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    metrics: Arc<Metrics>,
}

impl Controller {
    async fn run(
        mut self,
        mut inputs: ControllerInputs,
        mut cmd_rx: mpsc::Receiver<ControllerCmd>,
        mut result_rx: mpsc::Receiver<WorkerResult>,
    ) {
        info!(
            tick_secs = %self.tick_interval.as_secs(),
            venues = %self.venues.len(),
            "controller_started"
        );

        // Closed watch channels keep their last value
        let mut location_open = true;
        let mut venues_open = true;
        let mut settings_open = true;

        self.refresh_gate();
        self.publish();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(ControllerCmd::Undo { checkin_id, reply }) => self.handle_undo(checkin_id, reply),
                        Some(ControllerCmd::Shutdown) | None => break,
                    }
                }
                Some(result) = result_rx.recv() => {
                    self.handle_result(result);
                }
                changed = inputs.settings.changed(), if settings_open => {
                    match changed {
                        Ok(()) => {
                            self.settings = *inputs.settings.borrow_and_update();
                            debug!(
                                enabled = %self.settings.auto_checkin_enabled,
                                authenticated = %self.settings.authenticated,
                                "settings_changed"
                            );
                            self.refresh_gate();
                        }
                        Err(_) => settings_open = false,
                    }
                }
                changed = inputs.venues.changed(), if venues_open => {
                    match changed {
                        Ok(()) => {
                            self.venues = inputs.venues.borrow_and_update().clone();
                            debug!(venues = %self.venues.len(), "venues_changed");
                            self.refresh_gate();
                        }
                        Err(_) => venues_open = false,
                    }
                }
                changed = inputs.location.changed(), if location_open => {
                    match changed {
                        Ok(()) => {
                            self.location = *inputs.location.borrow_and_update();
                            self.refresh_gate();
                        }
                        Err(_) => location_open = false,
                    }
                }
                _ = next_tick(&mut self.ticker) => {
                    self.on_tick();
                }
                _ = sleep_until_opt(self.engine.undo_deadline()) => {
                    let effects = self.engine.expire_undo(Instant::now());
                    self.apply(effects);
                }
            }

            self.publish();
        }

        self.teardown();
        info!("controller_stopped");
    }

    fn refresh_gate(&mut self) {
        let inputs = GateInputs {
            enabled: self.settings.auto_checkin_enabled,
            authenticated: self.settings.authenticated,
            has_fix: self.location.is_some(),
            venue_count: self.venues.len(),
        };

        match self.gate.evaluate(&inputs) {
            GateChange::Opened => {
                // First tick fires immediately
                let mut ticker = interval(self.tick_interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ticker = Some(ticker);
                self.metrics.set_engine_active(true);
            }
            GateChange::Closed(reason) | GateChange::Reblocked(reason) => {
                self.ticker = None;
                self.metrics.set_engine_active(false);
                if reason.requires_full_reset() {
                    self.engine.reset();
                } else {
                    self.engine.clear_dwell();
                }
            }
            GateChange::Unchanged => {}
        }
    }

    fn on_tick(&mut self) {
        let effects = self.engine.tick(Instant::now(), self.location.as_ref(), &self.venues);
        self.apply(effects);
    }

    fn handle_undo(&mut self, checkin_id: CheckinId, reply: oneshot::Sender<bool>) {
        let Some(job) = self.engine.begin_undo(&checkin_id) else {
            debug!(checkin_id = %checkin_id, "undo_ignored_no_pending_record");
            let _ = reply.send(false);
            return;
        };

        let rejected = match self.job_tx.try_send(WorkerJob::Undo { job, reply }) {
            Ok(()) => None,
            Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => Some(job),
        };
        if let Some(WorkerJob::Undo { job, reply }) = rejected {
            warn!(checkin_id = %job.checkin_id, "undo_enqueue_failed");
            let effects = self.engine.on_undo_outcome(&job, false, Some("undo could not be sent".to_string()));
            self.apply(effects);
            let _ = reply.send(false);
        }
    }

    fn handle_result(&mut self, result: WorkerResult) {
        match result {
            WorkerResult::Dispatch { job, outcome } => {
                let effects = self.engine.on_dispatch_outcome(Instant::now(), &job, outcome);
                self.apply(effects);
            }
            WorkerResult::Undo { job, success, error, reply } => {
                let effects = self.engine.on_undo_outcome(&job, success, error);
                self.apply(effects);
                let _ = reply.send(success);
            }
        }
    }

    fn apply(&mut self, effects: Vec<Effect>) {
        for effect in effects {
            match effect {
                Effect::Notify(notice) => self.notices.send(notice),
                Effect::Dispatch(job) => {
                    let rejected = match self.job_tx.try_send(WorkerJob::Dispatch(job)) {
                        Ok(()) => None,
                        Err(TrySendError::Full(job)) | Err(TrySendError::Closed(job)) => Some(job),
                    };
                    if let Some(WorkerJob::Dispatch(job)) = rejected {
                        warn!(venue_id = %job.dwell.venue_id, "dispatch_enqueue_failed");
                        let outcome = DispatchOutcome::Failed {
                            error: "check-in could not be sent".to_string(),
                        };
                        let effects = self.engine.on_dispatch_outcome(Instant::now(), &job, outcome);
                        self.apply(effects);
                    }
                }
            }
        }
    }

    fn publish(&self) {
        let snapshot = self.engine.snapshot(self.settings.auto_checkin_enabled, self.ticker.is_some());
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                return false;
            }
            *current = snapshot;
            true
        });
    }

    fn teardown(&mut self) {
        self.ticker = None;
        self.engine.reset();
        self.metrics.set_engine_active(false);
        self.publish();
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending::<()>().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending::<()>().await,
    }
}
