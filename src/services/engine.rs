//! Check-in decision engine
//!
//! Owns every piece of mutable check-in state: the dwell tracker, the
//! suppression marker, the in-flight marker and the pending undo record.
//! Methods are synchronous and return the effects the caller must perform
//! (network calls, notices); nothing here touches I/O.
//!
//! Results of network calls carry the `generation` they were issued under.
//! A full reset bumps the generation, so results that arrive after the
//! engine was torn down are ignored.

use crate::domain::types::{CheckinId, DwellState, LocationFix, UndoableCheckIn, VenueId, VenueSet};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::notices::Notice;
use crate::services::dispatcher::DispatchOutcome;
use crate::services::dwell_tracker::{DwellPolicy, DwellTracker, DwellTransition};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Timers around the dwell decision
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineTimings {
    /// How long the undo action is offered on the notice
    pub undo_window: Duration,
    /// Hard lifetime of the undo record
    pub undo_expiry: Duration,
}

impl Default for EngineTimings {
    fn default() -> Self {
        Self {
            undo_window: Duration::from_secs(10),
            undo_expiry: Duration::from_secs(300),
        }
    }
}

impl EngineTimings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            undo_window: config.undo_window(),
            undo_expiry: config.undo_expiry(),
        }
    }
}

/// Validated check-in call to perform
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchJob {
    pub generation: u64,
    pub dwell: DwellState,
    pub user_fix: LocationFix,
}

/// Undo call to perform
#[derive(Debug, Clone, PartialEq)]
pub struct UndoJob {
    pub generation: u64,
    pub checkin_id: CheckinId,
    pub venue_name: String,
}

/// Side effect requested by the engine
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Dispatch(DispatchJob),
    Notify(Notice),
}

/// What the UI layer sees
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EngineSnapshot {
    /// The user setting, independent of the other gate conditions
    pub is_enabled: bool,
    /// The tick timer is armed
    pub is_active: bool,
    pub dwelling_venue: Option<VenueId>,
    pub pending_undo: Option<UndoableCheckIn>,
}

#[derive(Debug, Clone)]
struct PendingUndo {
    record: UndoableCheckIn,
    expires_at: Instant,
    in_progress: bool,
}

pub struct CheckinEngine {
    tracker: DwellTracker,
    timings: EngineTimings,
    /// Venue most recently checked into; blocks a new dwell there
    last_checked_in: Option<VenueId>,
    /// Venue whose check-in call has not answered yet
    in_flight: Option<VenueId>,
    pending_undo: Option<PendingUndo>,
    generation: u64,
    metrics: Arc<Metrics>,
}

impl CheckinEngine {
    pub fn new(policy: DwellPolicy, timings: EngineTimings, metrics: Arc<Metrics>) -> Self {
        Self {
            tracker: DwellTracker::new(policy),
            timings,
            last_checked_in: None,
            in_flight: None,
            pending_undo: None,
            generation: 0,
            metrics,
        }
    }

    pub fn from_config(config: &Config, metrics: Arc<Metrics>) -> Self {
        Self::new(DwellPolicy::from_config(config), EngineTimings::from_config(config), metrics)
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn current_dwell(&self) -> Option<&DwellState> {
        self.tracker.current()
    }

    pub fn last_checked_in(&self) -> Option<&VenueId> {
        self.last_checked_in.as_ref()
    }

    pub fn pending_undo(&self) -> Option<&UndoableCheckIn> {
        self.pending_undo.as_ref().map(|p| &p.record)
    }

    /// When the pending undo record lapses; `None` while an undo call is running
    pub fn undo_deadline(&self) -> Option<Instant> {
        self.pending_undo.as_ref().filter(|p| !p.in_progress).map(|p| p.expires_at)
    }

    pub fn snapshot(&self, is_enabled: bool, is_active: bool) -> EngineSnapshot {
        EngineSnapshot {
            is_enabled,
            is_active,
            dwelling_venue: self.tracker.current().map(|d| d.venue_id.clone()),
            pending_undo: self.pending_undo().cloned(),
        }
    }

    /// Evaluate one tick against the latest fix
    pub fn tick(&mut self, now: Instant, fix: Option<&LocationFix>, venues: &VenueSet) -> Vec<Effect> {
        self.metrics.record_tick();

        // The latest pushed fix stands until the source replaces or withdraws it
        let Some(fix) = fix else {
            self.drop_dwell("no_fix");
            return Vec::new();
        };

        if venues.is_empty() {
            self.drop_dwell("no_venues");
            return Vec::new();
        }

        let last_checked_in = self.last_checked_in.as_ref();
        let in_flight = self.in_flight.as_ref();
        let transition = self.tracker.evaluate(now, &fix.coordinate, venues, |id| {
            last_checked_in == Some(id) || in_flight == Some(id)
        });

        match transition {
            DwellTransition::Idle { cleared } => {
                if let Some(dwell) = cleared {
                    self.record_reset(&dwell, "left_active_zone");
                }
                Vec::new()
            }
            DwellTransition::Suppressed { venue_id, cleared } => {
                debug!(venue_id = %venue_id, "dwell_suppressed");
                if let Some(dwell) = cleared {
                    self.record_reset(&dwell, "suppressed");
                }
                Vec::new()
            }
            DwellTransition::Started { dwell, replaced } => {
                if let Some(dwell) = replaced {
                    self.record_reset(&dwell, "replaced");
                }
                // Entering another venue lifts the block on the last one
                if self.last_checked_in.as_ref().is_some_and(|id| *id != dwell.venue_id) {
                    if let Some(previous) = self.last_checked_in.take() {
                        debug!(venue_id = %previous, entered = %dwell.venue_id, "suppression_lifted");
                    }
                }
                self.metrics.record_dwell_started();
                Vec::new()
            }
            DwellTransition::Continued { venue_id, elapsed, confidence } => {
                debug!(
                    venue_id = %venue_id,
                    elapsed_secs = %elapsed.as_secs(),
                    confidence = %format!("{:.3}", confidence),
                    fix_age_secs = %now.saturating_duration_since(fix.received_at).as_secs(),
                    "dwell_continued"
                );
                Vec::new()
            }
            DwellTransition::Triggered(dwell) => {
                info!(
                    venue_id = %dwell.venue_id,
                    venue_name = %dwell.venue_name,
                    generation = %self.generation,
                    "checkin_triggered"
                );
                self.in_flight = Some(dwell.venue_id.clone());
                self.metrics.record_dispatch();
                vec![Effect::Dispatch(DispatchJob {
                    generation: self.generation,
                    dwell,
                    user_fix: *fix,
                })]
            }
        }
    }

    /// Apply the answer to a check-in call
    pub fn on_dispatch_outcome(
        &mut self,
        now: Instant,
        job: &DispatchJob,
        outcome: DispatchOutcome,
    ) -> Vec<Effect> {
        if job.generation != self.generation {
            debug!(
                venue_id = %job.dwell.venue_id,
                job_generation = %job.generation,
                generation = %self.generation,
                "dispatch_outcome_stale"
            );
            return Vec::new();
        }

        let venue_id = &job.dwell.venue_id;
        let venue_name = &job.dwell.venue_name;
        if self.in_flight.as_ref() == Some(venue_id) {
            self.in_flight = None;
        }
        self.tracker.clear_for(venue_id);

        match outcome {
            DispatchOutcome::CheckedIn { checkin_id } => {
                self.metrics.record_checkin_succeeded();
                self.last_checked_in = Some(venue_id.clone());

                if let Some(id) = &checkin_id {
                    let record = UndoableCheckIn {
                        checkin_id: id.clone(),
                        venue_id: venue_id.clone(),
                        venue_name: venue_name.clone(),
                        created_at: Utc::now(),
                    };
                    self.pending_undo = Some(PendingUndo {
                        record,
                        expires_at: now + self.timings.undo_expiry,
                        in_progress: false,
                    });
                }

                info!(
                    venue_id = %venue_id,
                    venue_name = %venue_name,
                    checkin_id = ?checkin_id.as_ref().map(|c| c.as_str()),
                    "checkin_succeeded"
                );

                vec![Effect::Notify(Notice::CheckedIn {
                    venue_id: venue_id.clone(),
                    venue_name: venue_name.clone(),
                    checkin_id,
                    undo_window_secs: self.timings.undo_window.as_secs(),
                })]
            }
            DispatchOutcome::Cooldown => {
                self.metrics.record_cooldown_rejection();
                debug!(venue_id = %venue_id, "checkin_cooldown_active");
                Vec::new()
            }
            DispatchOutcome::Rejected { code, message } => {
                self.metrics.record_checkin_failure();
                let reason = message
                    .or(code)
                    .unwrap_or_else(|| "check-in was not accepted".to_string());
                warn!(venue_id = %venue_id, reason = %reason, "checkin_rejected");
                vec![Effect::Notify(Notice::CheckinFailed {
                    venue_id: venue_id.clone(),
                    venue_name: venue_name.clone(),
                    reason,
                })]
            }
            DispatchOutcome::Failed { error } => {
                self.metrics.record_checkin_failure();
                warn!(venue_id = %venue_id, error = %error, "checkin_failed");
                vec![Effect::Notify(Notice::CheckinFailed {
                    venue_id: venue_id.clone(),
                    venue_name: venue_name.clone(),
                    reason: error,
                })]
            }
        }
    }

    /// Start an undo for `checkin_id`.
    ///
    /// Returns `None` when there is no matching pending record (already
    /// expired, undone, or never existed) or an undo is already running.
    pub fn begin_undo(&mut self, checkin_id: &CheckinId) -> Option<UndoJob> {
        let pending = self.pending_undo.as_mut()?;
        if &pending.record.checkin_id != checkin_id || pending.in_progress {
            return None;
        }
        pending.in_progress = true;
        Some(UndoJob {
            generation: self.generation,
            checkin_id: checkin_id.clone(),
            venue_name: pending.record.venue_name.clone(),
        })
    }

    /// Apply the answer to an undo call.
    ///
    /// Either way the undo record is consumed; on success the venue becomes
    /// eligible for dwelling again.
    pub fn on_undo_outcome(&mut self, job: &UndoJob, success: bool, error: Option<String>) -> Vec<Effect> {
        self.metrics.record_undo(success);

        if job.generation != self.generation {
            debug!(checkin_id = %job.checkin_id, "undo_outcome_stale");
            return Vec::new();
        }

        let pending = self.take_pending(&job.checkin_id);

        if success {
            if let Some(p) = &pending {
                if self.last_checked_in.as_ref() == Some(&p.record.venue_id) {
                    self.last_checked_in = None;
                }
            }
            info!(checkin_id = %job.checkin_id, venue_name = %job.venue_name, "undo_succeeded");
            vec![Effect::Notify(Notice::UndoSucceeded {
                checkin_id: job.checkin_id.clone(),
                venue_name: job.venue_name.clone(),
            })]
        } else {
            let reason = error.unwrap_or_else(|| "undo was not accepted".to_string());
            warn!(checkin_id = %job.checkin_id, reason = %reason, "undo_failed");
            vec![Effect::Notify(Notice::UndoFailed {
                checkin_id: job.checkin_id.clone(),
                venue_name: job.venue_name.clone(),
                reason,
            })]
        }
    }

    /// Drop the undo record once its deadline has passed
    pub fn expire_undo(&mut self, now: Instant) -> Vec<Effect> {
        let Some(deadline) = self.undo_deadline() else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }
        let Some(pending) = self.pending_undo.take() else {
            return Vec::new();
        };

        self.metrics.record_undo_expired();
        info!(checkin_id = %pending.record.checkin_id, "undo_expired");
        vec![Effect::Notify(Notice::UndoExpired {
            checkin_id: pending.record.checkin_id,
            venue_name: pending.record.venue_name,
        })]
    }

    /// Drop the dwell only; suppression and undo survive
    pub fn clear_dwell(&mut self) {
        self.drop_dwell("gate_closed");
    }

    /// Forget everything: dwell, suppression, in-flight and undo state.
    /// Outstanding network results become stale.
    pub fn reset(&mut self) {
        if let Some(dwell) = self.tracker.clear() {
            self.record_reset(&dwell, "engine_reset");
        }
        self.last_checked_in = None;
        self.in_flight = None;
        self.pending_undo = None;
        self.generation += 1;
        debug!(generation = %self.generation, "engine_reset");
    }

    fn take_pending(&mut self, checkin_id: &CheckinId) -> Option<PendingUndo> {
        if self.pending_undo.as_ref().is_some_and(|p| &p.record.checkin_id == checkin_id) {
            return self.pending_undo.take();
        }
        None
    }

    fn drop_dwell(&mut self, reason: &str) {
        if let Some(dwell) = self.tracker.clear() {
            self.record_reset(&dwell, reason);
        }
    }

    fn record_reset(&self, dwell: &DwellState, reason: &str) {
        self.metrics.record_dwell_reset();
        info!(venue_id = %dwell.venue_id, reason = %reason, "dwell_reset");
    }
}
