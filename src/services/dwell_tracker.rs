//! Single-venue dwell state machine
//!
//! Evaluated once per engine tick against the latest position:
//! - The nearest eligible venue is the only candidate (ties go to the
//!   smallest venue id, so the result does not depend on list order)
//! - A candidate qualifies only when its confidence reaches the minimum,
//!   which is much tighter than the raw geofence radius
//! - Losing qualification clears the dwell immediately, there is no grace
//!   window and no credit carried over to the next visit
//! - Crossing the dwell threshold fires exactly once and clears the dwell

use crate::domain::geo::{confidence, distance_meters};
use crate::domain::types::{Coordinate, DwellState, VenueId, VenueLocation, VenueSet};
use crate::infra::config::Config;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Distances closer than this are treated as equal for tie-breaking
const TIE_EPSILON_M: f64 = 1e-9;

/// Thresholds that decide when a visit counts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DwellPolicy {
    pub geofence_radius_m: f64,
    pub min_confidence: f64,
    pub dwell_threshold: Duration,
}

impl Default for DwellPolicy {
    fn default() -> Self {
        Self {
            geofence_radius_m: 30.0,
            min_confidence: 0.7,
            dwell_threshold: Duration::from_secs(150),
        }
    }
}

impl DwellPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            geofence_radius_m: config.geofence_radius_m(),
            min_confidence: config.min_confidence(),
            dwell_threshold: config.dwell_threshold(),
        }
    }
}

/// Nearest venue to the current position
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub venue: &'a VenueLocation,
    pub distance_m: f64,
}

/// Find the nearest venue, breaking exact ties by venue id
pub fn nearest_venue<'a>(position: &Coordinate, venues: &'a VenueSet) -> Option<Candidate<'a>> {
    let mut best: Option<Candidate<'a>> = None;

    for venue in venues.iter() {
        let distance_m = distance_meters(position, &venue.location);
        best = match best {
            None => Some(Candidate { venue, distance_m }),
            Some(current) => {
                let closer = distance_m < current.distance_m - TIE_EPSILON_M;
                let tied = (distance_m - current.distance_m).abs() <= TIE_EPSILON_M;
                if closer || (tied && venue.id < current.venue.id) {
                    Some(Candidate { venue, distance_m })
                } else {
                    Some(current)
                }
            }
        };
    }

    best
}

/// What a single evaluation did to the dwell
#[derive(Debug, Clone, PartialEq)]
pub enum DwellTransition {
    /// Nothing qualifies; `cleared` holds the dwell that was dropped, if any
    Idle { cleared: Option<DwellState> },
    /// The nearest qualifying venue is suppressed; no dwell is held
    Suppressed { venue_id: VenueId, cleared: Option<DwellState> },
    /// A new dwell started, replacing `replaced` if there was one
    Started { dwell: DwellState, replaced: Option<DwellState> },
    /// Still dwelling at the same venue, below the threshold
    Continued { venue_id: VenueId, elapsed: Duration, confidence: f64 },
    /// Threshold reached; the dwell has been taken out of the tracker
    Triggered(DwellState),
}

/// Tracks the one venue the user is currently dwelling at
#[derive(Debug, Default)]
pub struct DwellTracker {
    policy: DwellPolicy,
    current: Option<DwellState>,
}

impl DwellTracker {
    pub fn new(policy: DwellPolicy) -> Self {
        Self { policy, current: None }
    }

    pub fn policy(&self) -> &DwellPolicy {
        &self.policy
    }

    pub fn current(&self) -> Option<&DwellState> {
        self.current.as_ref()
    }

    /// Drop the current dwell, returning it
    pub fn clear(&mut self) -> Option<DwellState> {
        self.current.take()
    }

    /// Drop the current dwell only if it belongs to `venue_id`
    pub fn clear_for(&mut self, venue_id: &VenueId) -> Option<DwellState> {
        if self.current.as_ref().is_some_and(|d| &d.venue_id == venue_id) {
            return self.current.take();
        }
        None
    }

    /// Re-evaluate the dwell for one tick
    ///
    /// `is_suppressed` reports venues that must not start (or keep) a dwell,
    /// e.g. the venue that was just checked into.
    pub fn evaluate<F>(
        &mut self,
        now: Instant,
        position: &Coordinate,
        venues: &VenueSet,
        is_suppressed: F,
    ) -> DwellTransition
    where
        F: Fn(&VenueId) -> bool,
    {
        let Some(candidate) = nearest_venue(position, venues) else {
            return DwellTransition::Idle { cleared: self.clear() };
        };

        if candidate.distance_m >= self.policy.geofence_radius_m {
            return DwellTransition::Idle { cleared: self.clear() };
        }

        let score = confidence(candidate.distance_m, self.policy.geofence_radius_m);
        if score < self.policy.min_confidence {
            debug!(
                venue_id = %candidate.venue.id,
                distance_m = %format!("{:.1}", candidate.distance_m),
                confidence = %format!("{:.3}", score),
                "dwell_confidence_too_low"
            );
            return DwellTransition::Idle { cleared: self.clear() };
        }

        let venue = candidate.venue;
        if is_suppressed(&venue.id) {
            return DwellTransition::Suppressed { venue_id: venue.id.clone(), cleared: self.clear() };
        }

        let replaced = match self.current.take() {
            Some(mut dwell) if dwell.venue_id == venue.id => {
                dwell.last_confidence = score;
                let elapsed = now.saturating_duration_since(dwell.entered_at);

                if elapsed >= self.policy.dwell_threshold {
                    info!(
                        venue_id = %dwell.venue_id,
                        venue_name = %dwell.venue_name,
                        elapsed_secs = %elapsed.as_secs(),
                        confidence = %format!("{:.3}", score),
                        "dwell_threshold_reached"
                    );
                    return DwellTransition::Triggered(dwell);
                }

                self.current = Some(dwell);
                return DwellTransition::Continued {
                    venue_id: venue.id.clone(),
                    elapsed,
                    confidence: score,
                };
            }
            previous => previous,
        };

        let dwell = DwellState {
            venue_id: venue.id.clone(),
            venue_name: venue.name.clone(),
            venue_location: venue.location,
            entered_at: now,
            last_confidence: score,
        };
        self.current = Some(dwell.clone());

        info!(
            venue_id = %dwell.venue_id,
            venue_name = %dwell.venue_name,
            distance_m = %format!("{:.1}", candidate.distance_m),
            confidence = %format!("{:.3}", score),
            replaced = ?replaced.as_ref().map(|d| d.venue_id.as_str()),
            "dwell_started"
        );

        DwellTransition::Started { dwell, replaced }
    }
}
