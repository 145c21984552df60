//! Shared types for the check-in engine

use chrono::{DateTime, Utc};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;

/// Newtype wrapper for venue IDs to provide type safety
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VenueId(pub String);

impl VenueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for VenueId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-issued check-in identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckinId(pub String);

impl CheckinId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CheckinId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// WGS84 position in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub const fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    /// Finite and inside the lat/lng ranges
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A single reading from the location source
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocationFix {
    pub coordinate: Coordinate,
    /// Reported horizontal accuracy in meters, if the source provides one
    pub accuracy_m: Option<f64>,
    pub received_at: Instant,
}

impl LocationFix {
    pub fn new(coordinate: Coordinate, accuracy_m: Option<f64>) -> Self {
        Self { coordinate, accuracy_m, received_at: Instant::now() }
    }
}

/// Venue record as delivered by the venue list provider.
///
/// Coordinates are optional upstream; only fully located venues make it
/// into a [`VenueSet`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VenueRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
}

/// A venue eligible for proximity detection
#[derive(Debug, Clone, PartialEq)]
pub struct VenueLocation {
    pub id: VenueId,
    pub name: String,
    pub location: Coordinate,
}

impl VenueLocation {
    pub fn new(id: &str, name: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            id: VenueId::new(id),
            name: name.to_string(),
            location: Coordinate::new(latitude, longitude),
        }
    }

    /// Convert an upstream record, dropping it when a coordinate is missing
    pub fn from_record(record: &VenueRecord) -> Option<Self> {
        let location = Coordinate::new(record.latitude?, record.longitude?);
        if !location.is_valid() {
            return None;
        }
        Some(Self { id: VenueId::new(&record.id), name: record.name.clone(), location })
    }
}

/// Immutable snapshot of eligible venues, shared between tasks
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VenueSet {
    venues: Vec<VenueLocation>,
    by_id: FxHashMap<VenueId, usize>,
}

impl VenueSet {
    pub fn new(venues: Vec<VenueLocation>) -> Self {
        let by_id = venues.iter().enumerate().map(|(i, v)| (v.id.clone(), i)).collect();
        Self { venues, by_id }
    }

    /// Build from upstream records, filtering out venues without coordinates
    pub fn from_records(records: &[VenueRecord]) -> Self {
        Self::new(records.iter().filter_map(VenueLocation::from_record).collect())
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn iter(&self) -> impl Iterator<Item = &VenueLocation> {
        self.venues.iter()
    }

    pub fn get(&self, id: &VenueId) -> Option<&VenueLocation> {
        self.by_id.get(id).map(|&i| &self.venues[i])
    }

    pub fn len(&self) -> usize {
        self.venues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.venues.is_empty()
    }
}

/// The single live dwell: the user has qualified for `venue_id` since `entered_at`
#[derive(Debug, Clone, PartialEq)]
pub struct DwellState {
    pub venue_id: VenueId,
    pub venue_name: String,
    pub venue_location: Coordinate,
    pub entered_at: Instant,
    pub last_confidence: f64,
}

/// A check-in that can still be reversed by the user
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UndoableCheckIn {
    pub checkin_id: CheckinId,
    pub venue_id: VenueId,
    pub venue_name: String,
    pub created_at: DateTime<Utc>,
}
