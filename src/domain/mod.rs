//! Domain models - core check-in types and geo math
//!
//! This module contains the canonical data types used throughout the system:
//! - `Coordinate` / `LocationFix` - user position readings
//! - `VenueLocation` / `VenueSet` - venues eligible for proximity detection
//! - `DwellState` - the single in-progress visit
//! - `UndoableCheckIn` - a check-in the user may still reverse
//! - `geo` - haversine distance and confidence scoring

pub mod geo;
pub mod types;

pub use geo::{confidence, distance_meters};
pub use types::{
    CheckinId, Coordinate, DwellState, LocationFix, UndoableCheckIn, VenueId, VenueLocation,
    VenueRecord, VenueSet,
};
