//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `checkin_api` - HTTP client for the check-in validation and undo functions
//! - `location_listener` - TCP listener for location fixes from the platform bridge
//! - `venue_feed` - Venue list loaded from a JSON file
//! - `notices` - User-facing notice channel and JSONL sink
//! - `prometheus` - Prometheus metrics and local control HTTP endpoint

pub mod checkin_api;
pub mod location_listener;
pub mod notices;
pub mod prometheus;
pub mod venue_feed;

// Re-export commonly used types
pub use checkin_api::{ApiError, CheckinApi, HttpCheckinApi};
pub use location_listener::{start_location_listener, LocationListenerConfig};
pub use notices::{create_notice_channel, Notice, NoticeSender, NoticeSink};
pub use venue_feed::{load_venues, VenueFilePoller};
