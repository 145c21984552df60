//! Venue list provider backed by a JSON file
//!
//! The file holds an array of `{id, name, latitude?, longitude?}` records.
//! It is re-read on an interval and the venue set is republished only when
//! its content changed. A read or parse failure keeps the last good set.

use crate::domain::types::{VenueRecord, VenueSet};
use crate::infra::metrics::Metrics;
use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Read and filter the venue file
pub fn load_venues<P: AsRef<Path>>(path: P) -> anyhow::Result<VenueSet> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read venue file: {}", path.display()))?;
    let records: Vec<VenueRecord> = serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse venue file: {}", path.display()))?;

    let venues = VenueSet::from_records(&records);
    if venues.len() < records.len() {
        debug!(
            total = %records.len(),
            eligible = %venues.len(),
            "venues_without_coordinates_skipped"
        );
    }
    Ok(venues)
}

/// Polls the venue file and publishes changes
pub struct VenueFilePoller {
    path: PathBuf,
    poll_interval: Duration,
    venues_tx: watch::Sender<Arc<VenueSet>>,
    metrics: Arc<Metrics>,
}

impl VenueFilePoller {
    pub fn new(
        path: impl Into<PathBuf>,
        poll_interval: Duration,
        venues_tx: watch::Sender<Arc<VenueSet>>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { path: path.into(), poll_interval, venues_tx, metrics }
    }

    /// Load once; returns whether a new set was published
    pub fn refresh(&self) -> bool {
        let venues = match load_venues(&self.path) {
            Ok(venues) => venues,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "venue_refresh_failed");
                return false;
            }
        };

        let changed = self.venues_tx.send_if_modified(|current| {
            if **current == venues {
                return false;
            }
            *current = Arc::new(venues);
            true
        });

        if changed {
            let count = self.venues_tx.borrow().len();
            self.metrics.set_venues_loaded(count);
            info!(file = %self.path.display(), venues = %count, "venues_loaded");
        }
        changed
    }

    /// Poll until shutdown is signalled
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("venue_poller_shutdown");
                        return;
                    }
                }
                _ = ticker.tick() => {
                    self.refresh();
                }
            }
        }
    }
}
