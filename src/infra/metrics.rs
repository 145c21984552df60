//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics so the controller task and the dispatch tasks can record
//! without contention. `report()` swaps the per-interval latency histogram
//! for the periodic log; `scrape()` reads the cumulative one and resets nothing.
//!
//! NOTE: All atomics use Relaxed ordering intentionally: these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Prometheus-style exponential bucket boundaries (microseconds)
/// Buckets: ≤1ms, ≤2ms, ≤4ms, ... ≤512ms, >512ms
const BUCKET_BOUNDS: [u64; 10] =
    [1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000, 512_000];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_us: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Read all buckets without resetting them
#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Last bucket uses 2x the previous bound
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] = [
        1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000, 256_000, 512_000, 1_024_000,
    ];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Engine ticks evaluated while the gate was open
    ticks_total: AtomicU64,
    /// Dwell periods started
    dwells_started: AtomicU64,
    /// Dwell periods abandoned before reaching the threshold
    dwells_reset: AtomicU64,
    /// Check-in validation calls issued
    dispatches_total: AtomicU64,
    /// Check-ins accepted by the server
    checkins_succeeded: AtomicU64,
    /// Server cooldown rejections
    cooldown_rejections: AtomicU64,
    /// Any other rejection or transport failure
    checkin_failures: AtomicU64,
    /// Undo calls that reversed a check-in
    undos_succeeded: AtomicU64,
    /// Undo calls that failed
    undos_failed: AtomicU64,
    /// Pending undo records that expired unused
    undos_expired: AtomicU64,
    /// Notices dropped because the channel was full
    notices_dropped: AtomicU64,
    /// Location fixes accepted from the feed
    fixes_received: AtomicU64,
    /// Location lines rejected by the parser
    fixes_rejected: AtomicU64,
    /// Dispatch round-trip latency histogram (reset on report)
    dispatch_latency_buckets: [AtomicU64; NUM_BUCKETS],
    dispatch_latency_sum_us: AtomicU64,
    dispatch_latency_max_us: AtomicU64,
    dispatches_since_report: AtomicU64,
    /// Lifetime dispatch latency histogram (never reset)
    dispatch_latency_total_buckets: [AtomicU64; NUM_BUCKETS],
    dispatch_latency_total_sum_us: AtomicU64,
    /// 1 while the settings gate is open and the tick timer armed
    engine_active: AtomicU64,
    /// Current eligible venue count
    venues_loaded: AtomicU64,
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            ticks_total: AtomicU64::new(0),
            dwells_started: AtomicU64::new(0),
            dwells_reset: AtomicU64::new(0),
            dispatches_total: AtomicU64::new(0),
            checkins_succeeded: AtomicU64::new(0),
            cooldown_rejections: AtomicU64::new(0),
            checkin_failures: AtomicU64::new(0),
            undos_succeeded: AtomicU64::new(0),
            undos_failed: AtomicU64::new(0),
            undos_expired: AtomicU64::new(0),
            notices_dropped: AtomicU64::new(0),
            fixes_received: AtomicU64::new(0),
            fixes_rejected: AtomicU64::new(0),
            dispatch_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            dispatch_latency_sum_us: AtomicU64::new(0),
            dispatch_latency_max_us: AtomicU64::new(0),
            dispatches_since_report: AtomicU64::new(0),
            dispatch_latency_total_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            dispatch_latency_total_sum_us: AtomicU64::new(0),
            engine_active: AtomicU64::new(0),
            venues_loaded: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_tick(&self) {
        self.ticks_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dwell_started(&self) {
        self.dwells_started.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dwell_reset(&self) {
        self.dwells_reset.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_dispatch(&self) {
        self.dispatches_total.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed validation round trip (lock-free)
    #[inline]
    pub fn record_dispatch_latency(&self, latency_us: u64) {
        self.dispatches_since_report.fetch_add(1, Ordering::Relaxed);
        self.dispatch_latency_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        let bucket = bucket_index(latency_us);
        self.dispatch_latency_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.dispatch_latency_total_buckets[bucket].fetch_add(1, Ordering::Relaxed);
        self.dispatch_latency_total_sum_us.fetch_add(latency_us, Ordering::Relaxed);
        update_atomic_max(&self.dispatch_latency_max_us, latency_us);
    }

    #[inline]
    pub fn record_checkin_succeeded(&self) {
        self.checkins_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cooldown_rejection(&self) {
        self.cooldown_rejections.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_checkin_failure(&self) {
        self.checkin_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_undo(&self, success: bool) {
        if success {
            self.undos_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.undos_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_undo_expired(&self) {
        self.undos_expired.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_notice_dropped(&self) {
        self.notices_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fix_received(&self) {
        self.fixes_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_fix_rejected(&self) {
        self.fixes_rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_engine_active(&self, active: bool) {
        self.engine_active.store(u64::from(active), Ordering::Relaxed);
    }

    #[inline]
    pub fn set_venues_loaded(&self, count: usize) {
        self.venues_loaded.store(count as u64, Ordering::Relaxed);
    }

    pub fn dispatches_total(&self) -> u64 {
        self.dispatches_total.load(Ordering::Relaxed)
    }

    pub fn checkins_succeeded(&self) -> u64 {
        self.checkins_succeeded.load(Ordering::Relaxed)
    }

    pub fn cooldown_rejections(&self) -> u64 {
        self.cooldown_rejections.load(Ordering::Relaxed)
    }

    /// Generate a summary report, resetting the per-interval latency histogram
    pub fn report(&self) -> MetricsSummary {
        let dispatch_count = self.dispatches_since_report.swap(0, Ordering::Relaxed);
        let latency_sum = self.dispatch_latency_sum_us.swap(0, Ordering::Relaxed);
        let latency_max = self.dispatch_latency_max_us.swap(0, Ordering::Relaxed);
        let latency_buckets = swap_buckets(&self.dispatch_latency_buckets);

        let elapsed_secs = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed.as_secs_f64()
        };

        self.summarize(elapsed_secs, latency_buckets, latency_sum, dispatch_count, latency_max)
    }

    /// Read-only summary with the lifetime latency histogram, for scrapers
    pub fn scrape(&self) -> MetricsSummary {
        let latency_buckets = load_buckets(&self.dispatch_latency_total_buckets);
        let latency_sum = self.dispatch_latency_total_sum_us.load(Ordering::Relaxed);
        let dispatch_count = latency_buckets.iter().sum();
        let latency_max = self.dispatch_latency_max_us.load(Ordering::Relaxed);
        let elapsed_secs = self.last_report_time.lock().elapsed().as_secs_f64();

        self.summarize(elapsed_secs, latency_buckets, latency_sum, dispatch_count, latency_max)
    }

    fn summarize(
        &self,
        interval_secs: f64,
        latency_buckets: [u64; NUM_BUCKETS],
        latency_sum: u64,
        dispatch_count: u64,
        latency_max: u64,
    ) -> MetricsSummary {
        let avg_latency = if dispatch_count > 0 { latency_sum / dispatch_count } else { 0 };

        MetricsSummary {
            interval_secs,
            ticks_total: self.ticks_total.load(Ordering::Relaxed),
            dwells_started: self.dwells_started.load(Ordering::Relaxed),
            dwells_reset: self.dwells_reset.load(Ordering::Relaxed),
            dispatches_total: self.dispatches_total.load(Ordering::Relaxed),
            checkins_succeeded: self.checkins_succeeded.load(Ordering::Relaxed),
            cooldown_rejections: self.cooldown_rejections.load(Ordering::Relaxed),
            checkin_failures: self.checkin_failures.load(Ordering::Relaxed),
            undos_succeeded: self.undos_succeeded.load(Ordering::Relaxed),
            undos_failed: self.undos_failed.load(Ordering::Relaxed),
            undos_expired: self.undos_expired.load(Ordering::Relaxed),
            notices_dropped: self.notices_dropped.load(Ordering::Relaxed),
            fixes_received: self.fixes_received.load(Ordering::Relaxed),
            fixes_rejected: self.fixes_rejected.load(Ordering::Relaxed),
            dispatch_lat_buckets: latency_buckets,
            dispatch_lat_sum_us: latency_sum,
            dispatch_lat_avg_us: avg_latency,
            dispatch_lat_max_us: latency_max,
            dispatch_lat_p50_us: percentile_from_buckets(&latency_buckets, 0.50),
            dispatch_lat_p99_us: percentile_from_buckets(&latency_buckets, 0.99),
            engine_active: self.engine_active.load(Ordering::Relaxed) == 1,
            venues_loaded: self.venues_loaded.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub interval_secs: f64,
    pub ticks_total: u64,
    pub dwells_started: u64,
    pub dwells_reset: u64,
    pub dispatches_total: u64,
    pub checkins_succeeded: u64,
    pub cooldown_rejections: u64,
    pub checkin_failures: u64,
    pub undos_succeeded: u64,
    pub undos_failed: u64,
    pub undos_expired: u64,
    pub notices_dropped: u64,
    pub fixes_received: u64,
    pub fixes_rejected: u64,
    /// Dispatch latency histogram buckets (last interval from `report`, lifetime from `scrape`)
    /// Bounds: ≤1ms, ≤2ms, ... ≤512ms, >512ms
    pub dispatch_lat_buckets: [u64; NUM_BUCKETS],
    pub dispatch_lat_sum_us: u64,
    pub dispatch_lat_avg_us: u64,
    pub dispatch_lat_max_us: u64,
    pub dispatch_lat_p50_us: u64,
    pub dispatch_lat_p99_us: u64,
    pub engine_active: bool,
    pub venues_loaded: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            active = %self.engine_active,
            venues = %self.venues_loaded,
            ticks = %self.ticks_total,
            dwells_started = %self.dwells_started,
            dwells_reset = %self.dwells_reset,
            dispatches = %self.dispatches_total,
            checkins = %self.checkins_succeeded,
            cooldowns = %self.cooldown_rejections,
            failures = %self.checkin_failures,
            undos = %self.undos_succeeded,
            dispatch_p99_us = %self.dispatch_lat_p99_us,
            "metrics"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_index() {
        assert_eq!(bucket_index(0), 0);
        assert_eq!(bucket_index(1_000), 0);
        assert_eq!(bucket_index(1_001), 1);
        assert_eq!(bucket_index(512_000), 9);
        assert_eq!(bucket_index(600_000), 10);
    }

    #[test]
    fn test_report_resets_latency_only() {
        let metrics = Metrics::new();
        metrics.record_dispatch();
        metrics.record_dispatch_latency(1_500);
        metrics.record_dispatch_latency(3_000);
        metrics.record_checkin_succeeded();

        let first = metrics.report();
        assert_eq!(first.dispatches_total, 1);
        assert_eq!(first.checkins_succeeded, 1);
        assert_eq!(first.dispatch_lat_avg_us, 2_250);
        assert_eq!(first.dispatch_lat_max_us, 3_000);
        assert_eq!(first.dispatch_lat_buckets.iter().sum::<u64>(), 2);

        let second = metrics.report();
        assert_eq!(second.dispatches_total, 1);
        assert_eq!(second.dispatch_lat_avg_us, 0);
        assert_eq!(second.dispatch_lat_buckets.iter().sum::<u64>(), 0);
    }

    #[test]
    fn test_scrape_keeps_interval_histogram() {
        let metrics = Metrics::new();
        metrics.record_dispatch_latency(1_500);

        let scraped = metrics.scrape();
        assert_eq!(scraped.dispatch_lat_buckets.iter().sum::<u64>(), 1);
        assert_eq!(scraped.dispatch_lat_sum_us, 1_500);

        // The periodic report still sees the sample
        let report = metrics.report();
        assert_eq!(report.dispatch_lat_buckets.iter().sum::<u64>(), 1);
        assert_eq!(report.dispatch_lat_max_us, 1_500);

        // Scrapes stay cumulative across reports
        metrics.record_dispatch_latency(3_000);
        let scraped = metrics.scrape();
        assert_eq!(scraped.dispatch_lat_buckets.iter().sum::<u64>(), 2);
        assert_eq!(scraped.dispatch_lat_sum_us, 4_500);
        assert_eq!(scraped.dispatch_lat_avg_us, 2_250);
    }

    #[test]
    fn test_percentile_computation() {
        let mut buckets = [0u64; NUM_BUCKETS];
        buckets[0] = 98;
        buckets[5] = 2;
        assert_eq!(percentile_from_buckets(&buckets, 0.50), 1_000);
        assert_eq!(percentile_from_buckets(&buckets, 0.99), 32_000);
        assert_eq!(percentile_from_buckets(&[0; NUM_BUCKETS], 0.99), 0);
    }

    #[test]
    fn test_undo_counters() {
        let metrics = Metrics::new();
        metrics.record_undo(true);
        metrics.record_undo(false);
        metrics.record_undo(false);
        metrics.record_undo_expired();
        let summary = metrics.report();
        assert_eq!(summary.undos_succeeded, 1);
        assert_eq!(summary.undos_failed, 2);
        assert_eq!(summary.undos_expired, 1);
    }

    #[test]
    fn test_concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let metrics = Arc::new(Metrics::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let m = metrics.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        m.record_tick();
                        m.record_dispatch_latency(500);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        let summary = metrics.report();
        assert_eq!(summary.ticks_total, 4000);
        assert_eq!(summary.dispatch_lat_buckets[0], 4000);
    }
}
