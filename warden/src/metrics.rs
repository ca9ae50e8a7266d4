//! Prometheus metrics for the scheduler.
//!
//! Everything here is compiled behind the `metrics` feature; call sites go
//! through [`crate::telemetry`], which is a no-op without it.
//!
//! # Metrics
//!
//! ## Counters
//! - `warden_jobs_dispatched_total` - Dispatch attempts by outcome
//! - `warden_results_processed_total` - Worker results by outcome
//! - `warden_jobs_swept_total` - Jobs moved by the timeout sweeper
//!
//! ## Gauges
//! - `warden_publishing_blocked` - 1 while a governor ceiling holds back a category
//! - `warden_jobs_queued` - Jobs sitting in `queued`
//!
//! ## Histograms
//! - `warden_dispatch_cycle_seconds` - Duration of one dispatch cycle
#![cfg(feature = "metrics")]

use prometheus::{
    CounterVec, GaugeVec, HistogramVec, Opts, Registry, exponential_buckets,
};
use std::sync::LazyLock;

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

/// Labels: `category`, `outcome` (queued, deferred, failed, retried).
pub static JOBS_DISPATCHED_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "warden_jobs_dispatched_total",
        "Jobs handled by the dispatch loop",
    );
    CounterVec::new(opts, &["category", "outcome"])
        .expect("warden_jobs_dispatched_total metric creation failed")
});

/// Labels: `category`, `outcome` (applied, ignored, poison, retried).
pub static RESULTS_PROCESSED_TOTAL: LazyLock<CounterVec> =
    LazyLock::new(|| {
        let opts = Opts::new(
            "warden_results_processed_total",
            "Worker results consumed",
        );
        CounterVec::new(opts, &["category", "outcome"])
            .expect("warden_results_processed_total metric creation failed")
    });

/// Labels: `category`, `status` (the status jobs were moved to).
pub static JOBS_SWEPT_TOTAL: LazyLock<CounterVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "warden_jobs_swept_total",
        "Jobs moved to a terminal status by the timeout sweeper",
    );
    CounterVec::new(opts, &["category", "status"])
        .expect("warden_jobs_swept_total metric creation failed")
});

/// Labels: `category`, `ceiling` (max_queued, max_in_window).
pub static PUBLISHING_BLOCKED: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new(
        "warden_publishing_blocked",
        "1 while a governor ceiling blocks or truncates publishing",
    );
    GaugeVec::new(opts, &["category", "ceiling"])
        .expect("warden_publishing_blocked metric creation failed")
});

/// Labels: `category`.
pub static JOBS_QUEUED: LazyLock<GaugeVec> = LazyLock::new(|| {
    let opts = Opts::new("warden_jobs_queued", "Jobs currently queued");
    GaugeVec::new(opts, &["category"])
        .expect("warden_jobs_queued metric creation failed")
});

/// Labels: `category`.
pub static DISPATCH_CYCLE_SECONDS: LazyLock<HistogramVec> =
    LazyLock::new(|| {
        let buckets = exponential_buckets(0.005, 2.0, 14)
            .expect("bucket creation failed");
        let opts = prometheus::HistogramOpts::new(
            "warden_dispatch_cycle_seconds",
            "Duration of one dispatch cycle in seconds",
        )
        .buckets(buckets);
        HistogramVec::new(opts, &["category"])
            .expect("warden_dispatch_cycle_seconds metric creation failed")
    });

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init_metrics() -> anyhow::Result<()> {
    let registry = &*REGISTRY;

    for metric in [
        Box::new(JOBS_DISPATCHED_TOTAL.clone())
            as Box<dyn prometheus::core::Collector>,
        Box::new(RESULTS_PROCESSED_TOTAL.clone()),
        Box::new(JOBS_SWEPT_TOTAL.clone()),
        Box::new(PUBLISHING_BLOCKED.clone()),
        Box::new(JOBS_QUEUED.clone()),
        Box::new(DISPATCH_CYCLE_SECONDS.clone()),
    ] {
        if let Err(e) = registry.register(metric) {
            let msg = e.to_string();
            if !msg.contains("Duplicate metrics collector registration attempted")
            {
                return Err(e.into());
            }
        }
    }

    Ok(())
}

pub fn record_dispatched(category: &str, outcome: &str, count: u64) {
    JOBS_DISPATCHED_TOTAL
        .with_label_values(&[category, outcome])
        .inc_by(count as f64);
}

pub fn record_result(category: &str, outcome: &str) {
    RESULTS_PROCESSED_TOTAL
        .with_label_values(&[category, outcome])
        .inc();
}

pub fn record_jobs_swept(category: &str, status: &str, count: u64) {
    JOBS_SWEPT_TOTAL
        .with_label_values(&[category, status])
        .inc_by(count as f64);
}

pub fn set_publishing_blocked(category: &str, ceiling: &str, blocked: bool) {
    PUBLISHING_BLOCKED
        .with_label_values(&[category, ceiling])
        .set(if blocked { 1.0 } else { 0.0 });
}

pub fn set_jobs_queued(category: &str, queued: u64) {
    JOBS_QUEUED.with_label_values(&[category]).set(queued as f64);
}

pub fn observe_dispatch_cycle(category: &str, duration_secs: f64) {
    DISPATCH_CYCLE_SECONDS
        .with_label_values(&[category])
        .observe(duration_secs);
}

/// Gather all registered metrics in Prometheus text format.
pub fn gather_metrics() -> anyhow::Result<String> {
    let encoder = prometheus::TextEncoder::new();
    let metric_families = REGISTRY.gather();
    encoder
        .encode_to_string(&metric_families)
        .map_err(Into::into)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization_is_repeatable() {
        init_metrics().expect("metrics initialization should succeed");
        init_metrics().expect("second initialization should succeed");
    }

    #[test]
    fn test_publishing_blocked_gauge_toggles() {
        set_publishing_blocked("discovery", "max_queued", true);
        assert_eq!(
            PUBLISHING_BLOCKED
                .with_label_values(&["discovery", "max_queued"])
                .get(),
            1.0
        );
        set_publishing_blocked("discovery", "max_queued", false);
        assert_eq!(
            PUBLISHING_BLOCKED
                .with_label_values(&["discovery", "max_queued"])
                .get(),
            0.0
        );
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().expect("metrics initialization should succeed");

        record_dispatched("audit", "queued", 3);
        record_result("audit", "applied");
        record_jobs_swept("audit", "timeout", 1);
        observe_dispatch_cycle("audit", 0.02);

        let output = gather_metrics().expect("gather should succeed");
        assert!(output.contains("warden_jobs_dispatched_total"));
        assert!(output.contains("warden_results_processed_total"));
        assert!(output.contains("warden_jobs_swept_total"));
        assert!(output.contains("warden_dispatch_cycle_seconds"));
    }
}
