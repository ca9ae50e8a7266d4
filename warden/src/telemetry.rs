//! Tracing spans and metric recording helpers.
//!
//! Every helper logs through `tracing` and, with the `metrics` feature,
//! also updates the matching Prometheus series in [`crate::metrics`].

use tracing::{Span, info_span};
use tracing_subscriber::EnvFilter;

use crate::governor::Ceiling;
use crate::job::{JobCategory, JobStatus};

/// Install the global `fmt` subscriber. `RUST_LOG` overrides `default`.
pub fn init_tracing(default: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

#[must_use]
pub fn dispatch_span(category: impl AsRef<str>) -> Span {
    info_span!("warden.dispatch", category = %category.as_ref())
}

#[must_use]
pub fn result_span(category: impl AsRef<str>, sequence: u64) -> Span {
    info_span!(
        "warden.result",
        category = %category.as_ref(),
        sequence = sequence,
    )
}

#[must_use]
pub fn sweep_span(category: impl AsRef<str>) -> Span {
    info_span!("warden.sweep", category = %category.as_ref())
}

#[must_use]
pub fn sequencer_span(sequencer_id: i64) -> Span {
    info_span!("warden.sequencer", sequencer_id = sequencer_id)
}

#[must_use]
pub fn quick_scan_span(sequence_id: i64) -> Span {
    info_span!("warden.quick_scan", sequence_id = sequence_id)
}

/// Dispatch outcome counts; `outcome` is one of queued, deferred, failed
/// or retried.
pub fn record_dispatched(category: JobCategory, outcome: &str, count: u64) {
    if count == 0 {
        return;
    }
    tracing::debug!(
        category = %category,
        outcome = outcome,
        count = count,
        "dispatch outcome"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_dispatched(category.as_str(), outcome, count);
}

pub fn record_result(category: JobCategory, outcome: &str) {
    tracing::debug!(category = %category, outcome = outcome, "result processed");

    #[cfg(feature = "metrics")]
    crate::metrics::record_result(category.as_str(), outcome);
}

pub fn record_jobs_swept(category: JobCategory, status: JobStatus, count: u64) {
    tracing::warn!(
        category = %category,
        status = %status,
        count = count,
        "stale jobs swept"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::record_jobs_swept(category.as_str(), status.as_str(), count);
}

/// Set the blocked gauge for `ceiling` and clear it for the other ceiling.
pub fn set_publishing_blocked(category: JobCategory, ceiling: Option<Ceiling>) {
    if let Some(ceiling) = ceiling {
        tracing::debug!(
            category = %category,
            ceiling = %ceiling,
            "publishing held back by ceiling"
        );
    }

    #[cfg(feature = "metrics")]
    for candidate in Ceiling::ALL {
        crate::metrics::set_publishing_blocked(
            category.as_str(),
            candidate.as_str(),
            Some(candidate) == ceiling,
        );
    }
}

pub fn set_jobs_queued(category: JobCategory, queued: u64) {
    #[cfg(feature = "metrics")]
    crate::metrics::set_jobs_queued(category.as_str(), queued);

    #[cfg(not(feature = "metrics"))]
    let _ = (category, queued);
}

pub fn observe_cycle(category: JobCategory, elapsed: std::time::Duration) {
    tracing::trace!(
        category = %category,
        elapsed_ms = elapsed.as_millis() as u64,
        "dispatch cycle finished"
    );

    #[cfg(feature = "metrics")]
    crate::metrics::observe_dispatch_cycle(
        category.as_str(),
        elapsed.as_secs_f64(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_names() {
        assert_eq!(
            dispatch_span("discovery").metadata().unwrap().name(),
            "warden.dispatch"
        );
        assert_eq!(
            result_span("audit", 4).metadata().unwrap().name(),
            "warden.result"
        );
        assert_eq!(
            sweep_span("audit").metadata().unwrap().name(),
            "warden.sweep"
        );
        assert_eq!(
            sequencer_span(1).metadata().unwrap().name(),
            "warden.sequencer"
        );
        assert_eq!(
            quick_scan_span(1).metadata().unwrap().name(),
            "warden.quick_scan"
        );
    }

    #[test]
    fn test_recorders_do_not_panic() {
        record_dispatched(JobCategory::Discovery, "queued", 2);
        record_dispatched(JobCategory::Discovery, "deferred", 0);
        record_result(JobCategory::Audit, "applied");
        record_jobs_swept(JobCategory::QueryRunner, JobStatus::Timeout, 3);
        set_publishing_blocked(JobCategory::Discovery, Some(Ceiling::MaxQueued));
        set_publishing_blocked(JobCategory::Discovery, None);
        set_jobs_queued(JobCategory::Audit, 7);
        observe_cycle(
            JobCategory::Discovery,
            std::time::Duration::from_millis(12),
        );
    }
}
