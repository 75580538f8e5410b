//! Prometheus metrics for test progress.
//!
//! Metrics live in a registry owned by the daemon rather than the prometheus
//! default registry, so tests can build as many independent instances as
//! they need.

use progress_common::{ProgressCounts, TestSet};
use prometheus::{Encoder, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

/// Receiver of refreshed counts.
pub trait MetricsSink: Send + Sync {
    /// Publish the size of `set` after a successful refresh.
    fn set_count(&self, set: TestSet, count: usize);

    /// Record a failed refresh of `set`.
    fn record_failure(&self, set: TestSet);
}

/// Daemon metrics registry.
#[derive(Clone)]
pub struct ProgressMetrics {
    registry: Registry,
    total_tests: IntGauge,
    passing_tests: IntGauge,
    refresh_failures: IntCounterVec,
    last_refresh: IntGaugeVec,
}

impl ProgressMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let total_tests = IntGauge::with_opts(Opts::new(
            "progress_total_tests",
            "The total number of tests",
        ))?;
        let passing_tests = IntGauge::with_opts(Opts::new(
            "progress_passing_tests",
            "The number of passing tests",
        ))?;
        let refresh_failures = IntCounterVec::new(
            Opts::new(
                "progress_refresh_failures_total",
                "Refreshes that failed before updating the stored set",
            ),
            &["kind"],
        )?;
        let last_refresh = IntGaugeVec::new(
            Opts::new(
                "progress_last_refresh_timestamp_seconds",
                "Unix time of the last successful refresh",
            ),
            &["kind"],
        )?;

        registry.register(Box::new(total_tests.clone()))?;
        registry.register(Box::new(passing_tests.clone()))?;
        registry.register(Box::new(refresh_failures.clone()))?;
        registry.register(Box::new(last_refresh.clone()))?;

        Ok(Self {
            registry,
            total_tests,
            passing_tests,
            refresh_failures,
            last_refresh,
        })
    }

    fn gauge(&self, set: TestSet) -> &IntGauge {
        match set {
            TestSet::Total => &self.total_tests,
            TestSet::Passing => &self.passing_tests,
        }
    }

    /// Current gauge value for `set`.
    pub fn count(&self, set: TestSet) -> i64 {
        self.gauge(set).get()
    }

    /// Seed the count gauges from a persisted snapshot without marking a refresh.
    pub fn restore_counts(&self, counts: ProgressCounts) {
        for set in TestSet::ALL {
            self.gauge(set)
                .set(i64::try_from(counts.get(set)).unwrap_or(i64::MAX));
        }
    }

    pub fn failures(&self, set: TestSet) -> u64 {
        self.refresh_failures.with_label_values(&[set.as_str()]).get()
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl MetricsSink for ProgressMetrics {
    fn set_count(&self, set: TestSet, count: usize) {
        self.gauge(set)
            .set(i64::try_from(count).unwrap_or(i64::MAX));
        self.last_refresh
            .with_label_values(&[set.as_str()])
            .set(chrono::Utc::now().timestamp());
    }

    fn record_failure(&self, set: TestSet) {
        self.refresh_failures
            .with_label_values(&[set.as_str()])
            .inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_are_published_per_set() {
        let metrics = ProgressMetrics::new().unwrap();
        metrics.set_count(TestSet::Total, 3);
        metrics.set_count(TestSet::Passing, 2);
        assert_eq!(metrics.count(TestSet::Total), 3);
        assert_eq!(metrics.count(TestSet::Passing), 2);
    }

    #[test]
    fn failures_are_counted_by_kind() {
        let metrics = ProgressMetrics::new().unwrap();
        metrics.record_failure(TestSet::Passing);
        metrics.record_failure(TestSet::Passing);
        assert_eq!(metrics.failures(TestSet::Passing), 2);
        assert_eq!(metrics.failures(TestSet::Total), 0);
    }

    #[test]
    fn encode_includes_gauge_names() {
        let metrics = ProgressMetrics::new().unwrap();
        metrics.set_count(TestSet::Total, 1234);
        let text = metrics.encode().unwrap();
        assert!(text.contains("# HELP progress_total_tests The total number of tests"));
        assert!(text.contains("progress_total_tests 1234"));
        assert!(text.contains("progress_passing_tests 0"));
        assert!(text.contains("progress_last_refresh_timestamp_seconds{kind=\"total\"}"));
    }

    #[test]
    fn restored_counts_do_not_stamp_a_refresh() {
        let metrics = ProgressMetrics::new().unwrap();
        metrics.restore_counts(ProgressCounts {
            total: 7,
            passing: 4,
        });
        assert_eq!(metrics.count(TestSet::Total), 7);
        assert_eq!(metrics.count(TestSet::Passing), 4);
        assert!(!metrics.encode().unwrap().contains("kind=\"total\""));
    }

    #[test]
    fn instances_are_independent() {
        let a = ProgressMetrics::new().unwrap();
        let b = ProgressMetrics::new().unwrap();
        a.set_count(TestSet::Total, 10);
        assert_eq!(b.count(TestSet::Total), 0);
    }
}
