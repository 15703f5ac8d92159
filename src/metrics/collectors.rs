//! Recording helpers for harness metrics.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics so that call sites
//! never deal with label ordering or uninitialized registries.

use super::prometheus::{
    ACTIVE_SANDBOXES, EDIT_FAILURES_TOTAL, RUNS_TOTAL, RUN_DURATION, VERIFICATIONS_TOTAL,
};

/// Metrics collector for recording harness operational metrics.
///
/// All methods are no-ops until [`super::init_metrics`] has been called.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    pub fn new() -> Self {
        Self
    }

    /// Record a completed run.
    ///
    /// # Arguments
    ///
    /// * `mode` - Run mode ("oracle", "noop", "agent")
    /// * `reward` - Reward read back from the reward file
    /// * `duration_secs` - Wall-clock time from provision to teardown
    pub fn record_run(&self, mode: &str, reward: u8, duration_secs: f64) {
        let reward_label = reward.to_string();

        if let Some(runs_total) = RUNS_TOTAL.get() {
            runs_total
                .with_label_values(&[mode, reward_label.as_str()])
                .inc();
        }

        if let Some(run_duration) = RUN_DURATION.get() {
            run_duration.with_label_values(&[mode]).observe(duration_secs);
        }

        tracing::trace!(
            mode = mode,
            reward = reward,
            duration_secs = duration_secs,
            "Recorded run metric"
        );
    }

    /// Record a failed edit operation.
    pub fn record_edit_failure(&self, strategy: &str, kind: &str) {
        if let Some(edit_failures) = EDIT_FAILURES_TOTAL.get() {
            edit_failures.with_label_values(&[strategy, kind]).inc();
        }

        tracing::trace!(strategy = strategy, kind = kind, "Recorded edit failure");
    }

    /// Record a verification outcome ("passed", "failed", "timed_out", ...).
    pub fn record_verification(&self, outcome: &str) {
        if let Some(verifications) = VERIFICATIONS_TOTAL.get() {
            verifications.with_label_values(&[outcome]).inc();
        }
    }

    pub fn sandbox_provisioned(&self) {
        if let Some(active) = ACTIVE_SANDBOXES.get() {
            active.inc();
        }
    }

    pub fn sandbox_released(&self) {
        if let Some(active) = ACTIVE_SANDBOXES.get() {
            active.dec();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_collector_records_without_panicking() {
        let collector = MetricsCollector::new();
        // Safe before initialization.
        collector.record_run("noop", 0, 0.1);

        let _ = init_metrics();
        collector.record_run("oracle", 1, 1.5);
        collector.record_edit_failure("scripted", "replace");
        collector.record_verification("passed");
        collector.sandbox_provisioned();
        collector.sandbox_released();

        let text = export_metrics();
        assert!(text.contains("task_harbor_edit_failures_total") || text.starts_with('#'));
    }
}
