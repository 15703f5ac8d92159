//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by task_harbor and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{CounterVec, Encoder, Gauge, HistogramVec, Opts, Registry, TextEncoder};
use std::sync::OnceLock;

/// Global Prometheus registry for all task_harbor metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Total number of completed runs, labeled by mode and reward.
pub static RUNS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Run duration in seconds, labeled by mode.
pub static RUN_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Total failed edit operations, labeled by strategy and edit kind.
pub static EDIT_FAILURES_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Total verifications, labeled by outcome.
pub static VERIFICATIONS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Number of sandboxes currently provisioned.
pub static ACTIVE_SANDBOXES: OnceLock<Gauge> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Recording before initialization is a no-op, so
/// library users that never call this pay nothing.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    let runs_total = CounterVec::new(
        Opts::new("task_harbor_runs_total", "Total number of completed runs"),
        &["mode", "reward"],
    )?;

    let run_duration = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "task_harbor_run_duration_seconds",
            "Run duration in seconds, provision to teardown",
        )
        .buckets(vec![0.5, 1.0, 5.0, 10.0, 30.0, 60.0, 300.0, 900.0]),
        &["mode"],
    )?;

    let edit_failures_total = CounterVec::new(
        Opts::new("task_harbor_edit_failures_total", "Total failed edit operations"),
        &["strategy", "kind"],
    )?;

    let verifications_total = CounterVec::new(
        Opts::new("task_harbor_verifications_total", "Total verifications"),
        &["outcome"],
    )?;

    let active_sandboxes = Gauge::new(
        "task_harbor_active_sandboxes",
        "Number of sandboxes currently provisioned",
    )?;

    registry.register(Box::new(runs_total.clone()))?;
    registry.register(Box::new(run_duration.clone()))?;
    registry.register(Box::new(edit_failures_total.clone()))?;
    registry.register(Box::new(verifications_total.clone()))?;
    registry.register(Box::new(active_sandboxes.clone()))?;

    // If any of these fail, metrics were already initialized (idempotent)
    let _ = REGISTRY.set(registry);
    let _ = RUNS_TOTAL.set(runs_total);
    let _ = RUN_DURATION.set(run_duration);
    let _ = EDIT_FAILURES_TOTAL.set(edit_failures_total);
    let _ = VERIFICATIONS_TOTAL.set(verifications_total);
    let _ = ACTIVE_SANDBOXES.set(active_sandboxes);

    tracing::debug!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns an explanatory comment line if the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}
