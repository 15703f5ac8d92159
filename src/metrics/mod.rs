//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks runs by mode and reward, run durations, verification outcomes,
//! edit failures and live sandboxes.
//!
//! # Example
//!
//! ```ignore
//! use task_harbor::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_run("oracle", 1, 12.5);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use self::prometheus::{export_metrics, init_metrics};

pub use self::prometheus::{
    ACTIVE_SANDBOXES, EDIT_FAILURES_TOTAL, REGISTRY, RUNS_TOTAL, RUN_DURATION,
    VERIFICATIONS_TOTAL,
};
