//! Execution logs and run reports.

use std::fmt;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::RunMode;

/// Stage of a run a log entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Provision,
    Mutation,
    Verification,
    Teardown,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provision => write!(f, "provision"),
            Self::Mutation => write!(f, "mutation"),
            Self::Verification => write!(f, "verification"),
            Self::Teardown => write!(f, "teardown"),
        }
    }
}

/// One line of a run's execution log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub phase: Phase,
    pub ok: bool,
    pub message: String,
    /// Captured output or error chain, when there is one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Ordered record of everything that happened during a run.
///
/// Every failure, recoverable or not, ends up here; the reward bit never
/// says why a run failed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionLog {
    entries: Vec<LogEntry>,
}

impl ExecutionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, phase: Phase, ok: bool, message: impl Into<String>) {
        self.push(phase, ok, message.into(), None);
    }

    pub fn record_detail(
        &mut self,
        phase: Phase,
        ok: bool,
        message: impl Into<String>,
        detail: impl Into<String>,
    ) {
        let detail = detail.into();
        let detail = (!detail.trim().is_empty()).then_some(detail);
        self.push(phase, ok, message.into(), detail);
    }

    fn push(&mut self, phase: Phase, ok: bool, message: String, detail: Option<String>) {
        if ok {
            debug!(%phase, "{}", message);
        } else {
            warn!(%phase, "{}", message);
        }
        self.entries.push(LogEntry {
            timestamp: Utc::now(),
            phase,
            ok,
            message,
            detail,
        });
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn failures(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().filter(|e| !e.ok)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Why a run ended with the reward it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every check passed.
    Passed,
    /// At least one check failed.
    Failed,
    /// The test command exceeded its timeout.
    TimedOut,
    /// The reference solution could not be applied.
    AuthoringError,
    /// Verification could not run or its reward could not be read back.
    VerifierError,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Passed => write!(f, "passed"),
            Self::Failed => write!(f, "failed"),
            Self::TimedOut => write!(f, "timed_out"),
            Self::AuthoringError => write!(f, "authoring_error"),
            Self::VerifierError => write!(f, "verifier_error"),
        }
    }
}

/// Result of one sandbox run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub task_id: String,
    pub mode: RunMode,
    /// Reward read back from the reward file: 0 or 1.
    pub reward: u8,
    pub outcome: RunOutcome,
    pub passed_checks: usize,
    pub failed_checks: usize,
    /// Successful mutating edits.
    pub edits_applied: usize,
    pub edit_failures: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub mutation_ms: u64,
    pub verification_ms: u64,
    /// Output of the test command (tail).
    #[serde(default)]
    pub test_output: String,
    pub log: ExecutionLog,
}

impl RunReport {
    pub fn passed(&self) -> bool {
        self.reward == 1
    }

    /// Writes the report as pretty JSON.
    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}

/// Result of the oracle/no-op self-check of one bundle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelfCheckReport {
    pub task_id: String,
    pub oracle: RunReport,
    pub noop: RunReport,
    /// Oracle yields 1 and no-op yields 0.
    pub valid: bool,
}

impl SelfCheckReport {
    pub fn new(task_id: impl Into<String>, oracle: RunReport, noop: RunReport) -> Self {
        let valid = oracle.reward == 1 && noop.reward == 0;
        Self {
            task_id: task_id.into(),
            oracle,
            noop,
            valid,
        }
    }

    /// One-line explanation of an invalid bundle.
    pub fn problem(&self) -> Option<String> {
        match (self.oracle.reward, self.noop.reward) {
            (1, 0) => None,
            (0, 1) => Some(format!(
                "reference solution fails ({}) and unmodified tree passes",
                self.oracle.outcome
            )),
            (0, _) => Some(format!("reference solution fails ({})", self.oracle.outcome)),
            _ => Some("unmodified tree already passes verification".to_string()),
        }
    }
}

/// Aggregate over many runs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarnessSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    /// Runs that could not produce a report at all.
    pub errors: usize,
    pub average_duration_ms: f64,
}

impl HarnessSummary {
    pub fn from_reports<'a>(
        reports: impl IntoIterator<Item = &'a RunReport>,
        errors: usize,
    ) -> Self {
        let mut summary = Self {
            errors,
            ..Self::default()
        };
        let mut total_ms = 0u64;
        for report in reports {
            summary.total += 1;
            total_ms += report.duration_ms;
            if report.passed() {
                summary.passed += 1;
            } else {
                summary.failed += 1;
            }
        }
        if summary.total > 0 {
            summary.average_duration_ms = total_ms as f64 / summary.total as f64;
        }
        summary.total += errors;
        summary
    }

    pub fn pass_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.passed as f64 / self.total as f64
        }
    }
}

impl fmt::Display for HarnessSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} runs: {} passed, {} failed, {} errors (avg {:.0} ms)",
            self.total, self.passed, self.failed, self.errors, self.average_duration_ms
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(reward: u8, duration_ms: u64) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id: "run-1".into(),
            task_id: "task".into(),
            mode: RunMode::Oracle,
            reward,
            outcome: if reward == 1 {
                RunOutcome::Passed
            } else {
                RunOutcome::Failed
            },
            passed_checks: 0,
            failed_checks: 0,
            edits_applied: 0,
            edit_failures: 0,
            started_at: now,
            finished_at: now,
            duration_ms,
            mutation_ms: 0,
            verification_ms: 0,
            test_output: String::new(),
            log: ExecutionLog::new(),
        }
    }

    #[test]
    fn test_log_records_failures() {
        let mut log = ExecutionLog::new();
        log.record(Phase::Provision, true, "provisioned");
        log.record_detail(Phase::Mutation, false, "replace failed", "NoMatch");
        log.record_detail(Phase::Mutation, true, "ok", "   ");

        assert_eq!(log.len(), 3);
        assert_eq!(log.failures().count(), 1);
        assert_eq!(log.entries()[1].detail.as_deref(), Some("NoMatch"));
        assert_eq!(log.entries()[2].detail, None);
    }

    #[test]
    fn test_self_check_validity() {
        let valid = SelfCheckReport::new("t", report(1, 10), report(0, 10));
        assert!(valid.valid);
        assert!(valid.problem().is_none());

        let broken = SelfCheckReport::new("t", report(1, 10), report(1, 10));
        assert!(!broken.valid);
        assert!(broken.problem().unwrap().contains("already passes"));

        let failing = SelfCheckReport::new("t", report(0, 10), report(0, 10));
        assert!(failing.problem().unwrap().contains("reference solution fails"));
    }

    #[test]
    fn test_summary() {
        let reports = [report(1, 100), report(0, 300)];
        let summary = HarnessSummary::from_reports(&reports, 1);

        assert_eq!(summary.total, 3);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.errors, 1);
        assert!((summary.average_duration_ms - 200.0).abs() < f64::EPSILON);
        assert!(summary.to_string().contains("1 passed"));
    }

    #[test]
    fn test_report_round_trips_through_json() {
        let json = serde_json::to_string(&report(1, 5)).unwrap();
        let back: RunReport = serde_json::from_str(&json).unwrap();
        assert!(back.passed());
        assert_eq!(back.mode, RunMode::Oracle);
    }
}
