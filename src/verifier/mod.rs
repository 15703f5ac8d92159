//! Verifier: reduces a sandbox's final tree state to one reward bit.
//!
//! The reward is 1 only when every declared check passes and the bundle's
//! test command exits 0. Anything else, including a timeout or a command
//! that cannot start, is 0. The reward is written as a single character to
//! the sandbox's reward file, which is the only thing a driver reads.

pub mod checks;

pub use checks::{CheckResult, CheckSpec, CHECK_TYPES};

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::bundle::TaskBundle;
use crate::error::{SandboxError, VerifierError};
use crate::metrics::MetricsCollector;
use crate::mutation::ops::tail;
use crate::sandbox::SandboxHandle;

/// Identifier of the synthetic check standing for the test command.
pub const TEST_COMMAND_CHECK: &str = "test-command";

/// Bytes of test output kept in the outcome.
const TEST_OUTPUT_TAIL: usize = 8000;

/// Result of verifying one sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub passed: usize,
    pub failed: usize,
    /// 1 if every check passed, else 0.
    pub reward: u8,
    /// True if the test command exceeded its timeout.
    pub timed_out: bool,
    pub checks: Vec<CheckResult>,
    /// Tail of the test command's combined output.
    pub test_output: String,
    pub duration_ms: u64,
}

impl VerificationOutcome {
    pub fn outcome_label(&self) -> &'static str {
        if self.reward == 1 {
            "passed"
        } else if self.timed_out {
            "timed_out"
        } else {
            "failed"
        }
    }
}

/// Runs a bundle's checks and test command against a sandbox.
#[derive(Debug, Clone, Default)]
pub struct Verifier {
    metrics: MetricsCollector,
}

impl Verifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Verifies the current tree of `handle` and writes the reward file.
    ///
    /// Tests are staged into the sandbox only now, over an emptied tests
    /// directory: nothing that ran earlier could read them or plant files
    /// next to them.
    pub async fn verify(
        &self,
        handle: &SandboxHandle,
        bundle: &TaskBundle,
    ) -> Result<VerificationOutcome, VerifierError> {
        let start = Instant::now();
        let budget = bundle.verifier_timeout();
        let deadline = start.checked_add(budget);

        handle
            .stage_tests(bundle)
            .map_err(|e| VerifierError::Staging(e.to_string()))?;

        let mut results = Vec::with_capacity(bundle.config.verifier.checks.len() + 1);
        for (idx, check) in bundle.config.verifier.checks.iter().enumerate() {
            let check_id = if check.check_id.is_empty() {
                format!("check-{}", idx + 1)
            } else {
                check.check_id.clone()
            };
            let remaining = remaining_or_min(deadline, budget);
            let result = checks::run_check(handle, &check_id, check, remaining).await;
            debug!(
                run_id = %handle.run_id,
                "Check {}: {} - {}",
                check_id,
                check.check_type,
                if result.passed { "PASS" } else { "FAIL" }
            );
            results.push(result);
        }

        let command = &bundle.config.verifier.command;
        let remaining = remaining_or_min(deadline, budget);
        let (command_result, test_output, timed_out) =
            match handle.execute(command, remaining).await {
                Ok(out) => {
                    let result = if out.success() {
                        CheckResult::pass(TEST_COMMAND_CHECK, "test_command", command)
                            .with_values("exit 0", "exit 0")
                    } else {
                        CheckResult::fail(
                            TEST_COMMAND_CHECK,
                            "test_command",
                            command,
                            format!("Test command exited with code {}", out.exit_code),
                        )
                        .with_values("exit 0", format!("exit {}", out.exit_code))
                    };
                    (result, out.combined(), false)
                }
                Err(SandboxError::TimeoutExceeded { timeout, partial }) => (
                    CheckResult::fail(
                        TEST_COMMAND_CHECK,
                        "test_command",
                        command,
                        format!("Test command timed out after {:?}", timeout),
                    ),
                    partial.combined(),
                    true,
                ),
                Err(e) => (
                    CheckResult::fail(
                        TEST_COMMAND_CHECK,
                        "test_command",
                        command,
                        format!("Test command could not run: {}", e),
                    ),
                    String::new(),
                    false,
                ),
            };
        results.push(command_result);

        let passed = results.iter().filter(|r| r.passed).count();
        let failed = results.len() - passed;
        let reward = u8::from(failed == 0);

        write_reward(&handle.reward_path(), reward)?;

        let outcome = VerificationOutcome {
            passed,
            failed,
            reward,
            timed_out,
            checks: results,
            test_output: tail(&test_output, TEST_OUTPUT_TAIL),
            duration_ms: start.elapsed().as_millis() as u64,
        };
        self.metrics.record_verification(outcome.outcome_label());

        info!(
            run_id = %handle.run_id,
            task_id = %bundle.id,
            passed,
            failed,
            reward,
            "Verification complete: {}",
            outcome.outcome_label()
        );
        Ok(outcome)
    }
}

/// Time left until `deadline`, never below a millisecond so that an
/// exhausted budget still yields a timeout instead of a skipped command.
fn remaining_or_min(deadline: Option<Instant>, budget: Duration) -> Duration {
    match deadline {
        Some(deadline) => deadline
            .saturating_duration_since(Instant::now())
            .max(Duration::from_millis(1)),
        None => budget,
    }
}

/// Writes the reward as a single `1` or `0` character.
pub fn write_reward(path: &Path, reward: u8) -> Result<(), VerifierError> {
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, if reward == 1 { "1" } else { "0" })
    };
    write().map_err(|source| VerifierError::RewardWrite {
        path: path.to_path_buf(),
        source,
    })
}

/// Reads a reward file back. Surrounding whitespace is tolerated.
pub fn read_reward(path: &Path) -> Result<u8, VerifierError> {
    let content = fs::read_to_string(path)?;
    match content.trim() {
        "1" => Ok(1),
        "0" => Ok(0),
        other => {
            warn!(path = %path.display(), "Unexpected reward file content");
            Err(VerifierError::InvalidReward(other.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_reward_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("logs/verifier/reward.txt");

        write_reward(&path, 1).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "1");
        assert_eq!(read_reward(&path).unwrap(), 1);

        write_reward(&path, 0).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "0");
        assert_eq!(read_reward(&path).unwrap(), 0);
    }

    #[test]
    fn test_read_reward_rejects_garbage() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("reward.txt");

        fs::write(&path, "0.5").unwrap();
        assert!(matches!(read_reward(&path), Err(VerifierError::InvalidReward(_))));

        fs::write(&path, "1\n").unwrap();
        assert_eq!(read_reward(&path).unwrap(), 1);

        assert!(read_reward(&temp.path().join("missing")).is_err());
    }

    #[test]
    fn test_outcome_label() {
        let mut outcome = VerificationOutcome {
            passed: 1,
            failed: 0,
            reward: 1,
            timed_out: false,
            checks: vec![],
            test_output: String::new(),
            duration_ms: 0,
        };
        assert_eq!(outcome.outcome_label(), "passed");
        outcome.reward = 0;
        outcome.timed_out = true;
        assert_eq!(outcome.outcome_label(), "timed_out");
    }
}
