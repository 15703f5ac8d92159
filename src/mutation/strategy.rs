//! Mutation strategies: scripted replay and agent-driven editing.
//!
//! Both strategies sit behind [`MutationStrategy::apply_edits`] so the driver
//! loop never needs to know where edits come from.

use std::fmt;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::agent::{AgentAction, DecisionMaker, Observation};
use super::ops::{tail, EditApplier, EditOp};
use crate::error::{EditError, SandboxError};
use crate::harness::{ExecutionLog, Phase};
use crate::metrics::MetricsCollector;
use crate::sandbox::SandboxHandle;

/// Why the mutation phase stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Every scripted edit was applied.
    Completed,
    /// The agent issued `finish`.
    Finished,
    /// The agent stopped producing actions.
    AgentExited,
    StepLimit,
    TimeBudget,
    /// The agent broke the protocol or could not be reached.
    AgentError,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Finished => write!(f, "finished"),
            Self::AgentExited => write!(f, "agent exited"),
            Self::StepLimit => write!(f, "step limit reached"),
            Self::TimeBudget => write!(f, "time budget exhausted"),
            Self::AgentError => write!(f, "agent error"),
        }
    }
}

/// Counters for one mutation phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MutationSummary {
    pub steps: usize,
    pub applied: usize,
    pub failed: usize,
    pub stop_reason: Option<StopReason>,
}

/// Capability shared by every way of mutating a sandbox tree.
#[async_trait]
pub trait MutationStrategy: Send {
    fn name(&self) -> &'static str;

    /// Applies edits to the sandbox in the order they are produced.
    ///
    /// Every edit, successful or not, is recorded in `log`.
    async fn apply_edits(
        &mut self,
        handle: &SandboxHandle,
        log: &mut ExecutionLog,
    ) -> Result<MutationSummary, EditError>;
}

/// Replays a pre-authored edit sequence; the first failure aborts it.
#[derive(Debug, Clone)]
pub struct ScriptedStrategy {
    ops: Vec<EditOp>,
    default_timeout: Duration,
}

impl ScriptedStrategy {
    pub fn new(ops: Vec<EditOp>, default_timeout: Duration) -> Self {
        Self {
            ops,
            default_timeout,
        }
    }
}

#[async_trait]
impl MutationStrategy for ScriptedStrategy {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn apply_edits(
        &mut self,
        handle: &SandboxHandle,
        log: &mut ExecutionLog,
    ) -> Result<MutationSummary, EditError> {
        let applier = EditApplier::new(handle, self.default_timeout);
        let total = self.ops.len();
        let mut summary = MutationSummary::default();

        for (idx, op) in self.ops.iter().enumerate() {
            summary.steps += 1;
            match applier.apply(op).await {
                Ok(effect) => {
                    summary.applied += 1;
                    log.record(
                        Phase::Mutation,
                        true,
                        format!("edit {}/{}: {}", idx + 1, total, effect),
                    );
                }
                Err(e) => {
                    summary.failed += 1;
                    MetricsCollector::new().record_edit_failure(self.name(), op.kind());
                    log.record_detail(
                        Phase::Mutation,
                        false,
                        format!("edit {}/{} ({}) failed: {}", idx + 1, total, op.describe(), e),
                        error_detail(&e),
                    );
                    return Err(e);
                }
            }
        }

        summary.stop_reason = Some(StopReason::Completed);
        Ok(summary)
    }
}

fn error_detail(err: &EditError) -> String {
    match err {
        EditError::StepFailed { output, .. } => output.clone(),
        EditError::Sandbox(SandboxError::TimeoutExceeded { partial, .. }) => {
            tail(&partial.combined(), 2000)
        }
        _ => String::new(),
    }
}

/// Lets an external decision-maker edit the tree one action at a time.
///
/// Failed actions are returned to the decision-maker as observations and
/// never abort the phase. The phase ends on `finish`, when the agent stops
/// producing actions, or when the step or wall-clock budget runs out.
pub struct AgenticStrategy {
    decisions: Box<dyn DecisionMaker>,
    instruction: String,
    max_steps: usize,
    time_budget: Duration,
}

impl AgenticStrategy {
    pub fn new(
        decisions: Box<dyn DecisionMaker>,
        instruction: impl Into<String>,
        max_steps: usize,
        time_budget: Duration,
    ) -> Self {
        Self {
            decisions,
            instruction: instruction.into(),
            max_steps,
            time_budget,
        }
    }
}

#[async_trait]
impl MutationStrategy for AgenticStrategy {
    fn name(&self) -> &'static str {
        "agentic"
    }

    async fn apply_edits(
        &mut self,
        handle: &SandboxHandle,
        log: &mut ExecutionLog,
    ) -> Result<MutationSummary, EditError> {
        let deadline = Instant::now().checked_add(self.time_budget);
        let applier = EditApplier::new(handle, self.time_budget);
        let metrics = MetricsCollector::new();
        let mut summary = MutationSummary::default();
        let mut last: Option<Observation> = None;

        let reason = loop {
            if summary.steps >= self.max_steps {
                break StopReason::StepLimit;
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => self.time_budget,
            };
            if remaining.is_zero() {
                break StopReason::TimeBudget;
            }

            let next = tokio::time::timeout(
                remaining,
                self.decisions.next_action(&self.instruction, last.as_ref()),
            )
            .await;
            let action = match next {
                Err(_) => break StopReason::TimeBudget,
                Ok(Err(e)) => {
                    log.record(Phase::Mutation, false, format!("agent error: {}", e));
                    break StopReason::AgentError;
                }
                Ok(Ok(None)) => break StopReason::AgentExited,
                Ok(Ok(Some(AgentAction::Finish { summary: note }))) => {
                    log.record(
                        Phase::Mutation,
                        true,
                        format!("agent finished: {}", note.unwrap_or_default()),
                    );
                    break StopReason::Finished;
                }
                Ok(Ok(Some(action))) => action,
            };

            summary.steps += 1;
            let step = summary.steps;
            let observation = perform(&applier, step, &action, remaining).await;

            if observation.ok {
                if action.is_mutating() {
                    summary.applied += 1;
                }
                log.record(
                    Phase::Mutation,
                    true,
                    format!("step {}: {}", step, describe_action(&action)),
                );
            } else {
                summary.failed += 1;
                metrics.record_edit_failure(self.name(), action.name());
                log.record_detail(
                    Phase::Mutation,
                    false,
                    format!(
                        "step {}: {} failed: {}",
                        step,
                        describe_action(&action),
                        observation.error.as_deref().unwrap_or("unknown error")
                    ),
                    tail(&observation.output, 2000),
                );
            }
            last = Some(observation);
        };

        self.decisions.shutdown().await;
        info!(
            run_id = %handle.run_id,
            steps = summary.steps,
            failed = summary.failed,
            "Agent phase ended: {}",
            reason
        );
        log.record(
            Phase::Mutation,
            reason != StopReason::AgentError,
            format!("agent phase ended after {} steps: {}", summary.steps, reason),
        );
        summary.stop_reason = Some(reason);
        Ok(summary)
    }
}

fn describe_action(action: &AgentAction) -> String {
    match action {
        AgentAction::ReadFile { path } => format!("read_file {}", path),
        AgentAction::WriteFile { path, .. } => format!("write_file {}", path),
        AgentAction::Replace { path, .. } => format!("replace {}", path),
        AgentAction::Shell { command, .. } => format!("shell `{}`", super::ops::truncate(command, 80)),
        AgentAction::Finish { .. } => "finish".to_string(),
    }
}

/// Executes one agent action and turns the result into an observation.
async fn perform(
    applier: &EditApplier<'_>,
    step: usize,
    action: &AgentAction,
    remaining: Duration,
) -> Observation {
    let result = match action {
        AgentAction::ReadFile { path } => applier.read_file(path).await,
        AgentAction::WriteFile { path, content } => applier.write_file(path, content).await,
        AgentAction::Replace {
            path,
            old,
            new,
            all,
        } => applier.replace(path, old, new, *all).await,
        AgentAction::Shell {
            command,
            timeout_sec,
        } => {
            let timeout = timeout_sec
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .map_or(remaining, |t| t.min(remaining));
            return match applier.run(command, timeout).await {
                Ok(out) if out.success() => Observation::success(step, out.combined()),
                Ok(out) => Observation::failure(
                    step,
                    out.combined(),
                    format!("command exited with code {}", out.exit_code),
                ),
                Err(SandboxError::TimeoutExceeded { timeout, partial }) => Observation::failure(
                    step,
                    partial.combined(),
                    format!("command timed out after {:?}", timeout),
                ),
                Err(e) => Observation::failure(step, "", e.to_string()),
            };
        }
        AgentAction::Finish { .. } => Ok(String::new()),
    };

    match result {
        Ok(output) => Observation::success(step, output),
        Err(e) => Observation::failure(step, "", e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::{ReferenceSolution, TaskBundle, TaskConfig};
    use crate::mutation::ScriptedDecisions;
    use crate::sandbox::{SandboxConfig, SandboxRuntime};
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn bundle(root: &Path) -> TaskBundle {
        let env = root.join("environment");
        fs::create_dir_all(env.join("app")).unwrap();
        fs::write(env.join("app/settings.py"), "DEBUG = True\nPORT = 8081\n").unwrap();
        TaskBundle {
            id: "strategy-test".into(),
            root: root.to_path_buf(),
            instruction: "Turn off debug".into(),
            config: TaskConfig::default(),
            solution: ReferenceSolution::Edits(vec![]),
        }
    }

    async fn provision(temp: &TempDir) -> (TaskBundle, SandboxHandle) {
        let bundle = bundle(&temp.path().join("bundle"));
        let runtime = SandboxRuntime::new(SandboxConfig::new(temp.path().join("runs")));
        let handle = runtime.provision(&bundle).await.unwrap();
        (bundle, handle)
    }

    #[tokio::test]
    async fn test_scripted_strategy_applies_in_order() {
        let temp = TempDir::new().unwrap();
        let (_bundle, mut handle) = provision(&temp).await;

        let mut strategy = ScriptedStrategy::new(
            vec![
                EditOp::Replace {
                    path: "app/settings.py".into(),
                    old: "DEBUG = True".into(),
                    new: "DEBUG = False".into(),
                    all: false,
                },
                // Only matches if the first edit already happened.
                EditOp::Replace {
                    path: "app/settings.py".into(),
                    old: "DEBUG = False\nPORT = 8081".into(),
                    new: "DEBUG = False\nPORT = 8080".into(),
                    all: false,
                },
                EditOp::Append {
                    path: "app/settings.py".into(),
                    content: "ALLOWED_HOSTS = ['*']\n".into(),
                },
            ],
            Duration::from_secs(10),
        );
        let mut log = ExecutionLog::new();
        let summary = strategy.apply_edits(&handle, &mut log).await.unwrap();

        assert_eq!(summary.applied, 3);
        assert_eq!(summary.stop_reason, Some(StopReason::Completed));
        let content = fs::read_to_string(handle.root().join("app/settings.py")).unwrap();
        assert_eq!(content, "DEBUG = False\nPORT = 8080\nALLOWED_HOSTS = ['*']\n");
        assert_eq!(log.len(), 3);

        handle.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scripted_strategy_aborts_on_no_match() {
        let temp = TempDir::new().unwrap();
        let (_bundle, mut handle) = provision(&temp).await;

        let mut strategy = ScriptedStrategy::new(
            vec![
                EditOp::Replace {
                    path: "app/settings.py".into(),
                    old: "DEBUG = True ".into(),
                    new: "DEBUG = False".into(),
                    all: false,
                },
                EditOp::Overwrite {
                    path: "never.txt".into(),
                    content: "x".into(),
                },
            ],
            Duration::from_secs(10),
        );
        let mut log = ExecutionLog::new();
        let err = strategy.apply_edits(&handle, &mut log).await.unwrap_err();

        assert!(matches!(err, EditError::NoMatch { .. }));
        assert_eq!(log.failures().count(), 1);
        assert!(!handle.root().join("never.txt").exists());
        let content = fs::read_to_string(handle.root().join("app/settings.py")).unwrap();
        assert_eq!(content, "DEBUG = True\nPORT = 8081\n");

        handle.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scripted_run_step_failure() {
        let temp = TempDir::new().unwrap();
        let (_bundle, mut handle) = provision(&temp).await;

        let mut strategy = ScriptedStrategy::new(
            vec![EditOp::Run {
                command: "echo migrating; exit 2".into(),
                timeout_sec: None,
            }],
            Duration::from_secs(10),
        );
        let mut log = ExecutionLog::new();
        let err = strategy.apply_edits(&handle, &mut log).await.unwrap_err();

        assert!(matches!(err, EditError::StepFailed { exit_code: 2, .. }));
        let entry = log.failures().next().unwrap();
        assert!(entry.detail.as_deref().unwrap_or_default().contains("migrating"));

        handle.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_agentic_strategy_recovers_from_failed_edits() {
        let temp = TempDir::new().unwrap();
        let (bundle, mut handle) = provision(&temp).await;

        let decisions = ScriptedDecisions::new(vec![
            AgentAction::ReadFile {
                path: "app/settings.py".into(),
            },
            AgentAction::Replace {
                path: "app/settings.py".into(),
                old: "DEBUG=True".into(),
                new: "DEBUG=False".into(),
                all: false,
            },
            AgentAction::WriteFile {
                path: "../escape.txt".into(),
                content: "x".into(),
            },
            AgentAction::Replace {
                path: "app/settings.py".into(),
                old: "DEBUG = True".into(),
                new: "DEBUG = False".into(),
                all: false,
            },
            AgentAction::Finish { summary: None },
            AgentAction::ReadFile {
                path: "never-read".into(),
            },
        ]);
        let mut strategy =
            AgenticStrategy::new(Box::new(decisions), &bundle.instruction, 10, Duration::from_secs(30));
        let mut log = ExecutionLog::new();
        let summary = strategy.apply_edits(&handle, &mut log).await.unwrap();

        assert_eq!(summary.steps, 4);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.applied, 1);
        assert_eq!(summary.stop_reason, Some(StopReason::Finished));
        assert!(!temp.path().join("runs/escape.txt").exists());
        let content = fs::read_to_string(handle.root().join("app/settings.py")).unwrap();
        assert!(content.starts_with("DEBUG = False"));
        assert!(log
            .failures()
            .any(|e| e.message.contains("escapes the sandbox root")));

        handle.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_agentic_strategy_step_limit() {
        let temp = TempDir::new().unwrap();
        let (bundle, mut handle) = provision(&temp).await;

        let decisions = ScriptedDecisions::new(
            (0..5).map(|_| AgentAction::Shell {
                command: "true".into(),
                timeout_sec: Some(5.0),
            }),
        );
        let mut strategy =
            AgenticStrategy::new(Box::new(decisions), &bundle.instruction, 2, Duration::from_secs(30));
        let mut log = ExecutionLog::new();
        let summary = strategy.apply_edits(&handle, &mut log).await.unwrap();

        assert_eq!(summary.steps, 2);
        assert_eq!(summary.stop_reason, Some(StopReason::StepLimit));

        handle.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn test_agentic_shell_timeout_is_an_observation() {
        let temp = TempDir::new().unwrap();
        let (bundle, mut handle) = provision(&temp).await;

        let decisions = ScriptedDecisions::new(vec![AgentAction::Shell {
            command: "sleep 30".into(),
            timeout_sec: Some(0.3),
        }]);
        let mut strategy =
            AgenticStrategy::new(Box::new(decisions), &bundle.instruction, 5, Duration::from_secs(30));
        let mut log = ExecutionLog::new();
        let summary = strategy.apply_edits(&handle, &mut log).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.stop_reason, Some(StopReason::AgentExited));
        assert!(log.failures().any(|e| e.message.contains("timed out")));

        handle.teardown().await.unwrap();
    }
}
