//! Driver loop: provision, mutate, verify, tear down.
//!
//! A run never shares state with another run. Structural and provisioning
//! failures are returned as errors; every other failure becomes a report with
//! reward 0 and the cause recorded in the execution log.

pub mod config;
pub mod report;

pub use config::HarnessConfig;
pub use report::{
    ExecutionLog, HarnessSummary, LogEntry, Phase, RunOutcome, RunReport, SelfCheckReport,
};

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::bundle::TaskBundle;
use crate::error::{AgentError, HarnessError};
use crate::metrics::MetricsCollector;
use crate::mutation::{
    AgentAction, AgenticStrategy, DecisionMaker, MutationStrategy, MutationSummary,
    ProcessDecisionMaker, ScriptedDecisions, ScriptedStrategy,
};
use crate::sandbox::{SandboxHandle, SandboxRuntime};
use crate::verifier::{read_reward, write_reward, Verifier};

/// What is applied to the sandbox before verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// The bundle's reference solution.
    Oracle,
    /// Nothing.
    #[serde(rename = "noop")]
    NoOp,
    /// An external decision-maker.
    Agent,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Oracle => write!(f, "oracle"),
            Self::NoOp => write!(f, "noop"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

impl std::str::FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "oracle" => Ok(Self::Oracle),
            "noop" | "no-op" | "nop" => Ok(Self::NoOp),
            "agent" => Ok(Self::Agent),
            other => Err(format!("Unknown run mode: {}", other)),
        }
    }
}

/// Where agent runs get their decision-maker from.
#[derive(Debug, Clone)]
pub enum AgentSource {
    /// Spawn a fresh process per run, speaking JSON lines.
    Command(String),
    /// Replay a fixed list of actions.
    Replay(Vec<AgentAction>),
    /// Replay actions from a YAML/JSON file.
    ReplayFile(PathBuf),
}

impl AgentSource {
    fn launch(&self) -> Result<Box<dyn DecisionMaker>, AgentError> {
        Ok(match self {
            Self::Command(command) => Box::new(ProcessDecisionMaker::spawn(command)?),
            Self::Replay(actions) => Box::new(ScriptedDecisions::new(actions.clone())),
            Self::ReplayFile(path) => Box::new(ScriptedDecisions::from_file(path)?),
        })
    }
}

/// Runs bundles through isolated sandboxes and reads back their rewards.
pub struct Harness {
    config: HarnessConfig,
    runtime: SandboxRuntime,
    verifier: Verifier,
    agent: Option<AgentSource>,
    metrics: MetricsCollector,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        let runtime = SandboxRuntime::new(config.sandbox_config());
        Self {
            config,
            runtime,
            verifier: Verifier::new(),
            agent: None,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the decision-maker used by [`RunMode::Agent`] runs.
    pub fn with_agent(mut self, agent: AgentSource) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Executes one run of `bundle`.
    ///
    /// The sandbox is torn down on every path once provisioned.
    pub async fn run(&self, bundle: &TaskBundle, mode: RunMode) -> Result<RunReport, HarnessError> {
        let started_at = Utc::now();
        let timer = Instant::now();

        let mut strategy = self.strategy_for(bundle, mode)?;

        let mut handle = self.runtime.provision(bundle).await?;
        self.metrics.sandbox_provisioned();
        info!(
            run_id = %handle.run_id,
            task_id = %bundle.id,
            mode = %mode,
            "Starting run"
        );

        let mut log = ExecutionLog::new();
        log.record(
            Phase::Provision,
            true,
            format!("provisioned {} from {}", handle.run_id, bundle.base_dir().display()),
        );

        let mut report = self
            .drive(&handle, bundle, mode, strategy.as_mut(), &mut log)
            .await;

        report.duration_ms = timer.elapsed().as_millis() as u64;
        report.started_at = started_at;
        report.finished_at = Utc::now();
        report.log = log;

        let report_path = handle.layout().logs.join("run.json");
        if let Err(e) = report.save(&report_path) {
            warn!(run_id = %handle.run_id, "Failed to save run report: {}", e);
        }

        if let Err(e) = handle.teardown().await {
            report
                .log
                .record(Phase::Teardown, false, format!("teardown failed: {}", e));
        } else {
            report.log.record(Phase::Teardown, true, "sandbox released");
        }
        self.metrics.sandbox_released();
        self.metrics
            .record_run(&mode.to_string(), report.reward, timer.elapsed().as_secs_f64());

        info!(
            run_id = %report.run_id,
            task_id = %report.task_id,
            reward = report.reward,
            outcome = %report.outcome,
            duration_ms = report.duration_ms,
            "Run finished"
        );
        Ok(report)
    }

    fn strategy_for(
        &self,
        bundle: &TaskBundle,
        mode: RunMode,
    ) -> Result<Option<Box<dyn MutationStrategy>>, HarnessError> {
        let strategy: Box<dyn MutationStrategy> = match mode {
            RunMode::NoOp => return Ok(None),
            RunMode::Oracle => Box::new(ScriptedStrategy::new(
                bundle.solution.to_edits(bundle.solution_timeout()),
                bundle.solution_timeout(),
            )),
            RunMode::Agent => {
                let source = self.agent.as_ref().ok_or_else(|| {
                    AgentError::Spawn("no agent configured for agent mode".to_string())
                })?;
                let max_steps = match self.config.max_agent_steps {
                    Some(cap) => bundle.config.agent.max_steps.min(cap),
                    None => bundle.config.agent.max_steps,
                };
                Box::new(AgenticStrategy::new(
                    source.launch()?,
                    bundle.instruction.clone(),
                    max_steps,
                    bundle.agent_timeout(),
                ))
            }
        };
        Ok(Some(strategy))
    }

    /// Mutation and verification; never fails, only lowers the reward.
    async fn drive(
        &self,
        handle: &SandboxHandle,
        bundle: &TaskBundle,
        mode: RunMode,
        strategy: Option<&mut Box<dyn MutationStrategy>>,
        log: &mut ExecutionLog,
    ) -> RunReport {
        let now = Utc::now();
        let mut report = RunReport {
            run_id: handle.run_id.clone(),
            task_id: bundle.id.clone(),
            mode,
            reward: 0,
            outcome: RunOutcome::Failed,
            passed_checks: 0,
            failed_checks: 0,
            edits_applied: 0,
            edit_failures: 0,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            mutation_ms: 0,
            verification_ms: 0,
            test_output: String::new(),
            log: ExecutionLog::new(),
        };

        let mutation_timer = Instant::now();
        if mode == RunMode::Oracle {
            if let Err(e) = handle.stage_solution(bundle) {
                log.record(Phase::Mutation, false, format!("failed to stage solution: {}", e));
                report.outcome = RunOutcome::AuthoringError;
                self.finish_without_verification(handle, log, &mut report);
                return report;
            }
        }

        if let Some(strategy) = strategy {
            let result: Result<MutationSummary, _> = strategy.apply_edits(handle, log).await;
            report.mutation_ms = mutation_timer.elapsed().as_millis() as u64;
            match result {
                Ok(summary) => {
                    report.edits_applied = summary.applied;
                    report.edit_failures = summary.failed;
                }
                Err(e) => {
                    error!(
                        run_id = %handle.run_id,
                        task_id = %bundle.id,
                        "Reference solution failed to apply: {}",
                        e
                    );
                    report.edit_failures = 1;
                    report.outcome = RunOutcome::AuthoringError;
                    self.finish_without_verification(handle, log, &mut report);
                    return report;
                }
            }
        }

        let verification_timer = Instant::now();
        match self.verifier.verify(handle, bundle).await {
            Ok(outcome) => {
                report.passed_checks = outcome.passed;
                report.failed_checks = outcome.failed;
                report.test_output = outcome.test_output.clone();
                report.outcome = if outcome.reward == 1 {
                    RunOutcome::Passed
                } else if outcome.timed_out {
                    RunOutcome::TimedOut
                } else {
                    RunOutcome::Failed
                };
                for check in outcome.checks.iter().filter(|c| !c.passed) {
                    log.record(
                        Phase::Verification,
                        false,
                        format!(
                            "check {} ({}) failed: {}",
                            check.check_id,
                            check.check_type,
                            check.error.as_deref().unwrap_or_default()
                        ),
                    );
                }
                log.record_detail(
                    Phase::Verification,
                    true,
                    format!(
                        "{} passed, {} failed, reward {}",
                        outcome.passed, outcome.failed, outcome.reward
                    ),
                    outcome.test_output,
                );
            }
            Err(e) => {
                log.record(Phase::Verification, false, format!("verification failed: {}", e));
                report.outcome = RunOutcome::VerifierError;
                if let Err(e) = write_reward(&handle.reward_path(), 0) {
                    log.record(Phase::Verification, false, e.to_string());
                }
            }
        }
        report.verification_ms = verification_timer.elapsed().as_millis() as u64;

        report.reward = self.read_back(handle, log, &mut report);
        report
    }

    /// Records reward 0 for a run whose mutation phase could not complete.
    fn finish_without_verification(
        &self,
        handle: &SandboxHandle,
        log: &mut ExecutionLog,
        report: &mut RunReport,
    ) {
        if let Err(e) = write_reward(&handle.reward_path(), 0) {
            log.record(Phase::Verification, false, e.to_string());
        }
        report.reward = self.read_back(handle, log, report);
    }

    /// The reward file is the contract; whatever it says is the reward.
    fn read_back(&self, handle: &SandboxHandle, log: &mut ExecutionLog, report: &mut RunReport) -> u8 {
        match read_reward(&handle.reward_path()) {
            Ok(reward) => reward,
            Err(e) => {
                log.record(Phase::Verification, false, format!("unreadable reward: {}", e));
                report.outcome = RunOutcome::VerifierError;
                0
            }
        }
    }

    /// Runs the oracle and no-op modes on independent sandboxes.
    pub async fn self_check(&self, bundle: &TaskBundle) -> Result<SelfCheckReport, HarnessError> {
        let (oracle, noop) = tokio::join!(
            self.run(bundle, RunMode::Oracle),
            self.run(bundle, RunMode::NoOp)
        );
        let report = SelfCheckReport::new(&bundle.id, oracle?, noop?);
        match report.problem() {
            None => info!(task_id = %bundle.id, "Self-check passed"),
            Some(problem) => warn!(task_id = %bundle.id, "Self-check failed: {}", problem),
        }
        Ok(report)
    }

    /// Runs many bundles with bounded parallelism.
    ///
    /// Results are in completion order, paired with the bundle id.
    pub async fn run_many(
        &self,
        bundles: &[Arc<TaskBundle>],
        mode: RunMode,
    ) -> Vec<(String, Result<RunReport, HarnessError>)> {
        stream::iter(bundles.iter())
            .map(|bundle| async move { (bundle.id.clone(), self.run(bundle, mode).await) })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await
    }

    /// Self-checks many bundles with bounded parallelism.
    pub async fn self_check_many(
        &self,
        bundles: &[Arc<TaskBundle>],
    ) -> Vec<(String, Result<SelfCheckReport, HarnessError>)> {
        stream::iter(bundles.iter())
            .map(|bundle| async move { (bundle.id.clone(), self.self_check(bundle).await) })
            .buffer_unordered(self.config.parallelism.max(1))
            .collect()
            .await
    }
}

/// Aggregates `run_many` results.
pub fn summarize(results: &[(String, Result<RunReport, HarnessError>)]) -> HarnessSummary {
    let errors = results.iter().filter(|(_, r)| r.is_err()).count();
    HarnessSummary::from_reports(
        results.iter().filter_map(|(_, r)| r.as_ref().ok()),
        errors,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_mode_parse_and_display() {
        assert_eq!("oracle".parse::<RunMode>().unwrap(), RunMode::Oracle);
        assert_eq!("no-op".parse::<RunMode>().unwrap(), RunMode::NoOp);
        assert_eq!("Agent".parse::<RunMode>().unwrap(), RunMode::Agent);
        assert!("random".parse::<RunMode>().is_err());
        assert_eq!(RunMode::NoOp.to_string(), "noop");
    }

    #[test]
    fn test_run_mode_serde() {
        assert_eq!(serde_json::to_string(&RunMode::NoOp).unwrap(), "\"noop\"");
        let mode: RunMode = serde_json::from_str("\"agent\"").unwrap();
        assert_eq!(mode, RunMode::Agent);
    }
}
