//! Error types for task-harbor operations.
//!
//! Defines error types for each subsystem of the harness:
//! - Bundle loading and structural validation
//! - Sandbox provisioning and command execution
//! - Edit operations applied to a sandbox tree
//! - External decision-makers driving agentic runs
//! - Verification and reward reporting
//! - Harness configuration

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::sandbox::ExecOutput;

/// Errors raised while loading a task bundle.
///
/// Every structural defect is reported at load time so that a broken bundle
/// never reaches a sandbox.
#[derive(Debug, Error)]
pub enum BundleError {
    #[error("Malformed bundle at '{path}': {reason}")]
    MalformedBundle { path: PathBuf, reason: String },

    #[error("Bundle root '{0}' does not exist or is not a directory")]
    RootNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BundleError {
    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::MalformedBundle {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the sandbox runtime.
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Provision failed: {0}")]
    ProvisionError(String),

    #[error("Command timed out after {timeout:?}")]
    TimeoutExceeded {
        timeout: Duration,
        /// Output captured before the process was killed.
        partial: Box<ExecOutput>,
    },

    #[error("Failed to spawn command: {0}")]
    Spawn(String),

    #[error("Sandbox '{0}' has already been torn down")]
    TornDown(String),

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    /// Returns true if this error is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TimeoutExceeded { .. })
    }
}

/// Errors raised by a single edit operation.
///
/// These are recoverable inside an agentic run (the decision-maker sees them
/// as observations) and fatal inside a scripted run.
#[derive(Debug, Error)]
pub enum EditError {
    #[error("No verbatim match for target in '{path}': {target:?}")]
    NoMatch { path: String, target: String },

    #[error("Path '{0}' escapes the sandbox root")]
    PathViolation(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Invalid edit: {0}")]
    InvalidEdit(String),

    #[error("Step '{command}' exited with code {exit_code}")]
    StepFailed {
        command: String,
        exit_code: i32,
        /// Tail of the step's combined output.
        output: String,
    },

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised by an external decision-maker.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Failed to start agent: {0}")]
    Spawn(String),

    #[error("Agent protocol error: {0}")]
    Protocol(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while verifying a sandbox.
#[derive(Debug, Error)]
pub enum VerifierError {
    #[error("Failed to stage tests: {0}")]
    Staging(String),

    #[error("Failed to write reward file '{path}': {source}")]
    RewardWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid reward file content {0:?}")]
    InvalidReward(String),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while building the harness configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors surfaced to the driver loop for a single run.
///
/// Only structural and provisioning failures are returned as errors; every
/// other failure is folded into a reward-0 report.
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Bundle(#[from] BundleError),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("Verifier error: {0}")]
    Verifier(#[from] VerifierError),

    #[error("Agent setup failed: {0}")]
    Agent(#[from] AgentError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_malformed_bundle_message() {
        let err = BundleError::malformed("/tasks/x", "missing instruction.md");
        let msg = err.to_string();
        assert!(msg.contains("/tasks/x"));
        assert!(msg.contains("missing instruction.md"));
    }

    #[test]
    fn test_timeout_is_timeout() {
        let err = SandboxError::TimeoutExceeded {
            timeout: Duration::from_secs(1),
            partial: Box::new(ExecOutput::default()),
        };
        assert!(err.is_timeout());
        assert!(!SandboxError::Spawn("x".into()).is_timeout());
    }
}
