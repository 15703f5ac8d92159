//! Task bundle data model.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mutation::EditOp;
use crate::verifier::CheckSpec;

/// Default verification command, run from the sandbox root.
pub const DEFAULT_TEST_COMMAND: &str = "bash \"$TESTS_DIR/test.sh\"";

/// Difficulty classification of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    Easy,
    #[default]
    Medium,
    Hard,
}

impl std::fmt::Display for Difficulty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Easy => write!(f, "easy"),
            Self::Medium => write!(f, "medium"),
            Self::Hard => write!(f, "hard"),
        }
    }
}

/// Descriptive metadata, never consulted by the verifier.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default)]
    pub difficulty: Difficulty,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub author: Option<String>,
}

/// Declared base project for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    /// Base tree, relative to the bundle root.
    #[serde(default = "default_base")]
    pub base: PathBuf,
    /// Where the tree is visible inside a container.
    #[serde(default = "default_mount_point")]
    pub mount_point: String,
    /// Container image for the docker isolation backend.
    #[serde(default)]
    pub image: Option<String>,
    /// Expected SHA-256 digest of the base tree.
    #[serde(default)]
    pub digest: Option<String>,
}

impl Default for EnvironmentSpec {
    fn default() -> Self {
        Self {
            base: default_base(),
            mount_point: default_mount_point(),
            image: None,
            digest: None,
        }
    }
}

fn default_base() -> PathBuf {
    PathBuf::from("environment")
}

fn default_mount_point() -> String {
    "/app".to_string()
}

/// Verification phase settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierSpec {
    #[serde(default = "default_test_command")]
    pub command: String,
    #[serde(default = "default_verifier_timeout")]
    pub timeout_sec: f64,
    /// Structural checks evaluated alongside the test command.
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

impl Default for VerifierSpec {
    fn default() -> Self {
        Self {
            command: default_test_command(),
            timeout_sec: default_verifier_timeout(),
            checks: Vec::new(),
        }
    }
}

fn default_test_command() -> String {
    DEFAULT_TEST_COMMAND.to_string()
}

fn default_verifier_timeout() -> f64 {
    120.0
}

/// Agent phase settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(default = "default_agent_timeout")]
    pub timeout_sec: f64,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
}

impl Default for AgentSpec {
    fn default() -> Self {
        Self {
            timeout_sec: default_agent_timeout(),
            max_steps: default_max_steps(),
        }
    }
}

fn default_agent_timeout() -> f64 {
    600.0
}

fn default_max_steps() -> usize {
    50
}

/// Reference solution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionSpec {
    /// Budget for each `run` step of the reference script.
    #[serde(default = "default_solution_timeout")]
    pub timeout_sec: f64,
}

impl Default for SolutionSpec {
    fn default() -> Self {
        Self {
            timeout_sec: default_solution_timeout(),
        }
    }
}

fn default_solution_timeout() -> f64 {
    300.0
}

/// Contents of `task.yaml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub metadata: TaskMetadata,
    #[serde(default)]
    pub environment: EnvironmentSpec,
    #[serde(default)]
    pub verifier: VerifierSpec,
    #[serde(default)]
    pub agent: AgentSpec,
    #[serde(default)]
    pub solution: SolutionSpec,
}

/// The reference mutation for a task.
#[derive(Debug, Clone)]
pub enum ReferenceSolution {
    /// Structured edit list from `solution/edits.yaml`.
    Edits(Vec<EditOp>),
    /// Shell script at `solution/solve.sh`, run from the sandbox root.
    Script(PathBuf),
}

impl ReferenceSolution {
    /// Lowers the solution into the edit sequence the scripted strategy runs.
    pub fn to_edits(&self, timeout: Duration) -> Vec<EditOp> {
        match self {
            Self::Edits(ops) => ops.clone(),
            Self::Script(_) => vec![EditOp::Run {
                command: "bash \"$SOLUTION_DIR/solve.sh\"".to_string(),
                timeout_sec: Some(timeout.as_secs_f64()),
            }],
        }
    }
}

/// A loaded, validated task bundle.
///
/// Bundles are read-only inputs; runs share them behind an `Arc` and copy
/// everything they mutate.
#[derive(Debug, Clone)]
pub struct TaskBundle {
    /// Unique slug.
    pub id: String,
    /// Bundle directory.
    pub root: PathBuf,
    /// Instruction shown to the agent.
    pub instruction: String,
    /// Parsed `task.yaml`.
    pub config: TaskConfig,
    /// Reference mutation.
    pub solution: ReferenceSolution,
}

impl TaskBundle {
    /// Directory holding the base project tree.
    pub fn base_dir(&self) -> PathBuf {
        self.root.join(&self.config.environment.base)
    }

    /// Directory holding the reference solution.
    pub fn solution_dir(&self) -> PathBuf {
        self.root.join("solution")
    }

    /// Directory holding the verification suite.
    pub fn tests_dir(&self) -> PathBuf {
        self.root.join("tests")
    }

    pub fn verifier_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.verifier.timeout_sec)
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.agent.timeout_sec)
    }

    pub fn solution_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.config.solution.timeout_sec)
    }
}
