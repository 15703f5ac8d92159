//! Decision-makers for agentic runs.
//!
//! A decision-maker issues one [`AgentAction`] at a time and sees the
//! [`Observation`] produced by the previous action before choosing the next.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

use crate::error::AgentError;

/// Primitive operation requested by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentAction {
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        content: String,
    },
    Replace {
        path: String,
        old: String,
        new: String,
        #[serde(default)]
        all: bool,
    },
    Shell {
        command: String,
        #[serde(default)]
        timeout_sec: Option<f64>,
    },
    Finish {
        #[serde(default)]
        summary: Option<String>,
    },
}

impl AgentAction {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ReadFile { .. } => "read_file",
            Self::WriteFile { .. } => "write_file",
            Self::Replace { .. } => "replace",
            Self::Shell { .. } => "shell",
            Self::Finish { .. } => "finish",
        }
    }

    /// True for actions that may change the tree.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self,
            Self::WriteFile { .. } | Self::Replace { .. } | Self::Shell { .. }
        )
    }
}

/// Result of one agent action, fed back to the decision-maker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub step: usize,
    pub ok: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Observation {
    pub fn success(step: usize, output: impl Into<String>) -> Self {
        Self {
            step,
            ok: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(step: usize, output: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            step,
            ok: false,
            output: output.into(),
            error: Some(error.into()),
        }
    }
}

/// Source of actions for the agentic strategy.
#[async_trait]
pub trait DecisionMaker: Send {
    /// Returns the next action, or `None` when the agent has nothing more to do.
    ///
    /// `last` is `None` on the first call.
    async fn next_action(
        &mut self,
        instruction: &str,
        last: Option<&Observation>,
    ) -> Result<Option<AgentAction>, AgentError>;

    /// Releases any resources held by the decision-maker.
    async fn shutdown(&mut self) {}
}

/// Replays a fixed sequence of actions.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDecisions {
    queue: VecDeque<AgentAction>,
    observations: Vec<Observation>,
}

impl ScriptedDecisions {
    pub fn new(actions: impl IntoIterator<Item = AgentAction>) -> Self {
        Self {
            queue: actions.into_iter().collect(),
            observations: Vec::new(),
        }
    }

    /// Loads a replay file: a YAML (or JSON) list of actions.
    pub fn from_file(path: &Path) -> Result<Self, AgentError> {
        let content = std::fs::read_to_string(path)?;
        let actions: Vec<AgentAction> = serde_yaml::from_str(&content).map_err(|e| {
            AgentError::Protocol(format!("invalid replay file {}: {}", path.display(), e))
        })?;
        Ok(Self::new(actions))
    }

    /// Observations received so far.
    pub fn observations(&self) -> &[Observation] {
        &self.observations
    }

    pub fn remaining(&self) -> usize {
        self.queue.len()
    }
}

#[async_trait]
impl DecisionMaker for ScriptedDecisions {
    async fn next_action(
        &mut self,
        _instruction: &str,
        last: Option<&Observation>,
    ) -> Result<Option<AgentAction>, AgentError> {
        if let Some(obs) = last {
            self.observations.push(obs.clone());
        }
        Ok(self.queue.pop_front())
    }
}

#[derive(Serialize)]
struct InstructionMessage<'a> {
    instruction: &'a str,
}

/// External agent process speaking JSON lines over stdin/stdout.
///
/// The harness writes `{"instruction": ...}` first and then one observation
/// per line; the agent answers every message with one action per line.
/// End of output ends the loop.
pub struct ProcessDecisionMaker {
    command: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    started: bool,
}

impl ProcessDecisionMaker {
    /// Spawns `command` through `bash -c`.
    pub fn spawn(command: &str) -> Result<Self, AgentError> {
        let mut child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AgentError::Spawn(format!("{}: {}", command, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AgentError::Spawn("agent stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AgentError::Spawn("agent stdout unavailable".to_string()))?;

        debug!(command, "Spawned agent process");
        Ok(Self {
            command: command.to_string(),
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            started: false,
        })
    }

    async fn send_line(&mut self, line: String) -> Result<(), AgentError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(AgentError::Protocol("agent stdin is closed".to_string()));
        };
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl DecisionMaker for ProcessDecisionMaker {
    async fn next_action(
        &mut self,
        instruction: &str,
        last: Option<&Observation>,
    ) -> Result<Option<AgentAction>, AgentError> {
        let message = if !self.started {
            self.started = true;
            serde_json::to_string(&InstructionMessage { instruction })?
        } else if let Some(obs) = last {
            serde_json::to_string(obs)?
        } else {
            return Err(AgentError::Protocol(
                "no observation to send after the first step".to_string(),
            ));
        };

        if let Err(e) = self.send_line(message).await {
            // A closed pipe means the agent exited; whatever it printed is still readable.
            debug!(command = %self.command, "Failed to write to agent: {}", e);
        }

        loop {
            let Some(line) = self.stdout.next_line().await? else {
                return Ok(None);
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let action: AgentAction = serde_json::from_str(line).map_err(|e| {
                AgentError::Protocol(format!("invalid action {:?}: {}", line, e))
            })?;
            return Ok(Some(action));
        }
    }

    async fn shutdown(&mut self) {
        // Closing stdin lets a well-behaved agent exit on its own.
        self.stdin.take();
        match tokio::time::timeout(std::time::Duration::from_secs(2), self.child.wait()).await {
            Ok(Ok(status)) => debug!(command = %self.command, %status, "Agent exited"),
            _ => {
                if let Err(e) = self.child.kill().await {
                    warn!(command = %self.command, "Failed to kill agent: {}", e);
                }
            }
        }
    }
}
