//! Configuration for the sandbox runtime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Upper bound on captured output per stream.
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Isolation mechanism used for each run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Isolation {
    /// Private temp-directory copy, commands run as host processes.
    #[default]
    Local,
    /// One container per run with the run directory bind-mounted.
    Docker,
}

impl std::fmt::Display for Isolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for Isolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "tempdir" => Ok(Self::Local),
            "docker" | "container" => Ok(Self::Docker),
            other => Err(format!("Unknown isolation backend: {}", other)),
        }
    }
}

/// Container settings for the docker backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DockerOptions {
    /// Image used when a bundle does not declare one.
    pub default_image: String,
    /// Memory limit in MB.
    pub memory_mb: u64,
    /// CPU limit (0 disables the flag).
    pub cpu_limit: f64,
    /// Network mode ("none", "bridge", "host").
    pub network_mode: String,
}

impl Default for DockerOptions {
    fn default() -> Self {
        Self {
            default_image: "python:3.12-slim".to_string(),
            memory_mb: 4096,
            cpu_limit: 0.0,
            network_mode: "none".to_string(),
        }
    }
}

/// Configuration for the sandbox runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    pub isolation: Isolation,
    /// Parent directory for per-run directories.
    pub work_dir: PathBuf,
    /// Preserve run directories after teardown.
    pub keep_runs: bool,
    /// Extra environment variables for every command.
    pub env_vars: Vec<(String, String)>,
    /// Per-stream capture limit.
    pub max_output_bytes: usize,
    pub docker: DockerOptions,
}

impl SandboxConfig {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            isolation: Isolation::Local,
            work_dir: work_dir.into(),
            keep_runs: false,
            env_vars: Vec::new(),
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            docker: DockerOptions::default(),
        }
    }

    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_keep_runs(mut self, keep: bool) -> Self {
        self.keep_runs = keep;
        self
    }

    /// Adds an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.push((key.into(), value.into()));
        self
    }

    pub fn with_max_output_bytes(mut self, limit: usize) -> Self {
        self.max_output_bytes = limit;
        self
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self::new(std::env::temp_dir().join("task-harbor"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sandbox_config_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.isolation, Isolation::Local);
        assert!(!config.keep_runs);
        assert_eq!(config.max_output_bytes, DEFAULT_MAX_OUTPUT_BYTES);
        assert_eq!(config.docker.network_mode, "none");
    }

    #[test]
    fn test_sandbox_config_builder() {
        let config = SandboxConfig::new("/tmp/runs")
            .with_isolation(Isolation::Docker)
            .with_keep_runs(true)
            .with_env("PYTHONDONTWRITEBYTECODE", "1");

        assert_eq!(config.work_dir, PathBuf::from("/tmp/runs"));
        assert_eq!(config.isolation, Isolation::Docker);
        assert!(config.keep_runs);
        assert_eq!(config.env_vars.len(), 1);
    }

    #[test]
    fn test_isolation_from_str() {
        assert_eq!("local".parse::<Isolation>().unwrap(), Isolation::Local);
        assert_eq!("Docker".parse::<Isolation>().unwrap(), Isolation::Docker);
        assert!("vm".parse::<Isolation>().is_err());
    }
}
