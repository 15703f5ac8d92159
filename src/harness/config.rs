//! Harness configuration.
//!
//! Values are layered: defaults, then an optional YAML file, then `HARBOR_*`
//! environment variables, then command-line flags.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::sandbox::config::DEFAULT_MAX_OUTPUT_BYTES;
use crate::sandbox::{DockerOptions, Isolation, SandboxConfig};

/// Configuration for the harness driver loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Isolation backend for every run.
    pub isolation: Isolation,
    /// Parent directory for per-run directories.
    pub work_dir: PathBuf,
    /// Preserve run directories after teardown.
    pub keep_runs: bool,
    /// Maximum number of runs executing at once.
    pub parallelism: usize,
    /// Per-stream capture limit for command output.
    pub max_output_bytes: usize,
    /// Extra environment variables for every sandboxed command.
    pub env: BTreeMap<String, String>,
    /// Upper bound on agent steps, applied on top of each bundle's own limit.
    pub max_agent_steps: Option<usize>,
    /// Write Prometheus metrics here after the command finishes.
    pub metrics_out: Option<PathBuf>,
    pub docker: DockerOptions,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            isolation: Isolation::Local,
            work_dir: std::env::temp_dir().join("task-harbor"),
            keep_runs: false,
            parallelism: 4,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            env: BTreeMap::new(),
            max_agent_steps: None,
            metrics_out: None,
            docker: DockerOptions::default(),
        }
    }
}

impl HarnessConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a YAML configuration file; missing keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `HARBOR_*` environment overrides.
    ///
    /// # Environment Variables
    ///
    /// - `HARBOR_ISOLATION`: `local` or `docker`
    /// - `HARBOR_WORK_DIR`: parent directory for run directories
    /// - `HARBOR_KEEP_RUNS`: keep run directories after teardown
    /// - `HARBOR_PARALLEL`: maximum concurrent runs
    /// - `HARBOR_MAX_OUTPUT_BYTES`: per-stream capture limit
    /// - `HARBOR_MAX_AGENT_STEPS`: cap on agent steps
    /// - `HARBOR_METRICS_OUT`: metrics output file
    /// - `HARBOR_DOCKER_IMAGE`: default container image
    /// - `HARBOR_DOCKER_MEMORY_MB`: container memory limit
    /// - `HARBOR_DOCKER_NETWORK`: container network mode
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for unparsable values.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary variable source.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(val) = lookup("HARBOR_ISOLATION") {
            self.isolation = val.parse().map_err(|message| ConfigError::InvalidValue {
                key: "HARBOR_ISOLATION".to_string(),
                message,
            })?;
        }

        if let Some(val) = lookup("HARBOR_WORK_DIR") {
            self.work_dir = PathBuf::from(val);
        }

        if let Some(val) = lookup("HARBOR_KEEP_RUNS") {
            self.keep_runs = parse_env_bool(&val, "HARBOR_KEEP_RUNS")?;
        }

        if let Some(val) = lookup("HARBOR_PARALLEL") {
            self.parallelism = parse_env_value(&val, "HARBOR_PARALLEL")?;
        }

        if let Some(val) = lookup("HARBOR_MAX_OUTPUT_BYTES") {
            self.max_output_bytes = parse_env_value(&val, "HARBOR_MAX_OUTPUT_BYTES")?;
        }

        if let Some(val) = lookup("HARBOR_MAX_AGENT_STEPS") {
            self.max_agent_steps = Some(parse_env_value(&val, "HARBOR_MAX_AGENT_STEPS")?);
        }

        if let Some(val) = lookup("HARBOR_METRICS_OUT") {
            self.metrics_out = Some(PathBuf::from(val));
        }

        // Docker settings
        if let Some(val) = lookup("HARBOR_DOCKER_IMAGE") {
            self.docker.default_image = val;
        }

        if let Some(val) = lookup("HARBOR_DOCKER_MEMORY_MB") {
            self.docker.memory_mb = parse_env_value(&val, "HARBOR_DOCKER_MEMORY_MB")?;
        }

        if let Some(val) = lookup("HARBOR_DOCKER_NETWORK") {
            self.docker.network_mode = val;
        }

        self.validate()?;
        Ok(self)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.parallelism == 0 {
            return Err(ConfigError::ValidationFailed(
                "parallelism must be greater than 0".to_string(),
            ));
        }

        if self.max_output_bytes == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_output_bytes must be greater than 0".to_string(),
            ));
        }

        if self.max_agent_steps == Some(0) {
            return Err(ConfigError::ValidationFailed(
                "max_agent_steps must be greater than 0".to_string(),
            ));
        }

        if self.work_dir.as_os_str().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "work_dir cannot be empty".to_string(),
            ));
        }

        // Docker validation
        if self.isolation == Isolation::Docker {
            if self.docker.default_image.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "docker.default_image cannot be empty".to_string(),
                ));
            }

            if self.docker.memory_mb < 64 {
                return Err(ConfigError::ValidationFailed(
                    "docker.memory_mb must be at least 64 MB".to_string(),
                ));
            }

            if self.docker.cpu_limit < 0.0 {
                return Err(ConfigError::ValidationFailed(
                    "docker.cpu_limit cannot be negative".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Sandbox runtime settings derived from this configuration.
    pub fn sandbox_config(&self) -> SandboxConfig {
        let mut config = SandboxConfig::new(&self.work_dir)
            .with_isolation(self.isolation)
            .with_keep_runs(self.keep_runs)
            .with_max_output_bytes(self.max_output_bytes);
        for (key, value) in &self.env {
            config = config.with_env(key, value);
        }
        config.docker = self.docker.clone();
        config
    }

    /// Builder method to set the isolation backend.
    pub fn with_isolation(mut self, isolation: Isolation) -> Self {
        self.isolation = isolation;
        self
    }

    /// Builder method to set the work directory.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    /// Builder method to set parallelism.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism;
        self
    }

    /// Builder method to keep run directories.
    pub fn with_keep_runs(mut self, keep: bool) -> Self {
        self.keep_runs = keep;
        self
    }
}

/// Parse an environment variable value.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = HarnessConfig::default();
        assert_eq!(config.isolation, Isolation::Local);
        assert_eq!(config.parallelism, 4);
        assert!(!config.keep_runs);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let config = HarnessConfig::default()
            .with_overrides_from(lookup(&[
                ("HARBOR_ISOLATION", "docker"),
                ("HARBOR_PARALLEL", "8"),
                ("HARBOR_KEEP_RUNS", "yes"),
                ("HARBOR_DOCKER_NETWORK", "bridge"),
            ]))
            .unwrap();

        assert_eq!(config.isolation, Isolation::Docker);
        assert_eq!(config.parallelism, 8);
        assert!(config.keep_runs);
        assert_eq!(config.docker.network_mode, "bridge");
    }

    #[test]
    fn test_invalid_env_value() {
        let err = HarnessConfig::default()
            .with_overrides_from(lookup(&[("HARBOR_PARALLEL", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "HARBOR_PARALLEL"));

        let err = HarnessConfig::default()
            .with_overrides_from(lookup(&[("HARBOR_KEEP_RUNS", "maybe")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_zero_parallelism_rejected() {
        let config = HarnessConfig::default().with_parallelism(0);
        assert!(matches!(config.validate(), Err(ConfigError::ValidationFailed(_))));
    }

    #[test]
    fn test_from_file_partial_yaml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("harbor.yaml");
        std::fs::write(
            &path,
            "parallelism: 2\nenv:\n  PYTHONDONTWRITEBYTECODE: \"1\"\ndocker:\n  memory_mb: 1024\n",
        )
        .unwrap();

        let config = HarnessConfig::from_file(&path).unwrap();
        assert_eq!(config.parallelism, 2);
        assert_eq!(config.docker.memory_mb, 1024);
        assert_eq!(config.docker.network_mode, "none");

        let sandbox = config.sandbox_config();
        assert_eq!(sandbox.env_vars, vec![("PYTHONDONTWRITEBYTECODE".to_string(), "1".to_string())]);
    }
}
