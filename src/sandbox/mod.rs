//! Sandbox runtime: one isolated, disposable execution context per run.
//!
//! Every run gets a private directory:
//!
//! ```text
//! <run_dir>/workspace                  exclusive copy of the base tree
//! <run_dir>/solution                   staged for oracle runs only
//! <run_dir>/tests                      staged when verification starts
//! <run_dir>/logs/verifier/reward.txt   reward artifact
//! ```
//!
//! Commands always run with the workspace as working directory. Nothing is
//! shared between handles, so concurrent runs of the same bundle cannot see
//! each other's writes.

pub mod config;
pub mod exec;
pub mod snapshot;

pub use config::{DockerOptions, Isolation, SandboxConfig};
pub use exec::ExecOutput;
pub use snapshot::{copy_tree, tree_digest};

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bundle::TaskBundle;
use crate::error::SandboxError;

/// Reward file location relative to the logs directory.
pub const REWARD_RELATIVE_PATH: &str = "verifier/reward.txt";

/// Fixed in-container locations used by the docker backend.
const CONTAINER_TESTS_DIR: &str = "/tests";
const CONTAINER_SOLUTION_DIR: &str = "/solution";
const CONTAINER_LOGS_DIR: &str = "/logs";

/// Host-side directories of one run.
#[derive(Debug, Clone)]
pub struct RunLayout {
    pub run_dir: PathBuf,
    pub workspace: PathBuf,
    pub tests: PathBuf,
    pub solution: PathBuf,
    pub logs: PathBuf,
}

impl RunLayout {
    fn new(run_dir: &Path) -> Self {
        Self {
            run_dir: run_dir.to_path_buf(),
            workspace: run_dir.join("workspace"),
            tests: run_dir.join("tests"),
            solution: run_dir.join("solution"),
            logs: run_dir.join("logs"),
        }
    }

    fn create(&self) -> std::io::Result<()> {
        for dir in [&self.workspace, &self.tests, &self.solution, &self.logs] {
            fs::create_dir_all(dir)?;
        }
        fs::create_dir_all(self.logs.join("verifier"))
    }

    pub fn reward_path(&self) -> PathBuf {
        self.logs.join(REWARD_RELATIVE_PATH)
    }
}

#[derive(Debug, Clone)]
enum Backend {
    Local,
    Docker { container: String, mount_point: String },
}

/// Provisions sandboxes according to a [`SandboxConfig`].
///
/// The runtime holds no per-run state; everything a run owns lives in its
/// [`SandboxHandle`].
#[derive(Debug, Clone)]
pub struct SandboxRuntime {
    config: SandboxConfig,
}

impl SandboxRuntime {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Materializes a fresh, exclusively-owned copy of the bundle's base tree.
    pub async fn provision(&self, bundle: &TaskBundle) -> Result<SandboxHandle, SandboxError> {
        let run_id = format!("run-{}", Uuid::new_v4());
        let base = bundle.base_dir();

        if !base.is_dir() {
            return Err(SandboxError::ProvisionError(format!(
                "base snapshot {} is missing",
                base.display()
            )));
        }

        fs::create_dir_all(&self.config.work_dir).map_err(|e| {
            SandboxError::ProvisionError(format!(
                "failed to create work dir {}: {}",
                self.config.work_dir.display(),
                e
            ))
        })?;

        let temp = tempfile::Builder::new()
            .prefix(&format!("{}-", bundle.id))
            .tempdir_in(&self.config.work_dir)
            .map_err(|e| SandboxError::ProvisionError(format!("failed to create run dir: {}", e)))?;
        let layout = RunLayout::new(temp.path());
        layout
            .create()
            .map_err(|e| SandboxError::ProvisionError(format!("failed to lay out run dir: {}", e)))?;

        let expected_digest = bundle.config.environment.digest.clone();
        let base_for_copy = base.clone();
        let workspace = layout.workspace.clone();
        let files = tokio::task::spawn_blocking(move || -> Result<u64, SandboxError> {
            if let Some(expected) = expected_digest {
                let actual = tree_digest(&base_for_copy).map_err(|e| {
                    SandboxError::ProvisionError(format!("failed to digest base snapshot: {}", e))
                })?;
                if !actual.eq_ignore_ascii_case(&expected) {
                    return Err(SandboxError::ProvisionError(format!(
                        "base snapshot is corrupt: digest {} does not match {}",
                        actual, expected
                    )));
                }
            }
            copy_tree(&base_for_copy, &workspace).map_err(|e| {
                SandboxError::ProvisionError(format!("failed to copy base snapshot: {}", e))
            })
        })
        .await
        .map_err(|e| SandboxError::ProvisionError(format!("copy task panicked: {}", e)))??;

        let backend = match self.config.isolation {
            Isolation::Local => Backend::Local,
            Isolation::Docker => {
                let container = format!("harbor-{}", run_id);
                let mount_point = bundle.config.environment.mount_point.clone();
                let image = bundle
                    .config
                    .environment
                    .image
                    .clone()
                    .unwrap_or_else(|| self.config.docker.default_image.clone());
                let args =
                    docker_run_args(&self.config.docker, &container, &image, &mount_point, &layout);
                debug!(run_id = %run_id, "docker {}", args.join(" "));
                start_container(&args).await?;
                Backend::Docker {
                    container,
                    mount_point,
                }
            }
        };

        info!(
            run_id = %run_id,
            task_id = %bundle.id,
            isolation = %self.config.isolation,
            files,
            "Provisioned sandbox at {}",
            layout.run_dir.display()
        );

        Ok(SandboxHandle {
            run_id,
            task_id: bundle.id.clone(),
            layout,
            backend,
            env_vars: self.config.env_vars.clone(),
            max_output_bytes: self.config.max_output_bytes,
            keep: self.config.keep_runs,
            temp: Some(temp),
        })
    }
}

/// Handle to one provisioned sandbox.
///
/// Call [`SandboxHandle::teardown`] on every exit path; dropping a live
/// handle still removes the run directory but logs a warning.
#[derive(Debug)]
pub struct SandboxHandle {
    pub run_id: String,
    pub task_id: String,
    layout: RunLayout,
    backend: Backend,
    env_vars: Vec<(String, String)>,
    max_output_bytes: usize,
    keep: bool,
    temp: Option<TempDir>,
}

impl SandboxHandle {
    /// Host path of the mutable project tree.
    pub fn root(&self) -> &Path {
        &self.layout.workspace
    }

    pub fn layout(&self) -> &RunLayout {
        &self.layout
    }

    /// Host path of the reward artifact.
    pub fn reward_path(&self) -> PathBuf {
        self.layout.reward_path()
    }

    pub fn is_active(&self) -> bool {
        self.temp.is_some()
    }

    /// Replaces the tests directory with the bundle's verification suite.
    ///
    /// Anything written to `$TESTS_DIR` before this call is discarded.
    pub fn stage_tests(&self, bundle: &TaskBundle) -> Result<(), SandboxError> {
        self.ensure_active()?;
        clear_dir(&self.layout.tests)?;
        copy_tree(&bundle.tests_dir(), &self.layout.tests)?;
        Ok(())
    }

    /// Replaces the solution directory with the bundle's reference solution.
    pub fn stage_solution(&self, bundle: &TaskBundle) -> Result<(), SandboxError> {
        self.ensure_active()?;
        clear_dir(&self.layout.solution)?;
        copy_tree(&bundle.solution_dir(), &self.layout.solution)?;
        Ok(())
    }

    /// Environment exposed to every command, with paths valid for the backend.
    fn command_env(&self) -> Vec<(String, String)> {
        let (root, tests, solution, logs) = match &self.backend {
            Backend::Local => (
                self.layout.workspace.display().to_string(),
                self.layout.tests.display().to_string(),
                self.layout.solution.display().to_string(),
                self.layout.logs.display().to_string(),
            ),
            Backend::Docker { mount_point, .. } => (
                mount_point.clone(),
                CONTAINER_TESTS_DIR.to_string(),
                CONTAINER_SOLUTION_DIR.to_string(),
                CONTAINER_LOGS_DIR.to_string(),
            ),
        };
        let reward = format!("{}/{}", logs, REWARD_RELATIVE_PATH);

        let mut env = vec![
            ("SANDBOX_ROOT".to_string(), root),
            ("TESTS_DIR".to_string(), tests),
            ("SOLUTION_DIR".to_string(), solution),
            ("LOGS_DIR".to_string(), logs),
            ("REWARD_FILE".to_string(), reward),
            ("HARBOR_RUN_ID".to_string(), self.run_id.clone()),
        ];
        env.extend(self.env_vars.iter().cloned());
        env
    }

    /// Runs `command` inside the sandbox with a hard wall-clock timeout.
    ///
    /// On timeout the command is killed and the call fails with
    /// [`SandboxError::TimeoutExceeded`] carrying the partial output. The tree
    /// may be partially mutated afterwards.
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        self.ensure_active()?;
        debug!(run_id = %self.run_id, timeout = ?timeout, "Executing: {}", command);

        let cmd = match &self.backend {
            Backend::Local => {
                let mut cmd = Command::new("bash");
                cmd.arg("-c")
                    .arg(command)
                    .current_dir(&self.layout.workspace)
                    .envs(self.command_env());
                cmd
            }
            Backend::Docker { container, .. } => {
                let mut cmd = Command::new("docker");
                cmd.args(docker_exec_args(container, &self.command_env(), command, timeout));
                cmd
            }
        };

        let result = exec::run_with_timeout(cmd, timeout, self.max_output_bytes).await;
        match &result {
            Ok(out) => debug!(
                run_id = %self.run_id,
                exit_code = out.exit_code,
                duration_ms = out.duration_ms,
                "Command finished"
            ),
            Err(e) => warn!(run_id = %self.run_id, "Command failed: {}", e),
        }
        result
    }

    /// Releases every resource held by the sandbox. Idempotent.
    pub async fn teardown(&mut self) -> Result<(), SandboxError> {
        let Some(temp) = self.temp.take() else {
            return Ok(());
        };

        let mut first_err = None;
        if let Backend::Docker { container, .. } = &self.backend {
            if let Err(e) = remove_container(container).await {
                warn!(run_id = %self.run_id, "Failed to remove container {}: {}", container, e);
                first_err = Some(e);
            }
        }

        if self.keep {
            let kept = temp.keep();
            info!(run_id = %self.run_id, "Kept run directory {}", kept.display());
        } else if let Err(e) = temp.close() {
            warn!(run_id = %self.run_id, "Failed to remove run directory: {}", e);
            first_err.get_or_insert(SandboxError::Io(e));
        }

        debug!(run_id = %self.run_id, "Sandbox torn down");
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn ensure_active(&self) -> Result<(), SandboxError> {
        if self.temp.is_none() {
            return Err(SandboxError::TornDown(self.run_id.clone()));
        }
        Ok(())
    }
}

impl Drop for SandboxHandle {
    fn drop(&mut self) {
        if self.temp.is_none() {
            return;
        }
        warn!(run_id = %self.run_id, "Sandbox was not torn down properly");
        if let Backend::Docker { container, .. } = &self.backend {
            let _ = std::process::Command::new("docker")
                .args(["rm", "-f", container])
                .output();
        }
        // TempDir removes the run directory when dropped.
    }
}

/// Empties `dir` in place. The directory itself is kept so that bind mounts
/// into a running container stay attached.
fn clear_dir(dir: &Path) -> std::io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)?;
        } else {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Builds `docker run` arguments for a run container.
fn docker_run_args(
    options: &DockerOptions,
    container: &str,
    image: &str,
    mount_point: &str,
    layout: &RunLayout,
) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--name".to_string(),
        container.to_string(),
        format!("--network={}", options.network_mode),
        format!("--memory={}m", options.memory_mb),
    ];
    if options.cpu_limit > 0.0 {
        args.push(format!("--cpus={}", options.cpu_limit));
    }

    let mounts = [
        (&layout.workspace, mount_point),
        (&layout.tests, CONTAINER_TESTS_DIR),
        (&layout.solution, CONTAINER_SOLUTION_DIR),
        (&layout.logs, CONTAINER_LOGS_DIR),
    ];
    for (host, container_path) in mounts {
        args.push("-v".to_string());
        args.push(format!("{}:{}", host.display(), container_path));
    }

    args.extend([
        "-w".to_string(),
        mount_point.to_string(),
        image.to_string(),
        "sleep".to_string(),
        "infinity".to_string(),
    ]);
    args
}

/// Builds `docker exec` arguments; the in-container `timeout` backs up the
/// host-side kill of the docker client.
fn docker_exec_args(
    container: &str,
    env: &[(String, String)],
    command: &str,
    timeout: Duration,
) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    for (key, value) in env {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.extend([
        container.to_string(),
        "timeout".to_string(),
        "-s".to_string(),
        "KILL".to_string(),
        format!("{:.3}", timeout.as_secs_f64()),
        "bash".to_string(),
        "-c".to_string(),
        command.to_string(),
    ]);
    args
}

async fn start_container(args: &[String]) -> Result<(), SandboxError> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|e| SandboxError::ProvisionError(format!("docker not available: {}", e)))?;
    if !output.status.success() {
        return Err(SandboxError::ProvisionError(format!(
            "failed to start container: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

async fn remove_container(container: &str) -> Result<(), SandboxError> {
    let output = Command::new("docker")
        .args(["rm", "-f", container])
        .output()
        .await
        .map_err(|e| SandboxError::Docker(e.to_string()))?;
    if !output.status.success() {
        return Err(SandboxError::Docker(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    Ok(())
}
