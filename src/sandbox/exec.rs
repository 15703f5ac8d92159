//! Process execution with captured output and a hard wall-clock timeout.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::SandboxError;

/// How long readers may keep draining pipes after the process is gone.
const READER_GRACE: Duration = Duration::from_millis(500);

const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Output of a command run inside a sandbox.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecOutput {
    /// Exit code; -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// True if either stream exceeded the capture limit.
    pub truncated: bool,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout followed by stderr, for diagnostics.
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    truncated: bool,
}

type SharedCapture = Arc<Mutex<Capture>>;

fn spawn_reader<R>(reader: Option<R>, capture: SharedCapture, limit: usize) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut reader = reader?;
    Some(tokio::spawn(async move {
        let mut chunk = [0u8; 8192];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let Ok(mut cap) = capture.lock() else { break };
                    let room = limit.saturating_sub(cap.bytes.len());
                    if n > room {
                        cap.truncated = true;
                    }
                    let take = n.min(room);
                    cap.bytes.extend_from_slice(&chunk[..take]);
                }
            }
        }
    }))
}

fn snapshot(capture: &SharedCapture) -> (String, bool) {
    match capture.lock() {
        Ok(cap) => {
            let mut text = String::from_utf8_lossy(&cap.bytes).to_string();
            if cap.truncated {
                text.push_str(TRUNCATION_MARKER);
            }
            (text, cap.truncated)
        }
        Err(_) => (String::new(), false),
    }
}

async fn join_readers(readers: Vec<JoinHandle<()>>) {
    for handle in readers {
        let abort = handle.abort_handle();
        if tokio::time::timeout(READER_GRACE, handle).await.is_err() {
            // A detached grandchild still holds the pipe open.
            abort.abort();
        }
    }
}

/// Kills every process in the group led by `pid`.
#[cfg(unix)]
fn kill_process_group(pid: u32) {
    // SAFETY: killpg only sends a signal; a stale group id yields ESRCH.
    let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
    if rc != 0 {
        debug!(pid, "killpg returned {}", std::io::Error::last_os_error());
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

/// Runs `cmd` to completion or until `timeout` elapses.
///
/// The command is placed in its own process group so that a timeout kills
/// every process it started. Output captured up to the kill is returned in
/// [`SandboxError::TimeoutExceeded`].
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
    max_output_bytes: usize,
) -> Result<ExecOutput, SandboxError> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| SandboxError::Spawn(e.to_string()))?;
    let pid = child.id();

    let stdout_cap = SharedCapture::default();
    let stderr_cap = SharedCapture::default();
    let readers: Vec<JoinHandle<()>> = [
        spawn_reader(child.stdout.take(), stdout_cap.clone(), max_output_bytes),
        spawn_reader(child.stderr.take(), stderr_cap.clone(), max_output_bytes),
    ]
    .into_iter()
    .flatten()
    .collect();

    let waited = tokio::time::timeout(timeout, child.wait()).await;

    // Background processes left behind by the command never outlive the call.
    if let Some(pid) = pid {
        kill_process_group(pid);
    }

    let status = match waited {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            join_readers(readers).await;
            return Err(SandboxError::Io(e));
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                warn!("Failed to kill timed-out process: {}", e);
            }
            None
        }
    };

    join_readers(readers).await;

    let (stdout, out_trunc) = snapshot(&stdout_cap);
    let (stderr, err_trunc) = snapshot(&stderr_cap);
    let output = ExecOutput {
        exit_code: status.and_then(|s| s.code()).unwrap_or(-1),
        stdout,
        stderr,
        duration_ms: start.elapsed().as_millis() as u64,
        truncated: out_trunc || err_trunc,
    };

    match status {
        Some(_) => Ok(output),
        None => Err(SandboxError::TimeoutExceeded {
            timeout,
            partial: Box::new(output),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bash(script: &str) -> Command {
        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn test_captures_stdout_stderr_and_exit_code() {
        let out = run_with_timeout(bash("echo out; echo err >&2; exit 3"), Duration::from_secs(10), 1024)
            .await
            .unwrap();

        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_timeout_kills_and_preserves_partial_output() {
        let start = Instant::now();
        let err = run_with_timeout(
            bash("echo started; sleep 30; echo never"),
            Duration::from_millis(300),
            1024,
        )
        .await
        .unwrap_err();

        assert!(start.elapsed() < Duration::from_secs(10));
        match err {
            SandboxError::TimeoutExceeded { partial, .. } => {
                assert!(partial.stdout.contains("started"));
                assert!(!partial.stdout.contains("never"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_output_is_truncated_at_limit() {
        let out = run_with_timeout(
            bash("head -c 5000 /dev/zero | tr '\\0' 'a'"),
            Duration::from_secs(10),
            100,
        )
        .await
        .unwrap();

        assert!(out.truncated);
        assert!(out.stdout.starts_with(&"a".repeat(100)));
        assert!(out.stdout.ends_with("[output truncated]"));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let cmd = Command::new("/nonexistent/binary/for/test");
        let err = run_with_timeout(cmd, Duration::from_secs(1), 1024)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Spawn(_)));
    }
}
