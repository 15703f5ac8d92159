//! Edit operations and the interpreter that applies them to a sandbox.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::config_patch::{patch_document, ConfigFormat};
use super::path::resolve_in_root;
use crate::error::{EditError, SandboxError};
use crate::sandbox::{ExecOutput, SandboxHandle};

/// Upper bound on file content returned to an agent.
pub const MAX_READ_BYTES: usize = 256 * 1024;

/// One file-level edit.
///
/// Every operation is a transformation of the current tree state; nothing is
/// cached between operations, so each edit validates against the content it
/// actually finds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditOp {
    /// Appends to a file, creating it if absent.
    Append { path: String, content: String },
    /// Replaces a file's entire content.
    Overwrite { path: String, content: String },
    /// Exact-substring replace; first occurrence unless `all` is set.
    Replace {
        path: String,
        old: String,
        new: String,
        #[serde(default)]
        all: bool,
    },
    /// Sets and removes dotted keys in a JSON or YAML file.
    ConfigPatch {
        path: String,
        #[serde(default)]
        format: Option<ConfigFormat>,
        #[serde(default)]
        set: BTreeMap<String, Value>,
        #[serde(default)]
        remove: Vec<String>,
    },
    /// Runs a build or migration step; non-zero exit fails the edit.
    Run {
        command: String,
        #[serde(default)]
        timeout_sec: Option<f64>,
    },
}

impl EditOp {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Append { .. } => "append",
            Self::Overwrite { .. } => "overwrite",
            Self::Replace { .. } => "replace",
            Self::ConfigPatch { .. } => "config_patch",
            Self::Run { .. } => "run",
        }
    }

    /// Target file, if the operation has one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Append { path, .. }
            | Self::Overwrite { path, .. }
            | Self::Replace { path, .. }
            | Self::ConfigPatch { path, .. } => Some(path),
            Self::Run { .. } => None,
        }
    }

    /// Short human-readable form for logs.
    pub fn describe(&self) -> String {
        match self {
            Self::Run { command, .. } => format!("run `{}`", truncate(command, 80)),
            other => format!("{} {}", other.kind(), other.path().unwrap_or_default()),
        }
    }

    /// Checks the operation's parameters without touching any tree.
    pub fn validate(&self) -> Result<(), EditError> {
        if let Some(path) = self.path() {
            if path.trim().is_empty() {
                return Err(EditError::InvalidEdit(format!("{}: path is empty", self.kind())));
            }
        }
        match self {
            Self::Replace { old, .. } if old.is_empty() => Err(EditError::InvalidEdit(
                "replace: target substring is empty".to_string(),
            )),
            Self::ConfigPatch {
                path,
                format,
                set,
                remove,
            } => {
                if set.is_empty() && remove.is_empty() {
                    return Err(EditError::InvalidEdit(
                        "config_patch: nothing to set or remove".to_string(),
                    ));
                }
                if format.is_none() && ConfigFormat::from_path(Path::new(path)).is_none() {
                    return Err(EditError::InvalidEdit(format!(
                        "config_patch: cannot infer format of '{}'",
                        path
                    )));
                }
                Ok(())
            }
            Self::Run {
                command,
                timeout_sec,
            } => {
                if command.trim().is_empty() {
                    return Err(EditError::InvalidEdit("run: command is empty".to_string()));
                }
                if let Some(secs) = timeout_sec {
                    if !secs.is_finite() || *secs <= 0.0 {
                        return Err(EditError::InvalidEdit(format!(
                            "run: timeout_sec must be positive, got {}",
                            secs
                        )));
                    }
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// Replaces `old` with `new` in `content`.
///
/// Matching is byte-exact, whitespace included. Only the first occurrence is
/// replaced unless `all` is set. Returns the new content and the number of
/// replacements, or `None` if `old` does not occur (or is empty).
pub fn replace_exact(content: &str, old: &str, new: &str, all: bool) -> Option<(String, usize)> {
    if old.is_empty() || !content.contains(old) {
        return None;
    }
    if all {
        let count = content.matches(old).count();
        Some((content.replace(old, new), count))
    } else {
        Some((content.replacen(old, new, 1), 1))
    }
}

/// Applies edit operations to one sandbox.
///
/// File operations act on the host view of the sandbox tree; `run` steps go
/// through [`SandboxHandle::execute`].
pub struct EditApplier<'a> {
    handle: &'a SandboxHandle,
    default_timeout: Duration,
}

impl<'a> EditApplier<'a> {
    pub fn new(handle: &'a SandboxHandle, default_timeout: Duration) -> Self {
        Self {
            handle,
            default_timeout,
        }
    }

    pub fn root(&self) -> &Path {
        self.handle.root()
    }

    /// Applies one operation and returns a one-line summary of its effect.
    pub async fn apply(&self, op: &EditOp) -> Result<String, EditError> {
        op.validate()?;
        debug!(run_id = %self.handle.run_id, "Applying {}", op.describe());

        match op {
            EditOp::Append { path, content } => self.append(path, content).await,
            EditOp::Overwrite { path, content } => self.write_file(path, content).await,
            EditOp::Replace { path, old, new, all } => {
                self.replace(path, old, new, *all).await
            }
            EditOp::ConfigPatch {
                path,
                format,
                set,
                remove,
            } => self.config_patch(path, *format, set, remove).await,
            EditOp::Run {
                command,
                timeout_sec,
            } => {
                let timeout = timeout_sec
                    .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                    .unwrap_or(self.default_timeout);
                let output = self.run(command, timeout).await?;
                if !output.success() {
                    return Err(EditError::StepFailed {
                        command: command.clone(),
                        exit_code: output.exit_code,
                        output: tail(&output.combined(), 2000),
                    });
                }
                Ok(format!("`{}` exited 0", truncate(command, 80)))
            }
        }
    }

    pub async fn read_file(&self, path: &str) -> Result<String, EditError> {
        let target = resolve_in_root(self.root(), path)?;
        if !is_file(&target).await {
            return Err(EditError::FileNotFound(path.to_string()));
        }
        let content = fs::read(&target).await?;
        let mut text = String::from_utf8_lossy(&content[..content.len().min(MAX_READ_BYTES)]).to_string();
        if content.len() > MAX_READ_BYTES {
            text.push_str("\n... [file truncated]");
        }
        Ok(text)
    }

    pub async fn write_file(&self, path: &str, content: &str) -> Result<String, EditError> {
        let target = resolve_in_root(self.root(), path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, content).await?;
        Ok(format!("wrote {} bytes to {}", content.len(), path))
    }

    pub async fn append(&self, path: &str, content: &str) -> Result<String, EditError> {
        let target = resolve_in_root(self.root(), path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&target)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        Ok(format!("appended {} bytes to {}", content.len(), path))
    }

    pub async fn replace(
        &self,
        path: &str,
        old: &str,
        new: &str,
        all: bool,
    ) -> Result<String, EditError> {
        if old.is_empty() {
            return Err(EditError::InvalidEdit(
                "replace: target substring is empty".to_string(),
            ));
        }
        let target = resolve_in_root(self.root(), path)?;
        if !is_file(&target).await {
            return Err(EditError::FileNotFound(path.to_string()));
        }
        let content = fs::read_to_string(&target).await?;
        let (updated, count) =
            replace_exact(&content, old, new, all).ok_or_else(|| EditError::NoMatch {
                path: path.to_string(),
                target: truncate(old, 120),
            })?;
        fs::write(&target, updated).await?;
        Ok(format!("replaced {} occurrence(s) in {}", count, path))
    }

    pub async fn config_patch(
        &self,
        path: &str,
        format: Option<ConfigFormat>,
        set: &BTreeMap<String, Value>,
        remove: &[String],
    ) -> Result<String, EditError> {
        let target = resolve_in_root(self.root(), path)?;
        let format = format
            .or_else(|| ConfigFormat::from_path(&target))
            .ok_or_else(|| {
                EditError::InvalidEdit(format!("config_patch: cannot infer format of '{}'", path))
            })?;
        let content = if is_file(&target).await {
            fs::read_to_string(&target).await?
        } else {
            String::new()
        };
        let patched = patch_document(&content, format, set, remove)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&target, patched).await?;
        Ok(format!(
            "patched {} ({} set, {} removed)",
            path,
            set.len(),
            remove.len()
        ))
    }

    /// Runs a command in the sandbox; the exit status is left to the caller.
    pub async fn run(&self, command: &str, timeout: Duration) -> Result<ExecOutput, SandboxError> {
        self.handle.execute(command, timeout).await
    }
}

async fn is_file(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_file()).unwrap_or(false)
}

/// Last `max_chars` characters of `s`.
pub(crate) fn tail(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        s.to_string()
    } else {
        let rest: String = s.chars().skip(count - max_chars).collect();
        format!("...{}", rest)
    }
}

pub(crate) fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_exact_first_occurrence_only() {
        let content = "a = 1\nb = 1\na = 1\n";
        let (updated, count) = replace_exact(content, "a = 1", "a = 2", false).unwrap();
        assert_eq!(count, 1);
        assert_eq!(updated, "a = 2\nb = 1\na = 1\n");
    }

    #[test]
    fn test_replace_exact_all() {
        let (updated, count) = replace_exact("x x x", "x", "y", true).unwrap();
        assert_eq!(count, 3);
        assert_eq!(updated, "y y y");
    }

    #[test]
    fn test_replace_exact_requires_verbatim_whitespace() {
        let content = "DEBUG = True\nALLOWED_HOSTS = []\n";
        assert!(replace_exact(content, "DEBUG = True  \n", "DEBUG = False\n", false).is_none());
        assert!(replace_exact(content, "DEBUG  = True", "DEBUG = False", false).is_none());
        assert!(replace_exact(content, "DEBUG = True\n", "DEBUG = False\n", false).is_some());
    }

    #[test]
    fn test_replace_exact_empty_target() {
        assert!(replace_exact("abc", "", "x", false).is_none());
    }

    #[test]
    fn test_edit_op_deserialize() {
        let yaml = r#"
- op: replace
  path: app/settings.py
  old: "DEBUG = True"
  new: "DEBUG = False"
- op: config_patch
  path: config.yaml
  set:
    server.port: 8080
- op: run
  command: python manage.py migrate
  timeout_sec: 60
"#;
        let ops: Vec<EditOp> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(ops.len(), 3);
        assert!(matches!(&ops[0], EditOp::Replace { all: false, .. }));
        assert_eq!(ops[1].kind(), "config_patch");
        assert!(matches!(&ops[2], EditOp::Run { timeout_sec: Some(t), .. } if *t == 60.0));
        assert!(ops.iter().all(|op| op.validate().is_ok()));
    }

    #[test]
    fn test_validate_rejects_bad_ops() {
        let empty_old = EditOp::Replace {
            path: "a.py".into(),
            old: String::new(),
            new: "x".into(),
            all: false,
        };
        assert!(matches!(empty_old.validate(), Err(EditError::InvalidEdit(_))));

        let unknown_format = EditOp::ConfigPatch {
            path: "nginx.conf".into(),
            format: None,
            set: BTreeMap::from([("a".to_string(), Value::from(1))]),
            remove: vec![],
        };
        assert!(unknown_format.validate().is_err());

        let bad_timeout = EditOp::Run {
            command: "make".into(),
            timeout_sec: Some(0.0),
        };
        assert!(bad_timeout.validate().is_err());
    }

    #[test]
    fn test_describe() {
        let op = EditOp::Append {
            path: "notes.txt".into(),
            content: "x".into(),
        };
        assert_eq!(op.describe(), "append notes.txt");
    }
}
