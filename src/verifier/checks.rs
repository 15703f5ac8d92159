//! Declarative structural checks declared in `task.yaml`.
//!
//! Checks inspect file content and structure inside the sandbox tree; the
//! only check that executes anything is `command_succeeds`.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::mutation::config_patch::{lookup, ConfigFormat};
use crate::mutation::resolve_in_root;
use crate::sandbox::SandboxHandle;

/// Check types understood by the verifier.
pub const CHECK_TYPES: &[&str] = &[
    "file_exists",
    "file_not_exists",
    "file_contains",
    "file_not_contains",
    "regex_match",
    "json_valid",
    "yaml_valid",
    "config_value",
    "command_succeeds",
];

/// Result of a single check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Unique identifier for this check.
    pub check_id: String,
    /// Type of check performed.
    pub check_type: String,
    /// Whether the check passed.
    pub passed: bool,
    /// Expected value/pattern.
    pub expected: String,
    /// Actual value found.
    pub actual: String,
    /// Human-readable description.
    pub description: String,
    /// Error message if check failed.
    pub error: Option<String>,
}

impl CheckResult {
    /// Creates a passed check result.
    pub fn pass(
        check_id: impl Into<String>,
        check_type: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            check_id: check_id.into(),
            check_type: check_type.into(),
            passed: true,
            expected: String::new(),
            actual: String::new(),
            description: description.into(),
            error: None,
        }
    }

    /// Creates a failed check result.
    pub fn fail(
        check_id: impl Into<String>,
        check_type: impl Into<String>,
        description: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            check_id: check_id.into(),
            check_type: check_type.into(),
            passed: false,
            expected: String::new(),
            actual: String::new(),
            description: description.into(),
            error: Some(error.into()),
        }
    }

    /// Sets the expected and actual values.
    pub fn with_values(mut self, expected: impl Into<String>, actual: impl Into<String>) -> Self {
        self.expected = expected.into();
        self.actual = actual.into();
        self
    }
}

/// Check specification from task.yaml.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    /// Unique identifier; defaults to `check-<n>`.
    #[serde(default)]
    pub check_id: String,
    /// Type of check, one of [`CHECK_TYPES`].
    pub check_type: String,
    /// Target (file path relative to the sandbox root, or a command).
    pub target: String,
    /// Expected value, pattern or dotted key.
    #[serde(default)]
    pub expected: String,
    /// Expected scalar for `config_value` checks.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
    /// Description of what this checks.
    #[serde(default)]
    pub description: String,
}

impl CheckSpec {
    pub fn new(
        check_type: impl Into<String>,
        target: impl Into<String>,
        expected: impl Into<String>,
    ) -> Self {
        Self {
            check_id: String::new(),
            check_type: check_type.into(),
            target: target.into(),
            expected: expected.into(),
            value: None,
            description: String::new(),
        }
    }

    pub fn with_value(mut self, value: serde_json::Value) -> Self {
        self.value = Some(value);
        self
    }
}

/// Runs one check against a sandbox.
pub async fn run_check(
    handle: &SandboxHandle,
    check_id: &str,
    check: &CheckSpec,
    timeout: Duration,
) -> CheckResult {
    if check.check_type == "command_succeeds" {
        return check_command_succeeds(handle, check_id, check, timeout).await;
    }
    evaluate_file_check(handle.root(), check_id, check)
}

/// Evaluates any check that only reads files under `root`.
pub fn evaluate_file_check(root: &Path, check_id: &str, check: &CheckSpec) -> CheckResult {
    let kind = check.check_type.as_str();
    let path = match resolve_in_root(root, &check.target) {
        Ok(path) => path,
        Err(e) => return CheckResult::fail(check_id, kind, &check.description, e.to_string()),
    };

    match kind {
        "file_exists" | "file_not_exists" => {
            let exists = path.exists();
            let expected = kind == "file_exists";
            let result = if exists == expected {
                CheckResult::pass(check_id, kind, &check.description)
            } else if expected {
                CheckResult::fail(
                    check_id,
                    kind,
                    &check.description,
                    format!("File not found: {}", check.target),
                )
            } else {
                CheckResult::fail(
                    check_id,
                    kind,
                    &check.description,
                    format!("File should not exist: {}", check.target),
                )
            };
            result.with_values(format!("exists={}", expected), format!("exists={}", exists))
        }
        "file_contains" => match read_text(&path) {
            Ok(content) if content.contains(&check.expected) => {
                CheckResult::pass(check_id, kind, &check.description)
                    .with_values(&check.expected, "[found]")
            }
            Ok(_) => CheckResult::fail(
                check_id,
                kind,
                &check.description,
                format!("Pattern '{}' not found in {}", check.expected, check.target),
            )
            .with_values(&check.expected, "[not found]"),
            Err(e) => read_failure(check_id, kind, check, e),
        },
        "file_not_contains" => match read_text(&path) {
            Ok(content) if content.contains(&check.expected) => CheckResult::fail(
                check_id,
                kind,
                &check.description,
                format!("Forbidden pattern '{}' found in {}", check.expected, check.target),
            )
            .with_values(format!("not '{}'", check.expected), "[found]"),
            Ok(_) => CheckResult::pass(check_id, kind, &check.description)
                .with_values(format!("not '{}'", check.expected), "[not found]"),
            // A missing file cannot contain the pattern.
            Err(e) if e.kind() == ErrorKind::NotFound => {
                CheckResult::pass(check_id, kind, &check.description)
                    .with_values(format!("not '{}'", check.expected), "[missing]")
            }
            Err(e) => read_failure(check_id, kind, check, e),
        },
        "regex_match" => match read_text(&path) {
            Ok(content) => match Regex::new(&check.expected) {
                Ok(re) if re.is_match(&content) => {
                    CheckResult::pass(check_id, kind, &check.description)
                        .with_values(&check.expected, "[matches]")
                }
                Ok(_) => CheckResult::fail(check_id, kind, &check.description, "Pattern did not match")
                    .with_values(&check.expected, "[no match]"),
                Err(e) => CheckResult::fail(
                    check_id,
                    kind,
                    &check.description,
                    format!("Invalid regex: {}", e),
                ),
            },
            Err(e) => read_failure(check_id, kind, check, e),
        },
        "json_valid" | "yaml_valid" => {
            let format = if kind == "json_valid" {
                ConfigFormat::Json
            } else {
                ConfigFormat::Yaml
            };
            match fs::read_to_string(&path) {
                Ok(content) => match parse_strict(format, &content) {
                    Ok(_) => CheckResult::pass(check_id, kind, &check.description),
                    Err(e) => CheckResult::fail(check_id, kind, &check.description, e),
                },
                Err(e) => read_failure(check_id, kind, check, e),
            }
        }
        "config_value" => check_config_value(&path, check_id, check),
        other => CheckResult::fail(
            check_id,
            other,
            &check.description,
            format!("Unknown check type: {}", other),
        ),
    }
}

/// File content for substring and pattern checks. Invalid UTF-8 is
/// replaced rather than rejected, so a stray byte cannot hide a match.
fn read_text(path: &Path) -> std::io::Result<String> {
    fs::read(path).map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
}

fn read_failure(check_id: &str, kind: &str, check: &CheckSpec, err: std::io::Error) -> CheckResult {
    CheckResult::fail(
        check_id,
        kind,
        &check.description,
        format!("Failed to read {}: {}", check.target, err),
    )
}

/// Parses without the empty-document leniency of config patching.
fn parse_strict(format: ConfigFormat, content: &str) -> Result<serde_json::Value, String> {
    match format {
        ConfigFormat::Json => serde_json::from_str(content).map_err(|e| format!("Invalid JSON: {}", e)),
        ConfigFormat::Yaml => serde_yaml::from_str(content).map_err(|e| format!("Invalid YAML: {}", e)),
    }
}

/// Compares a dotted key in a JSON/YAML file with an expected scalar.
///
/// The expected value comes from `value` when set; otherwise `expected` is
/// compared against the rendered scalar.
fn check_config_value(path: &Path, check_id: &str, check: &CheckSpec) -> CheckResult {
    let kind = "config_value";
    let Some(format) = ConfigFormat::from_path(path) else {
        return CheckResult::fail(
            check_id,
            kind,
            &check.description,
            format!("Cannot infer config format of {}", check.target),
        );
    };
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => return read_failure(check_id, kind, check, e),
    };
    let doc = match parse_strict(format, &content) {
        Ok(doc) => doc,
        Err(e) => return CheckResult::fail(check_id, kind, &check.description, e),
    };

    let (key, expected) = match &check.value {
        Some(value) => (check.expected.as_str(), value.clone()),
        None => match check.expected.split_once('=') {
            Some((key, raw)) => (
                key.trim(),
                serde_json::Value::String(raw.trim().to_string()),
            ),
            None => {
                return CheckResult::fail(
                    check_id,
                    kind,
                    &check.description,
                    "config_value needs `expected: key=value` or `expected: key` with `value`",
                )
            }
        },
    };

    let Some(actual) = lookup(&doc, key) else {
        return CheckResult::fail(
            check_id,
            kind,
            &check.description,
            format!("Key '{}' not found in {}", key, check.target),
        )
        .with_values(render_scalar(&expected), "[missing]");
    };

    let matches = if check.value.is_some() {
        actual == &expected
    } else {
        render_scalar(actual) == render_scalar(&expected)
    };
    let result = if matches {
        CheckResult::pass(check_id, kind, &check.description)
    } else {
        CheckResult::fail(
            check_id,
            kind,
            &check.description,
            format!("Key '{}' has the wrong value", key),
        )
    };
    result.with_values(render_scalar(&expected), render_scalar(actual))
}

fn render_scalar(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn check_command_succeeds(
    handle: &SandboxHandle,
    check_id: &str,
    check: &CheckSpec,
    timeout: Duration,
) -> CheckResult {
    let kind = "command_succeeds";
    match handle.execute(&check.target, timeout).await {
        Ok(out) if out.success() => {
            CheckResult::pass(check_id, kind, &check.description).with_values("exit 0", "exit 0")
        }
        Ok(out) => CheckResult::fail(
            check_id,
            kind,
            &check.description,
            format!("Command exited with code {}", out.exit_code),
        )
        .with_values("exit 0", format!("exit {}", out.exit_code)),
        Err(e) => CheckResult::fail(
            check_id,
            kind,
            &check.description,
            format!("Failed to run command: {}", e),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_tree(dir: &Path) {
        fs::write(dir.join("output.txt"), "hello world\ntest line").unwrap();
        fs::write(dir.join("data.json"), r#"{"key": "value", "server": {"port": 8080}}"#).unwrap();
        fs::write(dir.join("config.yaml"), "server:\n  port: 8081\n  host: localhost\n").unwrap();
        fs::write(dir.join("broken.yaml"), "a: [1, 2\n").unwrap();
    }

    fn eval(root: &Path, spec: CheckSpec) -> CheckResult {
        evaluate_file_check(root, "c1", &spec)
    }

    #[test]
    fn test_file_exists_checks() {
        let temp = TempDir::new().unwrap();
        create_test_tree(temp.path());

        assert!(eval(temp.path(), CheckSpec::new("file_exists", "output.txt", "")).passed);
        assert!(!eval(temp.path(), CheckSpec::new("file_exists", "missing.txt", "")).passed);
        assert!(eval(temp.path(), CheckSpec::new("file_not_exists", "missing.txt", "")).passed);
        assert!(!eval(temp.path(), CheckSpec::new("file_not_exists", "output.txt", "")).passed);
    }

    #[test]
    fn test_contains_checks() {
        let temp = TempDir::new().unwrap();
        create_test_tree(temp.path());

        assert!(eval(temp.path(), CheckSpec::new("file_contains", "output.txt", "hello")).passed);
        assert!(!eval(temp.path(), CheckSpec::new("file_contains", "output.txt", "bye")).passed);
        assert!(eval(temp.path(), CheckSpec::new("file_not_contains", "output.txt", "bye")).passed);
        assert!(!eval(temp.path(), CheckSpec::new("file_not_contains", "output.txt", "hello")).passed);
        assert!(eval(temp.path(), CheckSpec::new("file_not_contains", "absent.txt", "x")).passed);
    }

    #[test]
    fn test_invalid_utf8_cannot_hide_content() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("settings.py"), b"DEBUG = True\n# \xff\n").unwrap();

        let forbidden = eval(temp.path(), CheckSpec::new("file_not_contains", "settings.py", "DEBUG = True"));
        assert!(!forbidden.passed);
        assert!(eval(temp.path(), CheckSpec::new("file_contains", "settings.py", "DEBUG = True")).passed);
        assert!(eval(temp.path(), CheckSpec::new("regex_match", "settings.py", r"DEBUG\s*=\s*True")).passed);
    }

    #[test]
    fn test_not_contains_fails_on_unreadable_target() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("settings.py")).unwrap();

        let result = eval(temp.path(), CheckSpec::new("file_not_contains", "settings.py", "DEBUG"));
        assert!(!result.passed);
        assert!(result.error.unwrap().contains("Failed to read"));
    }

    #[test]
    fn test_regex_and_validity_checks() {
        let temp = TempDir::new().unwrap();
        create_test_tree(temp.path());

        assert!(eval(temp.path(), CheckSpec::new("regex_match", "output.txt", r"^hello\s+world")).passed);
        assert!(eval(temp.path(), CheckSpec::new("json_valid", "data.json", "")).passed);
        assert!(!eval(temp.path(), CheckSpec::new("json_valid", "output.txt", "")).passed);
        assert!(eval(temp.path(), CheckSpec::new("yaml_valid", "config.yaml", "")).passed);
        assert!(!eval(temp.path(), CheckSpec::new("yaml_valid", "broken.yaml", "")).passed);
    }

    #[test]
    fn test_config_value_check() {
        let temp = TempDir::new().unwrap();
        create_test_tree(temp.path());

        let wrong = eval(
            temp.path(),
            CheckSpec::new("config_value", "config.yaml", "server.port").with_value(json!(8080)),
        );
        assert!(!wrong.passed);
        assert_eq!(wrong.actual, "8081");

        let right = eval(
            temp.path(),
            CheckSpec::new("config_value", "data.json", "server.port").with_value(json!(8080)),
        );
        assert!(right.passed);

        let shorthand = eval(
            temp.path(),
            CheckSpec::new("config_value", "config.yaml", "server.host=localhost"),
        );
        assert!(shorthand.passed);

        let missing = eval(
            temp.path(),
            CheckSpec::new("config_value", "config.yaml", "server.tls").with_value(json!(true)),
        );
        assert!(!missing.passed);
        assert_eq!(missing.actual, "[missing]");
    }

    #[test]
    fn test_target_outside_root_fails() {
        let temp = TempDir::new().unwrap();
        let result = eval(temp.path(), CheckSpec::new("file_exists", "../../etc/passwd", ""));
        assert!(!result.passed);
        assert!(result.error.unwrap().contains("escapes"));
    }

    #[test]
    fn test_unknown_check_type() {
        let temp = TempDir::new().unwrap();
        create_test_tree(temp.path());
        let result = eval(temp.path(), CheckSpec::new("line_count", "output.txt", "2"));
        assert!(!result.passed);
    }
}
