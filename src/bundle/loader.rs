//! Bundle discovery and structural validation.

use std::fs;
use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::types::{ReferenceSolution, TaskBundle, TaskConfig};
use crate::error::BundleError;
use crate::mutation::EditOp;
use crate::verifier::CHECK_TYPES;

pub const TASK_FILE: &str = "task.yaml";
pub const INSTRUCTION_FILE: &str = "instruction.md";
pub const EDITS_FILE: &str = "solution/edits.yaml";
pub const SOLVE_SCRIPT: &str = "solution/solve.sh";
pub const TEST_ENTRY: &str = "tests/test.sh";

/// Upper bound for any timeout in `task.yaml`.
pub const MAX_TIMEOUT_SECS: f64 = u32::MAX as f64;

/// Loads and validates the bundle at `task_path`.
///
/// Read-only: nothing under the bundle (including its base project) is
/// modified.
pub fn load_bundle(task_path: &Path) -> Result<TaskBundle, BundleError> {
    if !task_path.is_dir() {
        return Err(BundleError::malformed(task_path, "not a directory"));
    }
    let root = task_path.canonicalize()?;

    let config = read_task_config(&root)?;
    let id = bundle_id(&root, config.id.as_deref());
    validate_slug(&root, &id)?;
    validate_config(&root, &config)?;

    let instruction = read_required(&root, INSTRUCTION_FILE)?;
    if instruction.trim().is_empty() {
        return Err(BundleError::malformed(&root, "instruction.md is empty"));
    }

    let solution = read_solution(&root)?;

    if !root.join(TEST_ENTRY).is_file() {
        return Err(BundleError::malformed(
            &root,
            format!("missing verification entry point {}", TEST_ENTRY),
        ));
    }

    debug!(task_id = %id, path = %root.display(), "Loaded bundle");

    Ok(TaskBundle {
        id,
        root,
        instruction,
        config,
        solution,
    })
}

/// The declared `id`, or the directory name when `task.yaml` has none.
fn bundle_id(root: &Path, declared: Option<&str>) -> String {
    match declared {
        Some(id) => id.to_string(),
        None => root
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default(),
    }
}

fn read_required(root: &Path, name: &str) -> Result<String, BundleError> {
    let path = root.join(name);
    if !path.is_file() {
        return Err(BundleError::malformed(root, format!("missing {}", name)));
    }
    Ok(fs::read_to_string(path)?)
}

fn read_task_config(root: &Path) -> Result<TaskConfig, BundleError> {
    let content = read_required(root, TASK_FILE)?;
    serde_yaml::from_str(&content)
        .map_err(|e| BundleError::malformed(root, format!("invalid {}: {}", TASK_FILE, e)))
}

fn read_solution(root: &Path) -> Result<ReferenceSolution, BundleError> {
    let edits_path = root.join(EDITS_FILE);
    let script_path = root.join(SOLVE_SCRIPT);

    if edits_path.is_file() {
        let content = fs::read_to_string(&edits_path)?;
        let ops: Vec<EditOp> = serde_yaml::from_str(&content).map_err(|e| {
            BundleError::malformed(root, format!("invalid {}: {}", EDITS_FILE, e))
        })?;
        if ops.is_empty() {
            return Err(BundleError::malformed(
                root,
                format!("{} contains no edits", EDITS_FILE),
            ));
        }
        for (idx, op) in ops.iter().enumerate() {
            op.validate().map_err(|e| {
                BundleError::malformed(root, format!("{} edit #{}: {}", EDITS_FILE, idx + 1, e))
            })?;
        }
        if script_path.is_file() {
            warn!(path = %root.display(), "Both edits.yaml and solve.sh present; using edits.yaml");
        }
        return Ok(ReferenceSolution::Edits(ops));
    }

    if script_path.is_file() {
        return Ok(ReferenceSolution::Script(script_path));
    }

    Err(BundleError::malformed(
        root,
        format!("missing reference solution ({} or {})", EDITS_FILE, SOLVE_SCRIPT),
    ))
}

fn validate_slug(root: &Path, id: &str) -> Result<(), BundleError> {
    if id.is_empty()
        || !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(BundleError::malformed(
            root,
            format!(
                "invalid task id '{}': must be non-empty and contain only alphanumeric characters, hyphens, and underscores",
                id
            ),
        ));
    }
    Ok(())
}

fn validate_config(root: &Path, config: &TaskConfig) -> Result<(), BundleError> {
    let timeouts = [
        ("verifier.timeout_sec", config.verifier.timeout_sec),
        ("agent.timeout_sec", config.agent.timeout_sec),
        ("solution.timeout_sec", config.solution.timeout_sec),
    ];
    for (key, value) in timeouts {
        if !(value > 0.0 && value <= MAX_TIMEOUT_SECS) {
            return Err(BundleError::malformed(
                root,
                format!(
                    "{} must be a positive number of seconds up to {}, got {}",
                    key, MAX_TIMEOUT_SECS, value
                ),
            ));
        }
    }

    if config.agent.max_steps == 0 {
        return Err(BundleError::malformed(root, "agent.max_steps must be > 0"));
    }

    if config.verifier.command.trim().is_empty() {
        return Err(BundleError::malformed(root, "verifier.command is empty"));
    }

    let base = &config.environment.base;
    if base.is_absolute()
        || base
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(BundleError::malformed(
            root,
            "environment.base must be a path inside the bundle root",
        ));
    }

    if !config.environment.mount_point.starts_with('/') {
        return Err(BundleError::malformed(
            root,
            "environment.mount_point must be an absolute path",
        ));
    }

    if let Some(digest) = &config.environment.digest {
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(BundleError::malformed(
                root,
                "environment.digest must be a 64-character hex SHA-256",
            ));
        }
    }

    for check in &config.verifier.checks {
        if !CHECK_TYPES.contains(&check.check_type.as_str()) {
            return Err(BundleError::malformed(
                root,
                format!("unknown check type '{}'", check.check_type),
            ));
        }
        if check.target.trim().is_empty() {
            return Err(BundleError::malformed(
                root,
                format!("check '{}' has an empty target", check.check_id),
            ));
        }
        if check.check_type == "regex_match" {
            Regex::new(&check.expected).map_err(|e| {
                BundleError::malformed(root, format!("check '{}': {}", check.check_id, e))
            })?;
        }
    }

    Ok(())
}

/// A bundle found during discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    /// Same id [`load_bundle`] would report: `task.yaml`'s `id`, else the
    /// directory name.
    pub id: String,
    /// Path to the bundle directory.
    pub path: PathBuf,
}

/// Lazy listing of the bundles under a root directory.
///
/// Each call to [`BundleListing::iter`] walks the tree again, so a listing
/// can be iterated any number of times.
#[derive(Debug, Clone)]
pub struct BundleListing {
    root: PathBuf,
}

/// Lists bundle identifiers found under `root`.
pub fn list_bundles(root: &Path) -> Result<BundleListing, BundleError> {
    if !root.is_dir() {
        return Err(BundleError::RootNotFound(root.to_path_buf()));
    }
    Ok(BundleListing {
        root: root.to_path_buf(),
    })
}

impl BundleListing {
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn iter(&self) -> BundleIter {
        BundleIter {
            inner: WalkDir::new(&self.root).follow_links(false).into_iter(),
        }
    }
}

impl<'a> IntoIterator for &'a BundleListing {
    type Item = Result<BundleEntry, BundleError>;
    type IntoIter = BundleIter;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

/// Iterator over bundle directories, in directory-traversal order.
pub struct BundleIter {
    inner: walkdir::IntoIter,
}

impl Iterator for BundleIter {
    type Item = Result<BundleEntry, BundleError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.inner.next()? {
                Ok(entry) => entry,
                Err(e) => return Some(Err(BundleError::Io(e.into()))),
            };
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.depth() > 0 && name.starts_with('.') {
                self.inner.skip_current_dir();
                continue;
            }
            let task_file = entry.path().join(TASK_FILE);
            if task_file.is_file() {
                // A bundle's own subdirectories never hold further bundles.
                self.inner.skip_current_dir();
                let declared = declared_id(&task_file);
                return Some(Ok(BundleEntry {
                    id: bundle_id(entry.path(), declared.as_deref()),
                    path: entry.into_path(),
                }));
            }
        }
    }
}

#[derive(Deserialize)]
struct DeclaredId {
    #[serde(default)]
    id: Option<String>,
}

/// Reads only the `id` key; unreadable files fall back to the directory
/// name and are reported by [`load_bundle`].
fn declared_id(task_file: &Path) -> Option<String> {
    let content = fs::read_to_string(task_file).ok()?;
    serde_yaml::from_str::<DeclaredId>(&content).ok()?.id
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn create_bundle(root: &Path) {
        write(root, TASK_FILE, "metadata:\n  difficulty: easy\n  category: config\n");
        write(root, INSTRUCTION_FILE, "Set the port to 8080.");
        write(
            root,
            EDITS_FILE,
            "- op: replace\n  path: app.yaml\n  old: \"port: 8081\"\n  new: \"port: 8080\"\n",
        );
        write(root, TEST_ENTRY, "grep -q 'port: 8080' app.yaml\n");
        write(root, "environment/app.yaml", "port: 8081\n");
    }

    #[test]
    fn test_load_valid_bundle() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("set-port");
        create_bundle(&dir);

        let bundle = load_bundle(&dir).unwrap();
        assert_eq!(bundle.id, "set-port");
        assert_eq!(bundle.instruction, "Set the port to 8080.");
        assert!(matches!(bundle.solution, ReferenceSolution::Edits(ref ops) if ops.len() == 1));
        assert_eq!(bundle.config.verifier.timeout_sec, 120.0);
    }

    #[test]
    fn test_missing_instruction_is_malformed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("task");
        create_bundle(&dir);
        fs::remove_file(dir.join(INSTRUCTION_FILE)).unwrap();

        let err = load_bundle(&dir).unwrap_err();
        assert!(matches!(err, BundleError::MalformedBundle { .. }));
        assert!(err.to_string().contains("instruction.md"));
    }

    #[test]
    fn test_missing_solution_is_malformed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("task");
        create_bundle(&dir);
        fs::remove_file(dir.join(EDITS_FILE)).unwrap();

        let err = load_bundle(&dir).unwrap_err();
        assert!(err.to_string().contains("reference solution"));
    }

    #[test]
    fn test_solve_script_accepted() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("task");
        create_bundle(&dir);
        fs::remove_file(dir.join(EDITS_FILE)).unwrap();
        write(&dir, SOLVE_SCRIPT, "sed -i 's/8081/8080/' app.yaml\n");

        let bundle = load_bundle(&dir).unwrap();
        assert!(matches!(bundle.solution, ReferenceSolution::Script(_)));
    }

    #[test]
    fn test_missing_test_entry_is_malformed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("task");
        create_bundle(&dir);
        fs::remove_file(dir.join(TEST_ENTRY)).unwrap();

        let err = load_bundle(&dir).unwrap_err();
        assert!(err.to_string().contains("tests/test.sh"));
    }

    #[test]
    fn test_non_positive_timeout_is_malformed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("task");
        create_bundle(&dir);
        write(&dir, TASK_FILE, "verifier:\n  timeout_sec: 0\n");

        let err = load_bundle(&dir).unwrap_err();
        assert!(err.to_string().contains("verifier.timeout_sec"));
    }

    #[test]
    fn test_unbounded_timeout_is_malformed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("task");
        create_bundle(&dir);
        write(&dir, TASK_FILE, "verifier:\n  timeout_sec: 1.0e19\n");

        let err = load_bundle(&dir).unwrap_err();
        assert!(matches!(err, BundleError::MalformedBundle { .. }));
        assert!(err.to_string().contains("verifier.timeout_sec"));
    }

    #[test]
    fn test_base_outside_bundle_is_malformed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("task");
        create_bundle(&dir);
        fs::create_dir_all(temp.path().join("elsewhere")).unwrap();
        write(&dir, TASK_FILE, "environment:\n  base: ../elsewhere\n");

        let err = load_bundle(&dir).unwrap_err();
        assert!(err.to_string().contains("environment.base"));
    }

    #[test]
    fn test_listing_id_matches_loaded_id() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("dir-name");
        create_bundle(&dir);
        write(&dir, TASK_FILE, "id: declared-id\n");

        let listing = list_bundles(temp.path()).unwrap();
        let entries: Vec<BundleEntry> = listing.iter().map(|e| e.unwrap()).collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "declared-id");
        assert_eq!(load_bundle(&entries[0].path).unwrap().id, entries[0].id);
    }

    #[test]
    fn test_invalid_slug_is_malformed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("task");
        create_bundle(&dir);
        write(&dir, TASK_FILE, "id: \"bad id!\"\n");

        assert!(load_bundle(&dir).is_err());
    }

    #[test]
    fn test_replace_with_empty_target_is_malformed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("task");
        create_bundle(&dir);
        write(
            &dir,
            EDITS_FILE,
            "- op: replace\n  path: app.yaml\n  old: \"\"\n  new: x\n",
        );

        let err = load_bundle(&dir).unwrap_err();
        assert!(err.to_string().contains("edit #1"));
    }

    #[test]
    fn test_list_bundles_is_restartable() {
        let temp = TempDir::new().unwrap();
        create_bundle(&temp.path().join("swe/task-a"));
        create_bundle(&temp.path().join("infra/task-b"));
        fs::create_dir_all(temp.path().join("not-a-task")).unwrap();

        let listing = list_bundles(temp.path()).unwrap();
        let mut first: Vec<String> = listing.iter().map(|e| e.unwrap().id).collect();
        let mut second: Vec<String> = listing.iter().map(|e| e.unwrap().id).collect();
        first.sort();
        second.sort();

        assert_eq!(first, vec!["task-a".to_string(), "task-b".to_string()]);
        assert_eq!(first, second);
    }

    #[test]
    fn test_unknown_check_type_is_malformed() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("task");
        create_bundle(&dir);
        write(
            &dir,
            TASK_FILE,
            "verifier:\n  checks:\n    - check_type: line_count\n      target: app.yaml\n",
        );

        let err = load_bundle(&dir).unwrap_err();
        assert!(err.to_string().contains("unknown check type"));
    }

    #[test]
    fn test_list_bundles_missing_root() {
        let err = list_bundles(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, BundleError::RootNotFound(_)));
    }
}
