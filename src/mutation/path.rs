//! Confinement of edit paths to the sandbox root.

use std::path::{Component, Path, PathBuf};

use crate::error::EditError;

/// Resolves `path` against `root`, rejecting anything that escapes it.
///
/// Relative paths are joined to the root; absolute paths are accepted only
/// when they already lie under the root. `..` components are resolved
/// lexically and may not climb above the root. The deepest existing ancestor
/// is then canonicalized so that symlinks pointing outside the root are
/// rejected too.
pub fn resolve_in_root(root: &Path, path: &str) -> Result<PathBuf, EditError> {
    if path.trim().is_empty() {
        return Err(EditError::InvalidEdit("path cannot be empty".to_string()));
    }
    if path.contains('\0') {
        return Err(EditError::InvalidEdit(
            "path contains a null character".to_string(),
        ));
    }

    let canonical_root = root.canonicalize()?;
    let requested = Path::new(path);
    let relative = if requested.is_absolute() {
        requested
            .strip_prefix(&canonical_root)
            .or_else(|_| requested.strip_prefix(root))
            .map_err(|_| EditError::PathViolation(path.to_string()))?
    } else {
        requested
    };

    let mut normalized = PathBuf::new();
    for component in relative.components() {
        match component {
            Component::CurDir => {}
            Component::Normal(part) => normalized.push(part),
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(EditError::PathViolation(path.to_string()));
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(EditError::PathViolation(path.to_string()));
            }
        }
    }

    let resolved = canonical_root.join(&normalized);
    let mut existing = resolved.as_path();
    while !existing.exists() && existing.symlink_metadata().is_err() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => break,
        }
    }
    if let Ok(real) = existing.canonicalize() {
        if !real.starts_with(&canonical_root) {
            return Err(EditError::PathViolation(path.to_string()));
        }
    } else if existing.symlink_metadata().is_ok() {
        // Dangling symlink: its target cannot be checked, so refuse it.
        return Err(EditError::PathViolation(path.to_string()));
    }

    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_relative_paths_resolve_inside_root() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("app")).unwrap();

        let resolved = resolve_in_root(temp.path(), "app/settings.py").unwrap();
        assert!(resolved.ends_with("app/settings.py"));

        let resolved = resolve_in_root(temp.path(), "./app/../app/new.py").unwrap();
        assert!(resolved.ends_with("app/new.py"));
    }

    #[test]
    fn test_parent_traversal_is_rejected() {
        let temp = TempDir::new().unwrap();

        let err = resolve_in_root(temp.path(), "../outside.txt").unwrap_err();
        assert!(matches!(err, EditError::PathViolation(_)));

        let err = resolve_in_root(temp.path(), "app/../../etc/passwd").unwrap_err();
        assert!(matches!(err, EditError::PathViolation(_)));
    }

    #[test]
    fn test_absolute_paths_outside_root_are_rejected() {
        let temp = TempDir::new().unwrap();

        let err = resolve_in_root(temp.path(), "/etc/passwd").unwrap_err();
        assert!(matches!(err, EditError::PathViolation(_)));

        let inside = temp.path().canonicalize().unwrap().join("file.txt");
        let resolved = resolve_in_root(temp.path(), inside.to_str().unwrap()).unwrap();
        assert_eq!(resolved, inside);
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_rejected() {
        let temp = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        std::os::unix::fs::symlink(outside.path(), temp.path().join("escape")).unwrap();

        let err = resolve_in_root(temp.path(), "escape/secret.txt").unwrap_err();
        assert!(matches!(err, EditError::PathViolation(_)));
    }

    #[test]
    fn test_empty_path_is_invalid() {
        let temp = TempDir::new().unwrap();
        let err = resolve_in_root(temp.path(), "  ").unwrap_err();
        assert!(matches!(err, EditError::InvalidEdit(_)));
    }
}
