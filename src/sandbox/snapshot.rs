//! Base-tree copying and digesting.

use std::fs;
use std::io;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

/// Copies `src` into `dst`, preserving symlinks as symlinks and file modes.
///
/// `dst` is created if missing. Nothing under `src` is modified.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<u64> {
    fs::create_dir_all(dst)?;
    let mut files = 0u64;

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            symlink(&link, &target)?;
            files += 1;
        } else {
            fs::copy(entry.path(), &target)?;
            files += 1;
        }
    }

    Ok(files)
}

#[cfg(unix)]
fn symlink(original: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(original, link)
}

#[cfg(not(unix))]
fn symlink(_original: &Path, link: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot recreate symlink {}", link.display()),
    ))
}

/// Computes a SHA-256 digest of a directory tree.
///
/// The digest covers sorted relative paths, entry kinds, file contents and
/// symlink targets; timestamps and modes are ignored.
pub fn tree_digest(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();

    for entry in WalkDir::new(root)
        .follow_links(false)
        .min_depth(1)
        .sort_by_file_name()
    {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let rel = rel.to_string_lossy().replace('\\', "/");
        let file_type = entry.file_type();

        if file_type.is_dir() {
            hasher.update(b"d\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            hasher.update(b"l\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update(link.to_string_lossy().as_bytes());
            hasher.update(b"\0");
        } else {
            let content = fs::read(entry.path())?;
            hasher.update(b"f\0");
            hasher.update(rel.as_bytes());
            hasher.update(b"\0");
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
        }
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("app/nested")).unwrap();
        fs::write(root.join("app/settings.py"), "DEBUG = False\n").unwrap();
        fs::write(root.join("app/nested/data.json"), "{}").unwrap();
        fs::write(root.join("README.md"), "readme").unwrap();
    }

    #[test]
    fn test_copy_tree_copies_everything() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        populate(src.path());

        let copied = copy_tree(src.path(), &dst.path().join("workspace")).unwrap();

        assert_eq!(copied, 3);
        let content = fs::read_to_string(dst.path().join("workspace/app/settings.py")).unwrap();
        assert_eq!(content, "DEBUG = False\n");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_preserves_symlinks() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        populate(src.path());
        std::os::unix::fs::symlink("README.md", src.path().join("link.md")).unwrap();

        copy_tree(src.path(), dst.path()).unwrap();

        let meta = fs::symlink_metadata(dst.path().join("link.md")).unwrap();
        assert!(meta.file_type().is_symlink());
        assert_eq!(
            fs::read_link(dst.path().join("link.md")).unwrap(),
            Path::new("README.md")
        );
    }

    #[test]
    fn test_tree_digest_is_stable_and_content_sensitive() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        populate(a.path());
        populate(b.path());

        let da = tree_digest(a.path()).unwrap();
        assert_eq!(da, tree_digest(b.path()).unwrap());
        assert_eq!(da.len(), 64);

        fs::write(b.path().join("README.md"), "changed").unwrap();
        assert_ne!(da, tree_digest(b.path()).unwrap());
    }
}
